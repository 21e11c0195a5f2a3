//! Adapter value conversion: postfix arithmetic programs and enum label tables.
//!
//! A program such as `["self", 10.0, "/"]` is compiled once when the adapter
//! is loaded and evaluated on every state read (`conversion`) or write
//! (`inversion`). Operators pop the right-hand operand first, division by zero
//! yields zero, and the result is the bottom of the stack.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::value::FieldValue;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConversionError {
    #[error("Unknown token at position {position}: {token}")]
    UnknownToken { position: usize, token: String },

    #[error("Stack underflow at position {position}")]
    StackUnderflow { position: usize },

    #[error("Program must be a JSON array")]
    NotAProgram,
}

/// One compiled instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push the value being converted.
    Input,
    Push(f64),
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn parse(position: usize, token: &Value) -> Result<Self, ConversionError> {
        match token {
            Value::Number(n) => n.as_f64().map(Op::Push).ok_or_else(|| {
                ConversionError::UnknownToken {
                    position,
                    token: n.to_string(),
                }
            }),
            Value::String(s) => match s.as_str() {
                "self" => Ok(Op::Input),
                "+" => Ok(Op::Add),
                "-" => Ok(Op::Sub),
                "*" => Ok(Op::Mul),
                "/" => Ok(Op::Div),
                other => Err(ConversionError::UnknownToken {
                    position,
                    token: other.to_string(),
                }),
            },
            other => Err(ConversionError::UnknownToken {
                position,
                token: other.to_string(),
            }),
        }
    }

    fn is_binary(self) -> bool {
        matches!(self, Op::Add | Op::Sub | Op::Mul | Op::Div)
    }
}

/// Immutable, pre-validated instruction sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    ops: Vec<Op>,
}

impl Program {
    /// Compile a token list, rejecting unknown tokens and any sequence that
    /// would underflow the stack.
    pub fn compile(tokens: &[Value]) -> Result<Self, ConversionError> {
        let mut ops = Vec::with_capacity(tokens.len());
        let mut depth = 0usize;

        for (position, token) in tokens.iter().enumerate() {
            let op = Op::parse(position, token)?;
            if op.is_binary() {
                if depth < 2 {
                    return Err(ConversionError::StackUnderflow { position });
                }
                depth -= 1;
            } else {
                depth += 1;
            }
            ops.push(op);
        }

        Ok(Self { ops })
    }

    /// Compile from a raw JSON value, which must be an array.
    pub fn from_json(value: &Value) -> Result<Self, ConversionError> {
        match value {
            Value::Array(tokens) => Self::compile(tokens),
            _ => Err(ConversionError::NotAProgram),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Run the program. An empty program is the identity.
    pub fn evaluate(&self, input: f64) -> f64 {
        if self.ops.is_empty() {
            return input;
        }

        let mut stack: Vec<f64> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            match op {
                Op::Input => stack.push(input),
                Op::Push(v) => stack.push(*v),
                binary => {
                    // Depth was checked at compile time.
                    let (Some(rhs), Some(lhs)) = (stack.pop(), stack.pop()) else {
                        return input;
                    };
                    stack.push(match binary {
                        Op::Add => lhs + rhs,
                        Op::Sub => lhs - rhs,
                        Op::Mul => lhs * rhs,
                        Op::Div if rhs == 0.0 => 0.0,
                        _ => lhs / rhs,
                    });
                }
            }
        }

        stack.first().copied().unwrap_or(input)
    }
}

/// Display label ⇄ raw value table, kept in declaration order.
///
/// Tables are not required to be bijective. When two labels share a raw
/// value, forward lookup returns the first declared label; reverse lookup
/// by case-insensitive match also prefers the first declared label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelTable {
    entries: Vec<(String, FieldValue)>,
}

impl LabelTable {
    pub fn new(entries: Vec<(String, FieldValue)>) -> Self {
        Self { entries }
    }

    /// Build from an adapter `labels` object, skipping non-scalar values.
    pub fn from_json(labels: &Map<String, Value>) -> Self {
        let mut entries = Vec::with_capacity(labels.len());
        for (label, raw) in labels {
            match FieldValue::from_json(raw) {
                Some(value @ (FieldValue::Bool(_) | FieldValue::Int(_) | FieldValue::Float(_))) => {
                    entries.push((label.clone(), value))
                }
                _ => warn!(label = %label, "Skipping label with non-scalar raw value: {}", raw),
            }
        }
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Labels in declaration order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }

    /// Raw value → label. Numbers compare numerically; booleans only match booleans.
    pub fn label_for(&self, raw: &FieldValue) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, value)| value.loosely_eq(raw))
            .map(|(label, _)| label.as_str())
    }

    /// Label → raw value: exact match first, then case-insensitive.
    pub fn value_for(&self, label: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .or_else(|| {
                let wanted = label.to_lowercase();
                self.entries.iter().find(|(l, _)| l.to_lowercase() == wanted)
            })
            .map(|(_, value)| value)
    }
}
