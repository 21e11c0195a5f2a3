//! Mutual authentication with the hub (ECDH P-256 + AES-256-GCM + ECDSA).
//!
//! The hub does not run a standard key derivation: the raw ECDH x-coordinate
//! is used directly as the AES-256-GCM key, the challenge is sealed under an
//! all-zero IV, and the authentication payload is sealed under the first
//! twelve bytes of the decrypted challenge. All of this must match the hub
//! byte for byte.
//!
//! Handshake order:
//! 1. [`HubAuth::set_gateway_public_key`] with the hub's uncompressed point
//! 2. [`HubAuth::decrypt_challenge`] yields `dev_nonce`
//! 3. [`HubAuth::create_auth_payload`] signs `dev_nonce || user_nonce`
//! 4. [`HubAuth::verify_gateway_response`] checks the hub's signature over `user_nonce`

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use p256::PublicKey;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{debug, warn};

use crate::error::HandshakeError;

/// Length of the persisted user id.
pub const USER_ID_LEN: usize = 32;
/// Length of both handshake nonces.
pub const NONCE_LEN: usize = 32;
/// AES-GCM IV length.
const IV_LEN: usize = 12;
/// Length of a P-256 private scalar.
const SCALAR_LEN: usize = 32;

/// Per-connection secrets derived from the gateway key.
struct GatewaySession {
    verifying: VerifyingKey,
    cipher: Aes256Gcm,
}

/// Long-lived identity plus the state of the current handshake.
///
/// The keypair and user id are stable across reconnects and must be persisted
/// by the caller ([`HubAuth::private_key_hex`], [`HubAuth::user_id_b64`]).
/// Everything else is reset by [`HubAuth::set_gateway_public_key`].
pub struct HubAuth {
    signing: SigningKey,
    user_id: Vec<u8>,
    gateway: Option<GatewaySession>,
    dev_nonce: Option<Vec<u8>>,
    user_nonce: Option<[u8; NONCE_LEN]>,
}

impl std::fmt::Debug for HubAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubAuth")
            .field("user_id", &self.user_id_b64())
            .field("gateway_key_set", &self.gateway.is_some())
            .field("challenge_done", &self.dev_nonce.is_some())
            .finish_non_exhaustive()
    }
}

impl HubAuth {
    /// Load an existing identity, generating whichever half is missing.
    ///
    /// `private_key_hex` is the big-endian private scalar (leading zeros may
    /// be omitted); `user_id_b64` is the standard-base64 user id.
    pub fn new(
        private_key_hex: Option<&str>,
        user_id_b64: Option<&str>,
    ) -> Result<Self, HandshakeError> {
        let signing = match private_key_hex {
            Some(hex_key) => Self::load_private_key(hex_key)?,
            None => SigningKey::random(&mut OsRng),
        };

        let user_id = match user_id_b64 {
            Some(encoded) => {
                let decoded = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| HandshakeError::InvalidKey(format!("user id: {}", e)))?;
                if decoded.is_empty() {
                    return Err(HandshakeError::InvalidKey("user id is empty".to_string()));
                }
                decoded
            }
            None => {
                let mut id = vec![0u8; USER_ID_LEN];
                OsRng.fill_bytes(&mut id);
                id
            }
        };

        Ok(Self {
            signing,
            user_id,
            gateway: None,
            dev_nonce: None,
            user_nonce: None,
        })
    }

    /// Generate a brand-new identity.
    pub fn generate() -> Self {
        let mut user_id = vec![0u8; USER_ID_LEN];
        OsRng.fill_bytes(&mut user_id);
        Self {
            signing: SigningKey::random(&mut OsRng),
            user_id,
            gateway: None,
            dev_nonce: None,
            user_nonce: None,
        }
    }

    fn load_private_key(hex_key: &str) -> Result<SigningKey, HandshakeError> {
        let hex_key = hex_key.trim();
        let hex_key = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        // Odd-length input is a scalar with its leading zero nibble dropped.
        let normalized = if hex_key.len() % 2 == 1 {
            format!("0{}", hex_key)
        } else {
            hex_key.to_string()
        };
        let bytes = hex::decode(&normalized)
            .map_err(|e| HandshakeError::InvalidKey(format!("private key: {}", e)))?;
        if bytes.is_empty() || bytes.len() > SCALAR_LEN {
            return Err(HandshakeError::InvalidKey(format!(
                "private key must be 1..={} bytes, got {}",
                SCALAR_LEN,
                bytes.len()
            )));
        }

        let mut scalar = [0u8; SCALAR_LEN];
        scalar[SCALAR_LEN - bytes.len()..].copy_from_slice(&bytes);
        SigningKey::from_bytes(p256::FieldBytes::from_slice(&scalar))
            .map_err(|e| HandshakeError::InvalidKey(format!("private key: {}", e)))
    }

    /// Private scalar as 64 lowercase hex characters, for persistence.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// User id as standard base64, for persistence and the `challenge` call.
    pub fn user_id_b64(&self) -> String {
        STANDARD.encode(&self.user_id)
    }

    /// Public key as a 65-byte uncompressed SEC1 point.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Public key as base64, for the `addUser` registration call.
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key_bytes())
    }

    /// Install the gateway's public key and derive the AES key from raw ECDH.
    ///
    /// Starts a fresh handshake: any previous nonces are discarded.
    pub fn set_gateway_public_key(&mut self, point: &[u8]) -> Result<(), HandshakeError> {
        let public = PublicKey::from_sec1_bytes(point)
            .map_err(|_| HandshakeError::InvalidKey("gateway public key".to_string()))?;
        let verifying = VerifyingKey::from_sec1_bytes(point)
            .map_err(|_| HandshakeError::InvalidKey("gateway public key".to_string()))?;

        let shared = p256::ecdh::diffie_hellman(self.signing.as_nonzero_scalar(), public.as_affine());
        let cipher = Aes256Gcm::new_from_slice(shared.raw_secret_bytes().as_slice())
            .map_err(|_| HandshakeError::InvalidKey("shared secret length".to_string()))?;

        self.gateway = Some(GatewaySession { verifying, cipher });
        self.dev_nonce = None;
        self.user_nonce = None;
        debug!("Gateway public key installed");
        Ok(())
    }

    /// Decrypt the hub's challenge (IV = twelve zero bytes, no AAD).
    ///
    /// A tag failure means the hub does not know this user id / key pair and
    /// is reported as [`HandshakeError::UnknownUser`].
    pub fn decrypt_challenge(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder("gateway public key not set"))?;

        let dev_nonce = gateway
            .cipher
            .decrypt(Nonce::from_slice(&[0u8; IV_LEN]), ciphertext)
            .map_err(|_| HandshakeError::UnknownUser)?;

        if dev_nonce.len() < IV_LEN {
            return Err(HandshakeError::Protocol(format!(
                "challenge nonce too short: {} bytes",
                dev_nonce.len()
            )));
        }

        self.dev_nonce = Some(dev_nonce.clone());
        self.user_nonce = None;
        Ok(dev_nonce)
    }

    /// Build the sealed `authenticate` password: `AES-GCM(signature || user_nonce)`.
    pub fn create_auth_payload(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let mut user_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut user_nonce);
        self.seal_auth_payload(user_nonce)
    }

    fn seal_auth_payload(&mut self, user_nonce: [u8; NONCE_LEN]) -> Result<Vec<u8>, HandshakeError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder("gateway public key not set"))?;
        let dev_nonce = self
            .dev_nonce
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder("challenge not completed"))?;

        let mut message = Vec::with_capacity(dev_nonce.len() + NONCE_LEN);
        message.extend_from_slice(dev_nonce);
        message.extend_from_slice(&user_nonce);
        let signature: Signature = self.signing.sign(&message);
        let der = signature.to_der();

        let mut plaintext = Vec::with_capacity(der.as_bytes().len() + NONCE_LEN);
        plaintext.extend_from_slice(der.as_bytes());
        plaintext.extend_from_slice(&user_nonce);

        let sealed = gateway
            .cipher
            .encrypt(Nonce::from_slice(&dev_nonce[..IV_LEN]), plaintext.as_slice())
            .map_err(|_| HandshakeError::Protocol("auth payload encryption failed".to_string()))?;

        self.user_nonce = Some(user_nonce);
        Ok(sealed)
    }

    /// Check the hub's proof: a DER ECDSA signature over the `user_nonce` we sent,
    /// sealed under the same key and IV as our payload.
    ///
    /// Cryptographic failures return `Ok(false)`; only calling this before
    /// [`HubAuth::create_auth_payload`] is an error.
    pub fn verify_gateway_response(&self, ciphertext: &[u8]) -> Result<bool, HandshakeError> {
        let gateway = self
            .gateway
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder("gateway public key not set"))?;
        let dev_nonce = self
            .dev_nonce
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder("challenge not completed"))?;
        let user_nonce = self
            .user_nonce
            .as_ref()
            .ok_or(HandshakeError::OutOfOrder("auth payload not created"))?;

        let der = match gateway
            .cipher
            .decrypt(Nonce::from_slice(&dev_nonce[..IV_LEN]), ciphertext)
        {
            Ok(plain) => plain,
            Err(_) => {
                warn!("Gateway response failed authentication tag check");
                return Ok(false);
            }
        };

        let signature = match Signature::from_der(&der) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Gateway signature is not valid DER: {}", e);
                return Ok(false);
            }
        };

        match gateway.verifying.verify(user_nonce, &signature) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Gateway signature verification failed: {}", e);
                Ok(false)
            }
        }
    }
}
