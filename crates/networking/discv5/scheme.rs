//! Identity schemes: the cryptographic binding between node ids, public keys
//! and signatures.
//!
//! A scheme is discovered dynamically from the `id` entry of a node record,
//! so implementations are registered in an [`IdentitySchemeRegistry`] keyed
//! by the scheme-name bytes. The registry is a plain value handed to the
//! services that need it; there is no process-wide scheme table, so
//! independent discovery instances can carry different registries.

use crate::cipher::{AES128_KEY_SIZE, Aes128Key, IdNonce};
use bytes::Bytes;
use ethereum_types::H256;
use hkdf::Hkdf;
use keccak_hash::keccak;
use rand::rngs::OsRng;
use secp256k1::{
    Message as SecpMessage, PublicKey, SECP256K1, SecretKey, ecdh::shared_secret_point,
    ecdsa::Signature,
};
use sha2::Sha256;
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

/// Symmetric keys established by a completed handshake.
///
/// The initiator's `encryption_key` equals the recipient's `decryption_key`
/// and vice versa; `auth_response_key` is identical on both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub encryption_key: Aes128Key,
    pub decryption_key: Aes128Key,
    pub auth_response_key: Aes128Key,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemeError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("identity scheme {0} is already registered")]
    AlreadyRegistered(String),
}

/// Capability interface of an identity scheme.
///
/// Private keys are passed as raw bytes so that schemes over different curves
/// can share the interface; the v4 scheme interprets them as secp256k1
/// secret keys.
pub trait IdentityScheme: Send + Sync + fmt::Debug {
    /// Scheme name as it appears in the `id` entry of a record.
    fn id(&self) -> &'static [u8];

    /// Record key under which this scheme stores its public key.
    fn public_key_enr_key(&self) -> &'static [u8];

    /// Signs the record content, returning the wire-format signature.
    fn create_enr_signature(
        &self,
        signing_message: &[u8],
        private_key: &[u8],
    ) -> Result<Bytes, SchemeError>;

    /// Checks a record signature against the record content and public key.
    fn validate_enr_signature(
        &self,
        signing_message: &[u8],
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<(), SchemeError>;

    /// Derives the node id from a public key in record encoding.
    fn extract_node_id(&self, public_key: &[u8]) -> Result<H256, SchemeError>;

    /// Creates a fresh ephemeral key pair for a handshake.
    /// Returns the private key and the public key in wire encoding.
    fn create_handshake_key_pair(&self) -> (Bytes, Bytes);

    /// Checks curve membership and encoding of a handshake public key.
    fn validate_handshake_public_key(&self, public_key: &[u8]) -> Result<(), SchemeError>;

    /// Derives the symmetric session keys for one side of a handshake.
    #[allow(clippy::too_many_arguments)]
    fn compute_session_keys(
        &self,
        local_private_key: &[u8],
        remote_public_key: &[u8],
        local_node_id: &H256,
        remote_node_id: &H256,
        id_nonce: &IdNonce,
        is_locally_initiated: bool,
    ) -> Result<SessionKeys, SchemeError>;

    /// Signs the id nonce of a WHOAREYOU challenge.
    fn create_id_nonce_signature(
        &self,
        id_nonce: &IdNonce,
        private_key: &[u8],
    ) -> Result<Bytes, SchemeError>;

    /// Checks an id nonce signature against the signer's public key.
    fn validate_id_nonce_signature(
        &self,
        id_nonce: &IdNonce,
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<(), SchemeError>;
}

/// Maps scheme-name bytes to implementations. Records naming an unregistered
/// scheme fail validation.
#[derive(Debug, Clone, Default)]
pub struct IdentitySchemeRegistry {
    schemes: HashMap<Vec<u8>, Arc<dyn IdentityScheme>>,
}

impl IdentitySchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the reference `v4` scheme.
    pub fn with_default_schemes() -> Self {
        let mut registry = Self::new();
        // registering into an empty registry cannot collide
        let _ = registry.register(Arc::new(V4IdentityScheme));
        registry
    }

    pub fn register(&mut self, scheme: Arc<dyn IdentityScheme>) -> Result<(), SchemeError> {
        let id = scheme.id().to_vec();
        if self.schemes.contains_key(&id) {
            return Err(SchemeError::AlreadyRegistered(
                String::from_utf8_lossy(&id).into_owned(),
            ));
        }
        self.schemes.insert(id, scheme);
        Ok(())
    }

    pub fn get(&self, id: &[u8]) -> Option<Arc<dyn IdentityScheme>> {
        self.schemes.get(id).cloned()
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.schemes.contains_key(id)
    }
}

/// The reference identity scheme (`v4`), over secp256k1.
///
/// - node id = Keccak-256 of the uncompressed public key
/// - record and id-nonce signatures are non-recoverable ECDSA in compact form
/// - session keys come from HKDF-SHA256 over an ECDH shared secret
#[derive(Debug, Clone, Copy, Default)]
pub struct V4IdentityScheme;

pub const V4_SCHEME_ID: &[u8] = b"v4";
const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";

impl IdentityScheme for V4IdentityScheme {
    fn id(&self) -> &'static [u8] {
        V4_SCHEME_ID
    }

    fn public_key_enr_key(&self) -> &'static [u8] {
        b"secp256k1"
    }

    fn create_enr_signature(
        &self,
        signing_message: &[u8],
        private_key: &[u8],
    ) -> Result<Bytes, SchemeError> {
        let secret_key = parse_secret_key(private_key)?;
        let digest = keccak(signing_message);
        let message = parse_digest(digest.as_bytes())?;
        let signature = SECP256K1.sign_ecdsa(&message, &secret_key);
        Ok(Bytes::copy_from_slice(&signature.serialize_compact()))
    }

    fn validate_enr_signature(
        &self,
        signing_message: &[u8],
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<(), SchemeError> {
        let digest = keccak(signing_message);
        validate_signature(digest.as_bytes(), signature, public_key)
    }

    fn extract_node_id(&self, public_key: &[u8]) -> Result<H256, SchemeError> {
        let public_key = parse_public_key(public_key)?;
        Ok(node_id_from_public_key(&public_key))
    }

    fn create_handshake_key_pair(&self) -> (Bytes, Bytes) {
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(SECP256K1);
        (
            Bytes::copy_from_slice(&secret_key.secret_bytes()),
            Bytes::copy_from_slice(&public_key.serialize()),
        )
    }

    fn validate_handshake_public_key(&self, public_key: &[u8]) -> Result<(), SchemeError> {
        // only the compressed encoding is accepted on the wire
        if public_key.len() != 33 {
            return Err(SchemeError::InvalidPublicKey);
        }
        parse_public_key(public_key).map(|_| ())
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_session_keys(
        &self,
        local_private_key: &[u8],
        remote_public_key: &[u8],
        local_node_id: &H256,
        remote_node_id: &H256,
        id_nonce: &IdNonce,
        is_locally_initiated: bool,
    ) -> Result<SessionKeys, SchemeError> {
        let secret_key = parse_secret_key(local_private_key)?;
        let public_key = parse_public_key(remote_public_key)?;
        let shared_secret = compressed_shared_secret(&public_key, &secret_key);

        let (initiator_id, recipient_id) = if is_locally_initiated {
            (local_node_id, remote_node_id)
        } else {
            (remote_node_id, local_node_id)
        };

        let mut kdf_info = KEY_AGREEMENT_INFO.to_vec();
        kdf_info.extend_from_slice(initiator_id.as_bytes());
        kdf_info.extend_from_slice(recipient_id.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(Some(id_nonce), &shared_secret);
        let mut key_data = [0u8; 3 * AES128_KEY_SIZE];
        hkdf.expand(&kdf_info, &mut key_data)
            .map_err(|_| SchemeError::InvalidPrivateKey)?;

        let mut initiator_key: Aes128Key = [0; AES128_KEY_SIZE];
        let mut recipient_key: Aes128Key = [0; AES128_KEY_SIZE];
        let mut auth_response_key: Aes128Key = [0; AES128_KEY_SIZE];
        initiator_key.copy_from_slice(&key_data[..16]);
        recipient_key.copy_from_slice(&key_data[16..32]);
        auth_response_key.copy_from_slice(&key_data[32..]);

        let (encryption_key, decryption_key) = if is_locally_initiated {
            (initiator_key, recipient_key)
        } else {
            (recipient_key, initiator_key)
        };

        Ok(SessionKeys {
            encryption_key,
            decryption_key,
            auth_response_key,
        })
    }

    fn create_id_nonce_signature(
        &self,
        id_nonce: &IdNonce,
        private_key: &[u8],
    ) -> Result<Bytes, SchemeError> {
        let secret_key = parse_secret_key(private_key)?;
        // the id nonce is already 32 bytes and is signed as-is
        let message = parse_digest(id_nonce)?;
        let signature = SECP256K1.sign_ecdsa(&message, &secret_key);
        Ok(Bytes::copy_from_slice(&signature.serialize_compact()))
    }

    fn validate_id_nonce_signature(
        &self,
        id_nonce: &IdNonce,
        signature: &[u8],
        public_key: &[u8],
    ) -> Result<(), SchemeError> {
        validate_signature(id_nonce, signature, public_key)
    }
}

/// Computes the node id of a secp256k1 public key: the Keccak-256 hash of
/// its uncompressed encoding without the 0x04 prefix.
pub fn node_id_from_public_key(public_key: &PublicKey) -> H256 {
    let uncompressed = public_key.serialize_uncompressed();
    keccak(&uncompressed[1..])
}

fn parse_secret_key(private_key: &[u8]) -> Result<SecretKey, SchemeError> {
    SecretKey::from_slice(private_key).map_err(|_| SchemeError::InvalidPrivateKey)
}

fn parse_public_key(public_key: &[u8]) -> Result<PublicKey, SchemeError> {
    PublicKey::from_slice(public_key).map_err(|_| SchemeError::InvalidPublicKey)
}

fn parse_digest(digest: &[u8]) -> Result<SecpMessage, SchemeError> {
    SecpMessage::from_digest_slice(digest).map_err(|_| SchemeError::InvalidSignature)
}

fn validate_signature(
    digest: &[u8],
    signature: &[u8],
    public_key: &[u8],
) -> Result<(), SchemeError> {
    let message = parse_digest(digest)?;
    let signature = Signature::from_compact(signature).map_err(|_| SchemeError::InvalidSignature)?;
    let public_key = parse_public_key(public_key)?;
    SECP256K1
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| SchemeError::InvalidSignature)
}

/// ECDH shared secret in compressed-point form, the input key material of
/// the session KDF.
fn compressed_shared_secret(public_key: &PublicKey, secret_key: &SecretKey) -> [u8; 33] {
    let xy_point = shared_secret_point(public_key, secret_key);
    let mut compressed = [0u8; 33];
    let y = &xy_point[32..];
    compressed[0] = if y[31] & 1 == 0 { 0x02 } else { 0x03 };
    compressed[1..].copy_from_slice(&xy_point[..32]);
    compressed
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn scheme() -> V4IdentityScheme {
        V4IdentityScheme
    }

    #[test]
    fn node_id_matches_keccak_of_uncompressed_key() {
        let secret_key = SecretKey::from_slice(&hex!(
            "b71c71a67e1177ad4e901695e1b4b9ee17ae16c6668d313eac2f96dbcda3f291"
        ))
        .unwrap();
        let public_key = secret_key.public_key(SECP256K1);
        let node_id = node_id_from_public_key(&public_key);

        let derived = scheme()
            .extract_node_id(&public_key.serialize())
            .unwrap();
        assert_eq!(node_id, derived);
    }

    #[test]
    fn session_keys_mirror_between_initiator_and_recipient() {
        let scheme = scheme();
        let (initiator_priv, initiator_pub) = scheme.create_handshake_key_pair();
        let recipient_secret = SecretKey::new(&mut OsRng);
        let recipient_pub = recipient_secret.public_key(SECP256K1).serialize();

        let initiator_id = H256::repeat_byte(0xaa);
        let recipient_id = H256::repeat_byte(0xbb);
        let id_nonce = [0x5c; 32];

        let initiator_keys = scheme
            .compute_session_keys(
                &initiator_priv,
                &recipient_pub,
                &initiator_id,
                &recipient_id,
                &id_nonce,
                true,
            )
            .unwrap();
        let recipient_keys = scheme
            .compute_session_keys(
                &recipient_secret.secret_bytes(),
                &initiator_pub,
                &recipient_id,
                &initiator_id,
                &id_nonce,
                false,
            )
            .unwrap();

        assert_eq!(
            initiator_keys.encryption_key,
            recipient_keys.decryption_key
        );
        assert_eq!(
            initiator_keys.decryption_key,
            recipient_keys.encryption_key
        );
        assert_eq!(
            initiator_keys.auth_response_key,
            recipient_keys.auth_response_key
        );
    }

    #[test]
    fn id_nonce_signature_roundtrip() {
        let scheme = scheme();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(SECP256K1).serialize();
        let id_nonce = [0x11; 32];

        let signature = scheme
            .create_id_nonce_signature(&id_nonce, &secret_key.secret_bytes())
            .unwrap();
        scheme
            .validate_id_nonce_signature(&id_nonce, &signature, &public_key)
            .unwrap();

        let other_nonce = [0x12; 32];
        assert_eq!(
            scheme.validate_id_nonce_signature(&other_nonce, &signature, &public_key),
            Err(SchemeError::InvalidSignature)
        );
    }

    #[test]
    fn enr_signature_rejects_tampered_content() {
        let scheme = scheme();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(SECP256K1).serialize();

        let signature = scheme
            .create_enr_signature(b"content", &secret_key.secret_bytes())
            .unwrap();
        scheme
            .validate_enr_signature(b"content", &signature, &public_key)
            .unwrap();
        assert_eq!(
            scheme.validate_enr_signature(b"tampered", &signature, &public_key),
            Err(SchemeError::InvalidSignature)
        );
    }

    #[test]
    fn handshake_public_key_must_be_compressed() {
        let scheme = scheme();
        let secret_key = SecretKey::new(&mut OsRng);
        let uncompressed = secret_key
            .public_key(SECP256K1)
            .serialize_uncompressed();
        assert!(scheme.validate_handshake_public_key(&uncompressed).is_err());
        assert!(
            scheme
                .validate_handshake_public_key(&secret_key.public_key(SECP256K1).serialize())
                .is_ok()
        );
    }

    #[test]
    fn registry_rejects_duplicate_schemes() {
        let mut registry = IdentitySchemeRegistry::with_default_schemes();
        assert!(registry.contains(V4_SCHEME_ID));
        assert_eq!(
            registry.register(Arc::new(V4IdentityScheme)),
            Err(SchemeError::AlreadyRegistered("v4".into()))
        );
    }
}
