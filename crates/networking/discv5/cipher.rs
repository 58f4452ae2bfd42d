//! AES-128-GCM primitives shared by the packet codec and the handshake.

use aes_gcm::{
    Aes128Gcm,
    aead::{Aead, KeyInit, Payload, generic_array::GenericArray},
};
use thiserror::Error;

/// Size of an AES-128 key.
pub const AES128_KEY_SIZE: usize = 16;
/// Size of an AES-GCM nonce.
pub const NONCE_SIZE: usize = 12;
/// Size of the random challenge in a WHOAREYOU packet.
pub const ID_NONCE_SIZE: usize = 32;

pub type Aes128Key = [u8; AES128_KEY_SIZE];
/// A GCM nonce, doubling as the packet's auth tag.
pub type Nonce = [u8; NONCE_SIZE];
pub type IdNonce = [u8; ID_NONCE_SIZE];

/// Nonce used for the auth response inside an auth header. Safe because the
/// auth response key is used exactly once per handshake.
pub const ZERO_NONCE: Nonce = [0; NONCE_SIZE];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("AEAD seal failed")]
pub struct EncryptionError;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("AEAD open failed")]
pub struct DecryptionError;

pub fn aesgcm_encrypt(
    key: &Aes128Key,
    nonce: &Nonce,
    plain_text: &[u8],
    authenticated_data: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes128Gcm::new(GenericArray::from_slice(key));
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plain_text,
                aad: authenticated_data,
            },
        )
        .map_err(|_| EncryptionError)
}

pub fn aesgcm_decrypt(
    key: &Aes128Key,
    nonce: &Nonce,
    cipher_text: &[u8],
    authenticated_data: &[u8],
) -> Result<Vec<u8>, DecryptionError> {
    let cipher = Aes128Gcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: cipher_text,
                aad: authenticated_data,
            },
        )
        .map_err(|_| DecryptionError)
}
