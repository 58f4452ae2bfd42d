//! The discovery packet codec.
//!
//! Three wire variants share a 32-byte prefix:
//!
//! ```text
//! message packet:   tag(32)   || RLP(auth section) || ciphertext
//! WHOAREYOU packet: magic(32) || RLP([token, id-nonce, enr-seq])
//! ```
//!
//! where the auth section is either a bare 12-byte nonce (an ordinary
//! encrypted message) or the five-element auth header completing a
//! handshake. The variants are told apart by shape alone: after the prefix
//! and one RLP item, a WHOAREYOU packet has nothing left while a message
//! packet carries its ciphertext.
//!
//! `tag = sha256(dest-node-id) xor src-node-id`, letting the recipient
//! recover the sender. `magic = sha256(dest-node-id || "WHOAREYOU")`.

use crate::{
    cipher::{
        Aes128Key, DecryptionError, EncryptionError, ID_NONCE_SIZE, IdNonce, NONCE_SIZE, Nonce,
        ZERO_NONCE, aesgcm_decrypt, aesgcm_encrypt,
    },
    messages::Message,
    types::Enr,
};
pub use crate::messages::MessageDecodeError;
use bytes::{BufMut, Bytes};
use ethereum_types::H256;
use kadmos_rlp::{
    constants::RLP_EMPTY_LIST,
    decode::{RLPDecode, RlpItem, next_item, split_item},
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use thiserror::Error;

/// Maximum size of a discovery datagram (IPv6-safe UDP ceiling).
pub const MAX_PACKET_SIZE: usize = 1280;
/// Size of the tag prefixing message packets.
pub const TAG_SIZE: usize = 32;
/// Size of the magic prefixing WHOAREYOU packets.
pub const MAGIC_SIZE: usize = 32;
/// Size of the random filler standing in for the ciphertext of a handshake
/// initiation packet.
pub const RANDOM_ENCRYPTED_DATA_SIZE: usize = 44;

/// The only authentication scheme supported in auth headers.
pub const AUTH_SCHEME_NAME: &[u8] = b"gcm";
/// Version of the encrypted auth response payload.
pub const AUTH_RESPONSE_VERSION: u8 = 5;

const WHO_ARE_YOU_MAGIC_SUFFIX: &[u8] = b"WHOAREYOU";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet of {0} bytes exceeds the {MAX_PACKET_SIZE} byte limit")]
    TooLarge(usize),
    #[error("packet of {0} bytes is too short")]
    TooShort(usize),
    #[error("packet authentication section is not proper RLP")]
    MalformedAuthSection,
    #[error("auth header uses unsupported scheme")]
    UnknownAuthScheme,
    #[error("nonce has the wrong size")]
    InvalidNonce,
    #[error("id nonce has the wrong size")]
    InvalidIdNonce,
    #[error("WHOAREYOU payload is malformed")]
    MalformedWhoAreYou,
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PacketError {
    fn from(err: std::io::Error) -> Self {
        PacketError::Io(err.to_string())
    }
}

/// Failure modes of opening an encrypted message, distinguished because the
/// session handling reacts differently: an AEAD failure resets the session,
/// a malformed plaintext tears it down.
#[derive(Debug, Error)]
pub enum MessageDecryptError {
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    #[error("decrypted message is invalid: {0}")]
    Malformed(#[from] MessageDecodeError),
}

/// Failure modes of opening the auth response inside an auth header.
#[derive(Debug, Error)]
pub enum AuthResponseError {
    #[error(transparent)]
    Decryption(#[from] DecryptionError),
    #[error("auth response is malformed: {0}")]
    Malformed(String),
    #[error("unexpected auth response version {0}")]
    WrongVersion(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    AuthTag(AuthTagPacket),
    AuthHeader(AuthHeaderPacket),
    WhoAreYou(WhoAreYouPacket),
}

/// An ordinary encrypted message packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTagPacket {
    pub tag: H256,
    /// GCM nonce of the ciphertext, doubling as the packet identifier.
    pub auth_tag: Nonce,
    pub encrypted_message: Bytes,
}

/// The handshake completion packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaderPacket {
    pub tag: H256,
    pub auth_header: AuthHeader,
    pub encrypted_message: Bytes,
}

/// The handshake challenge packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAreYouPacket {
    pub magic: H256,
    /// Echo of the auth tag of the packet that could not be decrypted.
    pub token: Nonce,
    pub id_nonce: IdNonce,
    pub enr_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub auth_tag: Nonce,
    pub id_nonce: IdNonce,
    pub auth_scheme_name: Bytes,
    pub ephemeral_public_key: Bytes,
    pub encrypted_auth_response: Bytes,
}

impl RLPEncode for AuthHeader {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.auth_tag)
            .encode_field(&self.id_nonce)
            .encode_field(&self.auth_scheme_name)
            .encode_field(&self.ephemeral_public_key)
            .encode_field(&self.encrypted_auth_response);
        fields.finish(buf);
    }
}

impl RLPDecode for AuthHeader {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let auth_tag = fields.decode_field("auth_tag")?;
        let id_nonce = fields.decode_field("id_nonce")?;
        let auth_scheme_name = fields.decode_field("auth_scheme_name")?;
        let ephemeral_public_key = fields.decode_field("ephemeral_public_key")?;
        let encrypted_auth_response = fields.decode_field("encrypted_auth_response")?;
        let remaining = fields.finish()?;
        Ok((
            Self {
                auth_tag,
                id_nonce,
                auth_scheme_name,
                ephemeral_public_key,
                encrypted_auth_response,
            },
            remaining,
        ))
    }
}

/// Tag prefixing message packets sent from `source` to `destination`.
pub fn compute_tag(source_node_id: &H256, destination_node_id: &H256) -> H256 {
    sha256(destination_node_id.as_bytes()) ^ *source_node_id
}

/// Recovers the sender of a message packet from its tag.
pub fn recover_source_node_id(tag: &H256, destination_node_id: &H256) -> H256 {
    sha256(destination_node_id.as_bytes()) ^ *tag
}

/// Magic prefixing WHOAREYOU packets addressed at `destination`.
pub fn compute_who_are_you_magic(destination_node_id: &H256) -> H256 {
    let mut preimage = destination_node_id.as_bytes().to_vec();
    preimage.extend_from_slice(WHO_ARE_YOU_MAGIC_SUFFIX);
    sha256(&preimage)
}

fn sha256(data: &[u8]) -> H256 {
    H256::from_slice(&Sha256::digest(data))
}

impl Packet {
    /// Decodes a datagram into one of the three packet variants.
    ///
    /// Both message and WHOAREYOU packets start with 32 bytes followed by an
    /// RLP item; only message packets carry further bytes. The variants are
    /// therefore told apart by consuming the RLP length prefix and checking
    /// whether anything remains.
    pub fn decode(data: &[u8]) -> Result<Packet, PacketError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }
        if data.len() < TAG_SIZE + 1 {
            return Err(PacketError::TooShort(data.len()));
        }

        let prefix = H256::from_slice(&data[..TAG_SIZE]);
        let (auth_section, trailing) = split_item(&data[TAG_SIZE..])
            .map_err(|_| PacketError::MalformedAuthSection)?;

        if trailing.is_empty() {
            decode_who_are_you(prefix, auth_section)
        } else {
            decode_message_packet(prefix, auth_section, trailing)
        }
    }

    /// Serializes the packet, enforcing the datagram size limit.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        if buf.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(buf.len()));
        }
        Ok(buf)
    }

    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            Packet::AuthTag(p) => {
                buf.put_slice(p.tag.as_bytes());
                p.auth_tag.encode(buf);
                buf.put_slice(&p.encrypted_message);
            }
            Packet::AuthHeader(p) => {
                buf.put_slice(p.tag.as_bytes());
                p.auth_header.encode(buf);
                buf.put_slice(&p.encrypted_message);
            }
            Packet::WhoAreYou(p) => {
                buf.put_slice(p.magic.as_bytes());
                let mut payload = Encoder::new();
                payload
                    .encode_field(&p.token)
                    .encode_field(&p.id_nonce)
                    .encode_field(&p.enr_seq);
                payload.finish(buf);
            }
        }
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Packet::AuthTag(_) => f.write_str("AuthTagPacket"),
            Packet::AuthHeader(_) => f.write_str("AuthHeaderPacket"),
            Packet::WhoAreYou(_) => f.write_str("WhoAreYouPacket"),
        }
    }
}

fn decode_who_are_you(magic: H256, payload: &[u8]) -> Result<Packet, PacketError> {
    let mut fields = Decoder::new(payload).map_err(|_| PacketError::MalformedWhoAreYou)?;
    let token: Bytes = fields
        .decode_field("token")
        .map_err(|_| PacketError::MalformedWhoAreYou)?;
    let id_nonce: Bytes = fields
        .decode_field("id_nonce")
        .map_err(|_| PacketError::MalformedWhoAreYou)?;
    let enr_seq: u64 = fields
        .decode_field("enr_seq")
        .map_err(|_| PacketError::MalformedWhoAreYou)?;
    fields.finish().map_err(|_| PacketError::MalformedWhoAreYou)?;

    let token: Nonce = token
        .as_ref()
        .try_into()
        .map_err(|_| PacketError::InvalidNonce)?;
    let id_nonce: IdNonce = id_nonce
        .as_ref()
        .try_into()
        .map_err(|_| PacketError::InvalidIdNonce)?;

    Ok(Packet::WhoAreYou(WhoAreYouPacket {
        magic,
        token,
        id_nonce,
        enr_seq,
    }))
}

fn decode_message_packet(
    tag: H256,
    auth_section: &[u8],
    encrypted_message: &[u8],
) -> Result<Packet, PacketError> {
    let (item, _) = next_item(auth_section).map_err(|_| PacketError::MalformedAuthSection)?;

    match item {
        RlpItem::List(_) => {
            let auth_header = AuthHeader::decode(auth_section)?;
            validate_auth_header(&auth_header)?;
            Ok(Packet::AuthHeader(AuthHeaderPacket {
                tag,
                auth_header,
                encrypted_message: Bytes::copy_from_slice(encrypted_message),
            }))
        }
        RlpItem::Str(payload) => {
            let auth_tag: Nonce = payload
                .try_into()
                .map_err(|_| PacketError::InvalidNonce)?;
            Ok(Packet::AuthTag(AuthTagPacket {
                tag,
                auth_tag,
                encrypted_message: Bytes::copy_from_slice(encrypted_message),
            }))
        }
    }
}

fn validate_auth_header(header: &AuthHeader) -> Result<(), PacketError> {
    if header.auth_scheme_name.as_ref() != AUTH_SCHEME_NAME {
        return Err(PacketError::UnknownAuthScheme);
    }
    Ok(())
}

impl AuthTagPacket {
    /// Builds a message packet by encrypting `message` under the session
    /// key. The authenticated data is `tag || RLP(auth_tag)`.
    pub fn prepare(
        tag: H256,
        auth_tag: Nonce,
        message: &Message,
        key: &Aes128Key,
    ) -> Result<Self, EncryptionError> {
        let authenticated_data = message_packet_aad(&tag, |buf| auth_tag.encode(buf));
        let encrypted_message =
            aesgcm_encrypt(key, &auth_tag, &message.to_bytes(), &authenticated_data)?;
        Ok(Self {
            tag,
            auth_tag,
            encrypted_message: Bytes::from(encrypted_message),
        })
    }

    /// Builds the handshake initiation packet: its "ciphertext" is random
    /// data that nobody can decrypt, eliciting a WHOAREYOU challenge.
    pub fn prepare_random(tag: H256, auth_tag: Nonce, random_data: &[u8]) -> Self {
        Self {
            tag,
            auth_tag,
            encrypted_message: Bytes::copy_from_slice(random_data),
        }
    }

    pub fn decrypt_message(&self, key: &Aes128Key) -> Result<Message, MessageDecryptError> {
        let authenticated_data = message_packet_aad(&self.tag, |buf| self.auth_tag.encode(buf));
        let plain_text = aesgcm_decrypt(
            key,
            &self.auth_tag,
            &self.encrypted_message,
            &authenticated_data,
        )?;
        Ok(Message::decode(&plain_text)?)
    }
}

impl AuthHeaderPacket {
    /// Builds the handshake completion packet: the auth response is sealed
    /// under the single-use auth response key, the message under the fresh
    /// session key.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        tag: H256,
        auth_tag: Nonce,
        id_nonce: IdNonce,
        message: &Message,
        initiator_key: &Aes128Key,
        id_nonce_signature: &[u8],
        auth_response_key: &Aes128Key,
        enr: Option<&Enr>,
        ephemeral_public_key: Bytes,
    ) -> Result<Self, EncryptionError> {
        let encrypted_auth_response =
            compute_encrypted_auth_response(auth_response_key, id_nonce_signature, enr)?;
        let auth_header = AuthHeader {
            auth_tag,
            id_nonce,
            auth_scheme_name: Bytes::from_static(AUTH_SCHEME_NAME),
            ephemeral_public_key,
            encrypted_auth_response: Bytes::from(encrypted_auth_response),
        };

        let authenticated_data = message_packet_aad(&tag, |buf| auth_header.encode(buf));
        let encrypted_message = aesgcm_encrypt(
            initiator_key,
            &auth_tag,
            &message.to_bytes(),
            &authenticated_data,
        )?;

        Ok(Self {
            tag,
            auth_header,
            encrypted_message: Bytes::from(encrypted_message),
        })
    }

    /// Extracts the id nonce signature and optional record from the sealed
    /// auth response.
    pub fn decrypt_auth_response(
        &self,
        auth_response_key: &Aes128Key,
    ) -> Result<(Bytes, Option<Enr>), AuthResponseError> {
        let plain_text = aesgcm_decrypt(
            auth_response_key,
            &ZERO_NONCE,
            &self.auth_header.encrypted_auth_response,
            b"",
        )?;

        let malformed = |what: &str| AuthResponseError::Malformed(what.into());

        let mut fields = Decoder::new(&plain_text).map_err(|_| malformed("not an RLP list"))?;
        let version: u64 = fields
            .decode_field("version")
            .map_err(|_| malformed("version"))?;
        if version != AUTH_RESPONSE_VERSION as u64 {
            return Err(AuthResponseError::WrongVersion(version));
        }
        let id_nonce_signature: Bytes = fields
            .decode_field("id_nonce_signature")
            .map_err(|_| malformed("id nonce signature"))?;
        let enr_item = fields.next_raw_item().map_err(|_| malformed("record"))?;
        let enr = if enr_item == [RLP_EMPTY_LIST] {
            None
        } else {
            Some(Enr::decode(enr_item).map_err(|_| malformed("record"))?)
        };
        fields.finish().map_err(|_| malformed("trailing elements"))?;

        Ok((id_nonce_signature, enr))
    }

    pub fn decrypt_message(&self, key: &Aes128Key) -> Result<Message, MessageDecryptError> {
        let authenticated_data =
            message_packet_aad(&self.tag, |buf| self.auth_header.encode(buf));
        let plain_text = aesgcm_decrypt(
            key,
            &self.auth_header.auth_tag,
            &self.encrypted_message,
            &authenticated_data,
        )?;
        Ok(Message::decode(&plain_text)?)
    }
}

impl WhoAreYouPacket {
    pub fn prepare(
        destination_node_id: &H256,
        token: Nonce,
        id_nonce: IdNonce,
        enr_seq: u64,
    ) -> Self {
        Self {
            magic: compute_who_are_you_magic(destination_node_id),
            token,
            id_nonce,
            enr_seq,
        }
    }
}

/// `RLP([version, id-nonce-signature, record-or-empty-list])`, sealed with
/// a zero nonce and no authenticated data.
fn compute_encrypted_auth_response(
    auth_response_key: &Aes128Key,
    id_nonce_signature: &[u8],
    enr: Option<&Enr>,
) -> Result<Vec<u8>, EncryptionError> {
    let mut response = Encoder::new();
    response
        .encode_field(&AUTH_RESPONSE_VERSION)
        .encode_bytes(id_nonce_signature);
    match enr {
        Some(enr) => response.encode_field(enr),
        None => response.encode_raw(&[RLP_EMPTY_LIST]),
    };
    let mut plain_text = Vec::new();
    response.finish(&mut plain_text);

    aesgcm_encrypt(auth_response_key, &ZERO_NONCE, &plain_text, b"")
}

/// Authenticated data of a message packet: the tag followed by the RLP of
/// the auth section.
fn message_packet_aad(tag: &H256, encode_auth: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut aad = tag.as_bytes().to_vec();
    encode_auth(&mut aad);
    aad
}

pub fn get_random_auth_tag() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn get_random_id_nonce() -> IdNonce {
    let mut id_nonce = [0u8; ID_NONCE_SIZE];
    OsRng.fill_bytes(&mut id_nonce);
    id_nonce
}

pub fn get_random_encrypted_data() -> Vec<u8> {
    let mut data = vec![0u8; RANDOM_ENCRYPTED_DATA_SIZE];
    OsRng.fill_bytes(&mut data);
    data
}
