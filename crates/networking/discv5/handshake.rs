//! The handshake engine.
//!
//! A handshake is a two-round-trip exchange. The initiator opens with a
//! message packet carrying random filler; the recipient, unable to decrypt
//! it, answers with a WHOAREYOU challenge; the initiator completes with an
//! auth header packet carrying its id-nonce signature, the ephemeral public
//! key and the original message encrypted under the freshly derived session
//! keys.
//!
//! [`HandshakeInitiator`] and [`HandshakeRecipient`] each hold the state of
//! one side: the first packet to send, the predicate identifying the
//! matching response, and the completion step yielding [`SessionKeys`].

use crate::{
    cipher::Nonce,
    messages::Message,
    packet::{
        AuthHeaderPacket, AuthResponseError, AuthTagPacket, MessageDecryptError, Packet,
        WhoAreYouPacket, compute_tag, get_random_auth_tag, get_random_encrypted_data,
        get_random_id_nonce, recover_source_node_id,
    },
    scheme::{IdentityScheme, IdentitySchemeRegistry, SchemeError, SessionKeys},
    types::{Enr, EnrError},
};
use bytes::Bytes;
use ethereum_types::H256;
use secp256k1::SecretKey;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("packet is not the expected handshake response")]
    UnexpectedPacket,
    #[error("record names an unknown identity scheme")]
    UnknownScheme,
    #[error("record is missing the scheme public key")]
    MissingPublicKey,
    #[error("invalid ephemeral public key")]
    InvalidEphemeralPublicKey,
    #[error("unable to decrypt auth response")]
    AuthResponseDecryption,
    #[error("invalid auth response content: {0}")]
    InvalidAuthResponse(String),
    #[error("peer failed to send their record")]
    MissingEnr,
    #[error("record in auth response is not newer than the one already known")]
    StaleEnr,
    #[error("record in auth response contains an invalid signature")]
    InvalidEnrSignature,
    #[error("record in auth response belongs to a different node")]
    NodeIdMismatch,
    #[error("invalid id nonce signature in auth response")]
    InvalidIdNonceSignature,
    #[error("failed to decrypt message with newly established session keys")]
    MessageDecryption,
    #[error("received invalid message: {0}")]
    InvalidMessage(String),
    #[error("failed to seal handshake packet")]
    Encryption,
    #[error(transparent)]
    Enr(#[from] EnrError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
}

/// Outcome of a completed handshake.
///
/// The initiator side carries the auth header packet to send; the recipient
/// side carries the decrypted initial message and, possibly, the peer's
/// updated record.
#[derive(Debug)]
pub struct HandshakeResult {
    pub session_keys: SessionKeys,
    pub enr: Option<Enr>,
    pub message: Option<Message>,
    pub auth_header_packet: Option<AuthHeaderPacket>,
}

/// Either side of an in-flight handshake.
#[derive(Debug, Clone)]
pub enum HandshakeParticipant {
    Initiator(HandshakeInitiator),
    Recipient(HandshakeRecipient),
}

impl HandshakeParticipant {
    pub fn first_packet_to_send(&self) -> Packet {
        match self {
            HandshakeParticipant::Initiator(i) => Packet::AuthTag(i.initiating_packet.clone()),
            HandshakeParticipant::Recipient(r) => Packet::WhoAreYou(r.who_are_you_packet.clone()),
        }
    }

    /// Whether the given packet is the response this side is waiting for.
    pub fn is_response_packet(&self, packet: &Packet) -> bool {
        match self {
            HandshakeParticipant::Initiator(i) => i.is_response_packet(packet),
            HandshakeParticipant::Recipient(r) => r.is_response_packet(packet),
        }
    }

    pub fn complete_handshake(&self, packet: &Packet) -> Result<HandshakeResult, HandshakeError> {
        match self {
            HandshakeParticipant::Initiator(i) => i.complete_handshake(packet),
            HandshakeParticipant::Recipient(r) => r.complete_handshake(packet),
        }
    }

    pub fn is_initiator(&self) -> bool {
        matches!(self, HandshakeParticipant::Initiator(_))
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeInitiator {
    local_private_key: SecretKey,
    local_enr: Enr,
    local_node_id: H256,
    remote_enr: Enr,
    remote_node_id: H256,
    scheme: Arc<dyn IdentityScheme>,
    initial_message: Message,
    initiating_packet: AuthTagPacket,
}

impl HandshakeInitiator {
    pub fn new(
        local_private_key: SecretKey,
        local_enr: Enr,
        remote_enr: Enr,
        initial_message: Message,
        registry: &IdentitySchemeRegistry,
    ) -> Result<Self, HandshakeError> {
        // the handshake runs under the remote's identity scheme
        let scheme_id = remote_enr.id().ok_or(HandshakeError::UnknownScheme)?;
        let scheme = registry
            .get(&scheme_id)
            .ok_or(HandshakeError::UnknownScheme)?;
        let local_node_id = local_enr.node_id(registry)?;
        let remote_node_id = remote_enr.node_id(registry)?;

        let tag = compute_tag(&local_node_id, &remote_node_id);
        let initiating_packet =
            AuthTagPacket::prepare_random(tag, get_random_auth_tag(), &get_random_encrypted_data());

        Ok(Self {
            local_private_key,
            local_enr,
            local_node_id,
            remote_enr,
            remote_node_id,
            scheme,
            initial_message,
            initiating_packet,
        })
    }

    fn is_response_packet(&self, packet: &Packet) -> bool {
        match packet {
            Packet::WhoAreYou(who_are_you) => {
                constant_time_eq(&who_are_you.token, &self.initiating_packet.auth_tag)
            }
            _ => false,
        }
    }

    fn complete_handshake(&self, packet: &Packet) -> Result<HandshakeResult, HandshakeError> {
        if !self.is_response_packet(packet) {
            return Err(HandshakeError::UnexpectedPacket);
        }
        let Packet::WhoAreYou(who_are_you) = packet else {
            return Err(HandshakeError::UnexpectedPacket);
        };

        let (ephemeral_private_key, ephemeral_public_key) = self.scheme.create_handshake_key_pair();
        let remote_public_key = self
            .remote_enr
            .get_value::<Bytes>(self.scheme.public_key_enr_key())
            .ok_or(HandshakeError::MissingPublicKey)?;

        let session_keys = self.scheme.compute_session_keys(
            &ephemeral_private_key,
            &remote_public_key,
            &self.local_node_id,
            &self.remote_node_id,
            &who_are_you.id_nonce,
            true,
        )?;

        let id_nonce_signature = self.scheme.create_id_nonce_signature(
            &who_are_you.id_nonce,
            &self.local_private_key.secret_bytes(),
        )?;

        // attach our record only if the challenge shows the peer's copy is
        // out of date
        let enr = (who_are_you.enr_seq < self.local_enr.seq()).then(|| self.local_enr.clone());

        let auth_header_packet = AuthHeaderPacket::prepare(
            compute_tag(&self.local_node_id, &self.remote_node_id),
            get_random_auth_tag(),
            who_are_you.id_nonce,
            &self.initial_message,
            &session_keys.encryption_key,
            &id_nonce_signature,
            &session_keys.auth_response_key,
            enr.as_ref(),
            ephemeral_public_key,
        )
        .map_err(|_| HandshakeError::Encryption)?;

        Ok(HandshakeResult {
            session_keys,
            enr: None,
            message: None,
            auth_header_packet: Some(auth_header_packet),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HandshakeRecipient {
    local_private_key: SecretKey,
    local_node_id: H256,
    remote_node_id: H256,
    remote_enr: Option<Enr>,
    scheme: Arc<dyn IdentityScheme>,
    registry: IdentitySchemeRegistry,
    who_are_you_packet: WhoAreYouPacket,
}

impl HandshakeRecipient {
    pub fn new(
        local_private_key: SecretKey,
        local_enr: Enr,
        remote_node_id: H256,
        remote_enr: Option<Enr>,
        initiating_packet_auth_tag: Nonce,
        registry: IdentitySchemeRegistry,
    ) -> Result<Self, HandshakeError> {
        // the handshake runs under our own identity scheme; the peer proved
        // nothing about itself yet
        let scheme_id = local_enr.id().ok_or(HandshakeError::UnknownScheme)?;
        let scheme = registry
            .get(&scheme_id)
            .ok_or(HandshakeError::UnknownScheme)?;
        let local_node_id = local_enr.node_id(&registry)?;

        if let Some(enr) = &remote_enr
            && enr.node_id(&registry)? != remote_node_id
        {
            return Err(HandshakeError::NodeIdMismatch);
        }

        let enr_seq = remote_enr.as_ref().map(Enr::seq).unwrap_or(0);
        let who_are_you_packet = WhoAreYouPacket::prepare(
            &remote_node_id,
            initiating_packet_auth_tag,
            get_random_id_nonce(),
            enr_seq,
        );

        Ok(Self {
            local_private_key,
            local_node_id,
            remote_node_id,
            remote_enr,
            scheme,
            registry,
            who_are_you_packet,
        })
    }

    fn is_response_packet(&self, packet: &Packet) -> bool {
        match packet {
            Packet::AuthHeader(p) => {
                recover_source_node_id(&p.tag, &self.local_node_id) == self.remote_node_id
            }
            _ => false,
        }
    }

    fn complete_handshake(&self, packet: &Packet) -> Result<HandshakeResult, HandshakeError> {
        if !self.is_response_packet(packet) {
            return Err(HandshakeError::UnexpectedPacket);
        }
        let Packet::AuthHeader(auth_header_packet) = packet else {
            return Err(HandshakeError::UnexpectedPacket);
        };

        let ephemeral_public_key = &auth_header_packet.auth_header.ephemeral_public_key;
        self.scheme
            .validate_handshake_public_key(ephemeral_public_key)
            .map_err(|_| HandshakeError::InvalidEphemeralPublicKey)?;

        let session_keys = self.scheme.compute_session_keys(
            &self.local_private_key.secret_bytes(),
            ephemeral_public_key,
            &self.local_node_id,
            &self.remote_node_id,
            &self.who_are_you_packet.id_nonce,
            false,
        )?;

        let enr = self.decrypt_and_validate_auth_response(
            auth_header_packet,
            &session_keys.auth_response_key,
        )?;

        let message = match auth_header_packet.decrypt_message(&session_keys.decryption_key) {
            Ok(message) => message,
            Err(MessageDecryptError::Decryption(_)) => {
                return Err(HandshakeError::MessageDecryption);
            }
            Err(MessageDecryptError::Malformed(err)) => {
                return Err(HandshakeError::InvalidMessage(err.to_string()));
            }
        };

        Ok(HandshakeResult {
            session_keys,
            enr,
            message: Some(message),
            auth_header_packet: None,
        })
    }

    fn decrypt_and_validate_auth_response(
        &self,
        auth_header_packet: &AuthHeaderPacket,
        auth_response_key: &crate::cipher::Aes128Key,
    ) -> Result<Option<Enr>, HandshakeError> {
        let (id_nonce_signature, enr) = auth_header_packet
            .decrypt_auth_response(auth_response_key)
            .map_err(|err| match err {
                AuthResponseError::Decryption(_) => HandshakeError::AuthResponseDecryption,
                other => HandshakeError::InvalidAuthResponse(other.to_string()),
            })?;

        let current_remote_enr = match &enr {
            None => self.remote_enr.as_ref().ok_or(HandshakeError::MissingEnr)?,
            Some(received) => {
                received
                    .verify_signature(&self.registry)
                    .map_err(|_| HandshakeError::InvalidEnrSignature)?;
                if let Some(known) = &self.remote_enr
                    && received.seq() <= known.seq()
                {
                    return Err(HandshakeError::StaleEnr);
                }
                if received.node_id(&self.registry)? != self.remote_node_id {
                    return Err(HandshakeError::NodeIdMismatch);
                }
                received
            }
        };

        let remote_public_key = current_remote_enr
            .get_value::<Bytes>(self.scheme.public_key_enr_key())
            .ok_or(HandshakeError::MissingPublicKey)?;
        self.scheme
            .validate_id_nonce_signature(
                &self.who_are_you_packet.id_nonce,
                &id_nonce_signature,
                &remote_public_key,
            )
            .map_err(|_| HandshakeError::InvalidIdNonceSignature)?;

        Ok(enr)
    }
}

/// Timing-independent equality, used when matching WHOAREYOU tokens against
/// the auth tag we sent.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
