//! The per-peer session.
//!
//! A [`PeerPacker`] mediates all traffic for one `(local, remote)` pair: it
//! owns the handshake state machine and, once a handshake completed, the
//! session keys. Packets arrive through its mailbox and are therefore
//! processed strictly in order, which keeps overlapping handshakes from
//! racing each other.
//!
//! ```text
//! PreHandshake ──recv AuthTag──> DuringHandshake(recipient) ─┐
//!      │                                                     ├─> PostHandshake
//!      └───send message────────> DuringHandshake(initiator) ─┘        │
//!             ^                                                       │
//!             └──────────── decryption failure ───────────────────────┘
//! ```
//!
//! Outgoing messages submitted while a handshake is in flight accumulate on
//! a backlog that is drained, in submission order, once the session is
//! established; a reset discards it.

use crate::{
    cipher::EncryptionError,
    enr_store::{EnrStore, EnrStoreError},
    handshake::{
        HandshakeError, HandshakeInitiator, HandshakeParticipant, HandshakeRecipient,
    },
    messages::Message,
    packet::{
        AuthTagPacket, MessageDecodeError, MessageDecryptError, Packet, compute_tag,
        get_random_auth_tag,
    },
    scheme::{IdentitySchemeRegistry, SessionKeys},
    types::{Endpoint, IncomingMessage, IncomingPacket, OutgoingMessage, OutgoingPacket},
};
use ethereum_types::H256;
use secp256k1::SecretKey;
use spawned_concurrency::tasks::{
    CallResponse, CastResponse, GenServer, GenServerHandle, InitResult,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PackerError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Store(#[from] EnrStoreError),
    #[error("local record missing from the store")]
    MissingLocalEnr,
    #[error("peer's record is unknown, cannot initiate handshake")]
    UnknownPeer,
    #[error("received invalid message: {0}")]
    InvalidMessage(#[from] MessageDecodeError),
    #[error("failed to seal outgoing message")]
    Encryption(#[from] EncryptionError),
    #[error("a service channel is closed")]
    ChannelClosed,
}

#[derive(Debug)]
enum HandshakeState {
    Pre,
    During(Box<HandshakeParticipant>),
    Post(SessionKeys),
}

#[derive(Debug)]
pub struct PeerPacker {
    local_private_key: SecretKey,
    local_node_id: H256,
    remote_node_id: H256,
    enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    incoming_message_tx: mpsc::Sender<IncomingMessage>,
    outgoing_packet_tx: mpsc::Sender<OutgoingPacket>,
    state: HandshakeState,
    backlog: Vec<OutgoingMessage>,
}

#[derive(Debug, Clone)]
pub enum PeerCastMessage {
    Packet(Box<IncomingPacket>),
    Message(Box<OutgoingMessage>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum PeerCallMessage {
    /// Is this packer waiting for exactly this packet to complete its
    /// handshake?
    ExpectsPacket(Box<Packet>),
}

#[derive(Debug)]
pub enum PeerOutMessage {
    Expecting(bool),
}

impl PeerPacker {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        local_private_key: SecretKey,
        local_node_id: H256,
        remote_node_id: H256,
        enr_store: EnrStore,
        registry: IdentitySchemeRegistry,
        incoming_message_tx: mpsc::Sender<IncomingMessage>,
        outgoing_packet_tx: mpsc::Sender<OutgoingPacket>,
    ) -> GenServerHandle<Self> {
        Self {
            local_private_key,
            local_node_id,
            remote_node_id,
            enr_store,
            registry,
            incoming_message_tx,
            outgoing_packet_tx,
            state: HandshakeState::Pre,
            backlog: Vec::new(),
        }
        .start()
    }

    //
    // Incoming packet handlers
    //

    async fn handle_incoming_packet(
        &mut self,
        incoming: IncomingPacket,
    ) -> Result<(), PackerError> {
        match self.state {
            HandshakeState::Pre => self.handle_packet_pre_handshake(incoming).await,
            HandshakeState::During(_) => self.handle_packet_during_handshake(incoming).await,
            HandshakeState::Post(_) => self.handle_packet_post_handshake(incoming).await,
        }
    }

    async fn handle_packet_pre_handshake(
        &mut self,
        incoming: IncomingPacket,
    ) -> Result<(), PackerError> {
        let Packet::AuthTag(packet) = &incoming.packet else {
            debug!(packet = %incoming.packet, "Dropping packet, handshake has not been started yet");
            return Ok(());
        };

        let remote_enr = self.enr_store.get(self.remote_node_id).await?;
        let local_enr = self
            .enr_store
            .get(self.local_node_id)
            .await?
            .ok_or(PackerError::MissingLocalEnr)?;

        debug!("Received handshake initiation, responding with WhoAreYou");
        let recipient = HandshakeRecipient::new(
            self.local_private_key,
            local_enr,
            self.remote_node_id,
            remote_enr,
            packet.auth_tag,
            self.registry.clone(),
        )?;
        let challenge = HandshakeParticipant::Recipient(recipient);
        let first_packet = challenge.first_packet_to_send();
        self.state = HandshakeState::During(Box::new(challenge));
        self.send_packet(first_packet, incoming.sender).await
    }

    async fn handle_packet_during_handshake(
        &mut self,
        incoming: IncomingPacket,
    ) -> Result<(), PackerError> {
        let HandshakeState::During(participant) = &self.state else {
            return Ok(());
        };

        if !participant.is_response_packet(&incoming.packet) {
            debug!(packet = %incoming.packet, "Dropping packet unexpectedly received during handshake");
            return Ok(());
        }

        // a failure here tears the whole packer down
        let result = participant.complete_handshake(&incoming.packet)?;
        info!("Handshake completed");

        let backlog = std::mem::take(&mut self.backlog);
        self.state = HandshakeState::Post(result.session_keys);

        if let Some(enr) = result.enr {
            debug!(seq = enr.seq(), "Updating peer record learned in handshake");
            self.enr_store.insert_or_update(enr).await?;
        }
        if let Some(packet) = result.auth_header_packet {
            debug!("Sending AuthHeader packet to let peer complete the handshake");
            self.send_packet(Packet::AuthHeader(packet), incoming.sender)
                .await?;
        }
        if let Some(message) = result.message {
            self.deliver_message(message, incoming.sender).await?;
        }

        debug!(count = backlog.len(), "Draining message backlog");
        for outgoing in backlog {
            self.handle_outgoing_message(outgoing).await?;
        }
        Ok(())
    }

    async fn handle_packet_post_handshake(
        &mut self,
        incoming: IncomingPacket,
    ) -> Result<(), PackerError> {
        let Packet::AuthTag(packet) = &incoming.packet else {
            debug!(packet = %incoming.packet, "Dropping packet, handshake is already complete");
            return Ok(());
        };
        let HandshakeState::Post(session_keys) = &self.state else {
            return Ok(());
        };

        match packet.decrypt_message(&session_keys.decryption_key) {
            Ok(message) => self.deliver_message(message, incoming.sender).await,
            Err(MessageDecryptError::Decryption(_)) => {
                // the peer lost its keys; treat the packet as a fresh
                // handshake initiation
                info!("Failed to decrypt message from peer, starting another handshake as recipient");
                self.reset_handshake_state();
                self.handle_packet_pre_handshake(incoming).await
            }
            Err(MessageDecryptError::Malformed(err)) => Err(PackerError::InvalidMessage(err)),
        }
    }

    //
    // Outgoing message handlers
    //

    async fn handle_outgoing_message(
        &mut self,
        outgoing: OutgoingMessage,
    ) -> Result<(), PackerError> {
        match self.state {
            HandshakeState::Pre => self.handle_message_pre_handshake(outgoing).await,
            HandshakeState::During(_) => {
                debug!(
                    message = %outgoing.message,
                    "Backlogging message, handshake is already in progress"
                );
                self.backlog.push(outgoing);
                Ok(())
            }
            HandshakeState::Post(_) => self.handle_message_post_handshake(outgoing).await,
        }
    }

    async fn handle_message_pre_handshake(
        &mut self,
        outgoing: OutgoingMessage,
    ) -> Result<(), PackerError> {
        let local_enr = self
            .enr_store
            .get(self.local_node_id)
            .await?
            .ok_or(PackerError::MissingLocalEnr)?;
        let Some(remote_enr) = self.enr_store.get(self.remote_node_id).await? else {
            warn!("Unable to initiate handshake, the peer's record is not in the store");
            return Err(PackerError::UnknownPeer);
        };

        info!(message = %outgoing.message, "Initiating handshake");
        let receiver = outgoing.receiver;
        let initiator = HandshakeInitiator::new(
            self.local_private_key,
            local_enr,
            remote_enr,
            outgoing.message,
            &self.registry,
        )?;
        let participant = HandshakeParticipant::Initiator(initiator);
        let first_packet = participant.first_packet_to_send();
        self.state = HandshakeState::During(Box::new(participant));
        self.send_packet(first_packet, receiver).await
    }

    async fn handle_message_post_handshake(
        &mut self,
        outgoing: OutgoingMessage,
    ) -> Result<(), PackerError> {
        let HandshakeState::Post(session_keys) = &self.state else {
            return Ok(());
        };
        let packet = AuthTagPacket::prepare(
            compute_tag(&self.local_node_id, &self.remote_node_id),
            get_random_auth_tag(),
            &outgoing.message,
            &session_keys.encryption_key,
        )?;
        debug!(message = %outgoing.message, "Sending message");
        self.send_packet(Packet::AuthTag(packet), outgoing.receiver)
            .await
    }

    //
    // Helpers
    //

    /// Return to the pre-handshake state, discarding session keys, any
    /// handshake in progress and the message backlog.
    fn reset_handshake_state(&mut self) {
        self.state = HandshakeState::Pre;
        self.backlog.clear();
    }

    fn is_expecting_packet(&self, packet: &Packet) -> bool {
        match &self.state {
            HandshakeState::During(participant) => participant.is_response_packet(packet),
            _ => false,
        }
    }

    async fn send_packet(&self, packet: Packet, receiver: Endpoint) -> Result<(), PackerError> {
        self.outgoing_packet_tx
            .send(OutgoingPacket { packet, receiver })
            .await
            .map_err(|_| PackerError::ChannelClosed)
    }

    async fn deliver_message(
        &self,
        message: Message,
        sender: Endpoint,
    ) -> Result<(), PackerError> {
        debug!(message = %message, "Received message");
        self.incoming_message_tx
            .send(IncomingMessage {
                message,
                sender,
                sender_node_id: self.remote_node_id,
            })
            .await
            .map_err(|_| PackerError::ChannelClosed)
    }
}

impl GenServer for PeerPacker {
    type CallMsg = PeerCallMessage;
    type CastMsg = PeerCastMessage;
    type OutMsg = PeerOutMessage;
    type Error = PackerError;

    async fn init(self, _handle: &GenServerHandle<Self>) -> Result<InitResult<Self>, Self::Error> {
        Ok(InitResult::Success(self))
    }

    async fn handle_call(
        &mut self,
        message: Self::CallMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CallResponse<Self> {
        match message {
            PeerCallMessage::ExpectsPacket(packet) => {
                CallResponse::Reply(PeerOutMessage::Expecting(self.is_expecting_packet(&packet)))
            }
        }
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        let result = match message {
            PeerCastMessage::Packet(incoming) => self.handle_incoming_packet(*incoming).await,
            PeerCastMessage::Message(outgoing) => self.handle_outgoing_message(*outgoing).await,
            PeerCastMessage::Shutdown => return CastResponse::Stop,
        };
        match result {
            Ok(()) => CastResponse::NoReply,
            Err(err) => {
                // the supervisor deregisters us on its next delivery attempt
                warn!(peer = %self.remote_node_id, err = %err, "Peer session failed");
                CastResponse::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::PingMessage,
        scheme::V4_SCHEME_ID,
        types::{Enr, EnrBuilder},
    };
    use secp256k1::SECP256K1;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn registry() -> IdentitySchemeRegistry {
        IdentitySchemeRegistry::with_default_schemes()
    }

    fn make_identity(seed: u8) -> (SecretKey, Enr, H256) {
        let signer = SecretKey::from_slice(&[seed; 32]).unwrap();
        let enr = EnrBuilder::new(1)
            .add(b"id", std::str::from_utf8(V4_SCHEME_ID).unwrap())
            .add(
                b"secp256k1",
                signer.public_key(SECP256K1).serialize().as_slice(),
            )
            .add(b"ip", &Ipv4Addr::new(127, 0, 0, 1))
            .add(b"udp", &(40000 + seed as u16))
            .sign(&signer.secret_bytes(), &registry())
            .unwrap();
        let node_id = enr.node_id(&registry()).unwrap();
        (signer, enr, node_id)
    }

    fn endpoint(seed: u8) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000 + seed as u16)
    }

    fn ping(request_id: u64) -> Message {
        Message::Ping(PingMessage {
            request_id,
            enr_seq: 1,
        })
    }

    struct Harness {
        packer: GenServerHandle<PeerPacker>,
        incoming_message_rx: mpsc::Receiver<IncomingMessage>,
        outgoing_packet_rx: mpsc::Receiver<OutgoingPacket>,
    }

    /// A packer for the (a, b) pair living on node A's side.
    async fn harness(store_records: Vec<Enr>) -> Harness {
        let (key_a, enr_a, node_id_a) = make_identity(0x0a);
        let (_, _, node_id_b) = make_identity(0x0b);

        let mut store = EnrStore::spawn(registry());
        store.insert(enr_a).await.unwrap();
        for record in store_records {
            store.insert_or_update(record).await.unwrap();
        }

        let (incoming_message_tx, incoming_message_rx) = mpsc::channel(16);
        let (outgoing_packet_tx, outgoing_packet_rx) = mpsc::channel(16);
        let packer = PeerPacker::spawn(
            key_a,
            node_id_a,
            node_id_b,
            store,
            registry(),
            incoming_message_tx,
            outgoing_packet_tx,
        );
        Harness {
            packer,
            incoming_message_rx,
            outgoing_packet_rx,
        }
    }

    async fn recv_packet(rx: &mut mpsc::Receiver<OutgoingPacket>) -> OutgoingPacket {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("packet channel closed")
    }

    #[tokio::test]
    async fn outgoing_message_pre_handshake_emits_random_auth_tag() {
        let (_, enr_b, node_id_b) = make_identity(0x0b);
        let mut h = harness(vec![enr_b]).await;

        h.packer
            .cast(PeerCastMessage::Message(Box::new(OutgoingMessage {
                message: ping(1),
                receiver: endpoint(0x0b),
                receiver_node_id: node_id_b,
            })))
            .await
            .unwrap();

        let outgoing = recv_packet(&mut h.outgoing_packet_rx).await;
        assert!(matches!(outgoing.packet, Packet::AuthTag(_)));
        assert_eq!(outgoing.receiver, endpoint(0x0b));

        // while the handshake is pending, the packer claims the matching
        // WhoAreYou and nothing else
        let Packet::AuthTag(initiating) = outgoing.packet else {
            unreachable!();
        };
        let challenge = Packet::WhoAreYou(crate::packet::WhoAreYouPacket::prepare(
            &H256::zero(),
            initiating.auth_tag,
            [0x01; 32],
            0,
        ));
        let response = h
            .packer
            .call(PeerCallMessage::ExpectsPacket(Box::new(challenge)))
            .await
            .unwrap();
        assert!(matches!(response, PeerOutMessage::Expecting(true)));

        let unrelated = Packet::WhoAreYou(crate::packet::WhoAreYouPacket::prepare(
            &H256::zero(),
            [0x09; 12],
            [0x01; 32],
            0,
        ));
        let response = h
            .packer
            .call(PeerCallMessage::ExpectsPacket(Box::new(unrelated)))
            .await
            .unwrap();
        assert!(matches!(response, PeerOutMessage::Expecting(false)));
    }

    #[tokio::test]
    async fn outgoing_message_without_remote_record_stops_the_packer() {
        let mut h = harness(vec![]).await;
        let (_, _, node_id_b) = make_identity(0x0b);

        h.packer
            .cast(PeerCastMessage::Message(Box::new(OutgoingMessage {
                message: ping(1),
                receiver: endpoint(0x0b),
                receiver_node_id: node_id_b,
            })))
            .await
            .unwrap();

        // the packer stopped; subsequent deliveries fail
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            h.packer
                .cast(PeerCastMessage::Message(Box::new(OutgoingMessage {
                    message: ping(2),
                    receiver: endpoint(0x0b),
                    receiver_node_id: node_id_b,
                })))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn inbound_auth_tag_pre_handshake_emits_who_are_you() {
        let (_, enr_b, _) = make_identity(0x0b);
        let seq_b = enr_b.seq();
        let mut h = harness(vec![enr_b]).await;

        let packet = Packet::AuthTag(AuthTagPacket::prepare_random(
            H256::repeat_byte(0x77),
            [0x08; 12],
            &crate::packet::get_random_encrypted_data(),
        ));
        h.packer
            .cast(PeerCastMessage::Packet(Box::new(IncomingPacket {
                packet,
                sender: endpoint(0x0b),
            })))
            .await
            .unwrap();

        let outgoing = recv_packet(&mut h.outgoing_packet_rx).await;
        let Packet::WhoAreYou(challenge) = outgoing.packet else {
            panic!("expected WhoAreYou, got {}", outgoing.packet);
        };
        // the token echoes the initiating auth tag, the advertised seq is
        // what we have on record for the peer
        assert_eq!(challenge.token, [0x08; 12]);
        assert_eq!(challenge.enr_seq, seq_b);
    }

    #[tokio::test]
    async fn full_handshake_as_recipient_delivers_message_and_drains_backlog() {
        // node B initiates against our harness node A
        let (_, enr_a, node_id_a) = make_identity(0x0a);
        let (key_b, enr_b, node_id_b) = make_identity(0x0b);
        let mut h = harness(vec![enr_b.clone()]).await;

        let initiator = HandshakeInitiator::new(
            key_b,
            enr_b,
            enr_a,
            ping(42),
            &registry(),
        )
        .unwrap();
        let participant_b = HandshakeParticipant::Initiator(initiator);

        // backlog a message on A's side while the handshake runs
        let first_packet = participant_b.first_packet_to_send();
        h.packer
            .cast(PeerCastMessage::Packet(Box::new(IncomingPacket {
                packet: first_packet,
                sender: endpoint(0x0b),
            })))
            .await
            .unwrap();
        let challenge = recv_packet(&mut h.outgoing_packet_rx).await.packet;

        h.packer
            .cast(PeerCastMessage::Message(Box::new(OutgoingMessage {
                message: ping(77),
                receiver: endpoint(0x0b),
                receiver_node_id: node_id_b,
            })))
            .await
            .unwrap();

        // B completes and A processes the auth header
        let result_b = participant_b.complete_handshake(&challenge).unwrap();
        let auth_header = result_b.auth_header_packet.unwrap();
        h.packer
            .cast(PeerCastMessage::Packet(Box::new(IncomingPacket {
                packet: Packet::AuthHeader(auth_header),
                sender: endpoint(0x0b),
            })))
            .await
            .unwrap();

        // A delivers B's initial message upward...
        let delivered = tokio::time::timeout(Duration::from_secs(1), h.incoming_message_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.message, ping(42));
        assert_eq!(delivered.sender_node_id, node_id_b);

        // ...and flushes the backlogged ping, readable with B's keys
        let flushed = recv_packet(&mut h.outgoing_packet_rx).await;
        let Packet::AuthTag(packet) = flushed.packet else {
            panic!("expected AuthTag, got {}", flushed.packet);
        };
        let message = packet
            .decrypt_message(&result_b.session_keys.decryption_key)
            .unwrap();
        assert_eq!(message, ping(77));
        assert_eq!(
            crate::packet::recover_source_node_id(&packet.tag, &node_id_b),
            node_id_a
        );
    }

    #[tokio::test]
    async fn undecryptable_auth_tag_post_handshake_restarts_handshake() {
        // establish a session first, as in the recipient test
        let (_, enr_a, _) = make_identity(0x0a);
        let (key_b, enr_b, _) = make_identity(0x0b);
        let mut h = harness(vec![enr_b.clone()]).await;

        let participant_b = HandshakeParticipant::Initiator(
            HandshakeInitiator::new(key_b, enr_b, enr_a, ping(1), &registry()).unwrap(),
        );
        h.packer
            .cast(PeerCastMessage::Packet(Box::new(IncomingPacket {
                packet: participant_b.first_packet_to_send(),
                sender: endpoint(0x0b),
            })))
            .await
            .unwrap();
        let challenge = recv_packet(&mut h.outgoing_packet_rx).await.packet;
        let result_b = participant_b.complete_handshake(&challenge).unwrap();
        h.packer
            .cast(PeerCastMessage::Packet(Box::new(IncomingPacket {
                packet: Packet::AuthHeader(result_b.auth_header_packet.unwrap()),
                sender: endpoint(0x0b),
            })))
            .await
            .unwrap();
        let _ = h.incoming_message_rx.recv().await.unwrap();

        // B restarts and sends a fresh random packet under lost keys
        let stray = Packet::AuthTag(AuthTagPacket::prepare_random(
            H256::repeat_byte(0x55),
            [0x0c; 12],
            &crate::packet::get_random_encrypted_data(),
        ));
        h.packer
            .cast(PeerCastMessage::Packet(Box::new(IncomingPacket {
                packet: stray,
                sender: endpoint(0x0b),
            })))
            .await
            .unwrap();

        // A resets and reprocesses the packet as a handshake initiation
        let outgoing = recv_packet(&mut h.outgoing_packet_rx).await;
        let Packet::WhoAreYou(challenge) = outgoing.packet else {
            panic!("expected WhoAreYou, got {}", outgoing.packet);
        };
        assert_eq!(challenge.token, [0x0c; 12]);
    }
}
