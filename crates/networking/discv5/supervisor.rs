//! The packer supervisor: demultiplexes wire traffic onto per-peer packers.
//!
//! Inbound packets are offered first to every packer that is waiting for
//! exactly that packet as a handshake response. Failing that, an ordinary
//! message packet is routed by the source id recovered from its tag,
//! spawning a packer on demand; anything else is an unsolicited handshake
//! packet and is dropped. Outbound messages are routed by target node id,
//! likewise spawning packers on demand.
//!
//! Packers stop themselves on handshake failure; the supervisor deregisters
//! a dead packer when a delivery to it fails and, for fresh traffic, spawns
//! a replacement.

use crate::{
    codec::Discv5Codec,
    enr_store::EnrStore,
    packer::{PeerCallMessage, PeerCastMessage, PeerOutMessage, PeerPacker},
    packet::{Packet, recover_source_node_id},
    scheme::IdentitySchemeRegistry,
    types::{IncomingMessage, IncomingPacket, OutgoingMessage, OutgoingPacket},
};
use ethereum_types::H256;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use secp256k1::SecretKey;
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, InitResult, spawn_listener},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct PackerSupervisor {
    local_private_key: SecretKey,
    local_node_id: H256,
    enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    udp_socket: Arc<UdpSocket>,
    incoming_message_tx: mpsc::Sender<IncomingMessage>,
    outgoing_packet_tx: mpsc::Sender<OutgoingPacket>,
    outgoing_message_rx: Option<mpsc::Receiver<OutgoingMessage>>,
    packers: FxHashMap<H256, GenServerHandle<PeerPacker>>,
}

#[derive(Debug, Clone)]
pub enum InMessage {
    Packet(Box<IncomingPacket>),
    Message(Box<OutgoingMessage>),
    Shutdown,
}

impl PackerSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        local_private_key: SecretKey,
        local_node_id: H256,
        enr_store: EnrStore,
        registry: IdentitySchemeRegistry,
        udp_socket: Arc<UdpSocket>,
        incoming_message_tx: mpsc::Sender<IncomingMessage>,
        outgoing_packet_tx: mpsc::Sender<OutgoingPacket>,
        outgoing_message_rx: mpsc::Receiver<OutgoingMessage>,
    ) -> GenServerHandle<Self> {
        Self {
            local_private_key,
            local_node_id,
            enr_store,
            registry,
            udp_socket,
            incoming_message_tx,
            outgoing_packet_tx,
            outgoing_message_rx: Some(outgoing_message_rx),
            packers: Default::default(),
        }
        .start()
    }

    async fn handle_incoming_packet(&mut self, incoming: IncomingPacket) {
        let expecting = self.expecting_packers(&incoming.packet).await;
        if expecting.len() >= 2 {
            warn!(
                packet = %incoming.packet,
                count = expecting.len(),
                "Multiple peer packers are expecting the same handshake packet"
            );
        }

        if !expecting.is_empty() {
            for remote_node_id in expecting {
                trace!(peer = %remote_node_id, packet = %incoming.packet, "Routing handshake response");
                self.deliver(
                    remote_node_id,
                    PeerCastMessage::Packet(Box::new(incoming.clone())),
                    false,
                )
                .await;
            }
            return;
        }

        match &incoming.packet {
            Packet::AuthTag(packet) => {
                let remote_node_id = recover_source_node_id(&packet.tag, &self.local_node_id);
                if remote_node_id == self.local_node_id {
                    debug!("Dropping packet addressed from ourselves");
                    return;
                }
                trace!(peer = %remote_node_id, "Routing message packet");
                self.deliver(
                    remote_node_id,
                    PeerCastMessage::Packet(Box::new(incoming)),
                    true,
                )
                .await;
            }
            _ => {
                warn!(packet = %incoming.packet, "Dropping unprompted handshake packet");
            }
        }
    }

    async fn handle_outgoing_message(&mut self, outgoing: OutgoingMessage) {
        let remote_node_id = outgoing.receiver_node_id;
        trace!(peer = %remote_node_id, message = %outgoing.message, "Routing outgoing message");
        self.deliver(
            remote_node_id,
            PeerCastMessage::Message(Box::new(outgoing)),
            true,
        )
        .await;
    }

    /// Node ids of all packers waiting for this packet to complete their
    /// handshake. Dead packers discovered along the way are deregistered.
    async fn expecting_packers(&mut self, packet: &Packet) -> Vec<H256> {
        let mut expecting = Vec::new();
        let mut dead = Vec::new();
        for (remote_node_id, handle) in self.packers.iter_mut() {
            match handle
                .call(PeerCallMessage::ExpectsPacket(Box::new(packet.clone())))
                .await
            {
                Ok(PeerOutMessage::Expecting(true)) => expecting.push(*remote_node_id),
                Ok(PeerOutMessage::Expecting(false)) => {}
                Err(_) => dead.push(*remote_node_id),
            }
        }
        for remote_node_id in dead {
            self.deregister(remote_node_id);
        }
        expecting
    }

    /// Casts a message to the peer's packer, spawning one if needed. A
    /// failed delivery deregisters the dead packer; if `respawn` is set the
    /// message is then handed to a fresh one.
    async fn deliver(&mut self, remote_node_id: H256, message: PeerCastMessage, respawn: bool) {
        if !self.packers.contains_key(&remote_node_id) {
            info!(peer = %remote_node_id, "Launching peer packer");
            let handle = self.spawn_packer(remote_node_id);
            self.packers.insert(remote_node_id, handle);
        }
        let Some(handle) = self.packers.get_mut(&remote_node_id) else {
            return;
        };
        if handle.cast(message.clone()).await.is_err() {
            self.deregister(remote_node_id);
            if respawn {
                debug!(peer = %remote_node_id, "Relaunching peer packer");
                let mut handle = self.spawn_packer(remote_node_id);
                if handle.cast(message).await.is_ok() {
                    self.packers.insert(remote_node_id, handle);
                } else {
                    debug!(peer = %remote_node_id, "Fresh peer packer rejected delivery");
                }
            }
        }
    }

    fn spawn_packer(&self, remote_node_id: H256) -> GenServerHandle<PeerPacker> {
        PeerPacker::spawn(
            self.local_private_key,
            self.local_node_id,
            remote_node_id,
            self.enr_store.clone(),
            self.registry.clone(),
            self.incoming_message_tx.clone(),
            self.outgoing_packet_tx.clone(),
        )
    }

    fn deregister(&mut self, remote_node_id: H256) {
        if self.packers.remove(&remote_node_id).is_some() {
            info!(peer = %remote_node_id, "Deregistering peer packer");
        }
    }

    async fn shutdown(&mut self) {
        for (_, handle) in self.packers.iter_mut() {
            let _ = handle.cast(PeerCastMessage::Shutdown).await;
        }
        self.packers.clear();
    }
}

impl GenServer for PackerSupervisor {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = Unused;
    type Error = SupervisorError;

    async fn init(
        mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<InitResult<Self>, Self::Error> {
        let stream = UdpFramed::new(self.udp_socket.clone(), Discv5Codec::new());
        spawn_listener(
            handle.clone(),
            |packet: IncomingPacket| InMessage::Packet(Box::new(packet)),
            Box::pin(
                stream
                    .filter_map(|result| async move {
                        match result {
                            Ok((packet, from)) => Some(IncomingPacket {
                                packet,
                                sender: from.into(),
                            }),
                            Err(err) => {
                                // bad datagrams are dropped without disturbing
                                // anyone's session
                                debug!(err = %err, "Dropping malformed packet");
                                None
                            }
                        }
                    })
                    .map(Ok::<_, std::convert::Infallible>),
            ),
        );

        if let Some(rx) = self.outgoing_message_rx.take() {
            spawn_listener(
                handle.clone(),
                |message| InMessage::Message(Box::new(message)),
                ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
            );
        }

        Ok(InitResult::Success(self))
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            InMessage::Packet(incoming) => {
                self.handle_incoming_packet(*incoming).await;
                CastResponse::NoReply
            }
            InMessage::Message(outgoing) => {
                self.handle_outgoing_message(*outgoing).await;
                CastResponse::NoReply
            }
            InMessage::Shutdown => {
                self.shutdown().await;
                CastResponse::Stop
            }
        }
    }
}
