//! The routing table manager: owns the Kademlia table and runs the three
//! maintenance services on top of the message dispatcher.
//!
//! - the ping handler answers Ping with Pong carrying the observed source
//!   endpoint, and requests a record refresh when the peer advertises a
//!   newer sequence number;
//! - the findnode handler serves records: the local one at distance 0,
//!   bucket members' records at any other distance, chunked into multiple
//!   Nodes messages;
//! - the prober periodically pings the stalest table entry, feeding
//!   endpoint votes from Pongs to the endpoint tracker and evicting peers
//!   that time out or answer nonsense.
//!
//! Nobody else touches the routing table.

use crate::{
    dispatcher::{MessageDispatcher, RequestError},
    enr_store::{EnrStore, EnrStoreError},
    messages::{FindNodeMessage, Message, NodesMessage, PingMessage, PongMessage},
    scheme::IdentitySchemeRegistry,
    table::KademliaRoutingTable,
    tracker::EndpointVote,
    types::{Endpoint, IncomingMessage, OutgoingMessage},
};
use ethereum_types::H256;
use futures::StreamExt;
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, InitResult, send_interval, spawn_listener},
};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

/// Maximum number of records per Nodes message, bounded by the packet size.
const MAX_ENRS_PER_MESSAGE: usize = 3;
/// Buckets span the 256-bit id space.
const MAX_LOG_DISTANCE: u64 = 255;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Store(#[from] EnrStoreError),
    #[error("local record missing from the store")]
    MissingLocalEnr,
    #[error("a service channel is closed")]
    ChannelClosed,
}

/// Handle to the routing table manager.
#[derive(Debug, Clone)]
pub struct RoutingTableManager {
    handle: GenServerHandle<RoutingTableManagerServer>,
}

impl RoutingTableManager {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        local_node_id: H256,
        bucket_size: usize,
        bootstrap_node_ids: Vec<H256>,
        dispatcher: MessageDispatcher,
        enr_store: EnrStore,
        registry: IdentitySchemeRegistry,
        outgoing_message_tx: mpsc::Sender<OutgoingMessage>,
        endpoint_vote_tx: mpsc::Sender<EndpointVote>,
        ping_interval: Duration,
    ) -> Self {
        let server = RoutingTableManagerServer {
            local_node_id,
            table: KademliaRoutingTable::new(local_node_id, bucket_size),
            bootstrap_node_ids,
            dispatcher,
            enr_store,
            registry,
            outgoing_message_tx,
            endpoint_vote_tx,
            ping_interval,
        };
        Self {
            handle: server.start(),
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.handle.cast(InMessage::Shutdown).await;
    }
}

#[derive(Debug)]
struct RoutingTableManagerServer {
    local_node_id: H256,
    table: KademliaRoutingTable,
    bootstrap_node_ids: Vec<H256>,
    dispatcher: MessageDispatcher,
    enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    outgoing_message_tx: mpsc::Sender<OutgoingMessage>,
    endpoint_vote_tx: mpsc::Sender<EndpointVote>,
    ping_interval: Duration,
}

#[derive(Debug, Clone)]
pub enum InMessage {
    /// An inbound Ping or FindNode from the dispatcher subscription.
    Request(Box<IncomingMessage>),
    /// Periodic tick: probe the stalest table entry.
    Probe,
    /// Ping one specific node, evicting it on failure.
    ProbeNode { node_id: H256 },
    /// A peer interacted with us; refresh its table position.
    NodeActive { node_id: H256 },
    /// A probe verdict came back negative.
    EvictNode { node_id: H256 },
    Shutdown,
}

impl RoutingTableManagerServer {
    async fn handle_request(
        &mut self,
        incoming: IncomingMessage,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), ManagerError> {
        match incoming.message.clone() {
            Message::Ping(ping) => self.handle_ping(ping, incoming, handle).await,
            Message::FindNode(find_node) => self.handle_find_node(find_node, incoming, handle).await,
            other => {
                debug!(message = %other, "Ignoring unexpected message type");
                Ok(())
            }
        }
    }

    async fn handle_ping(
        &mut self,
        ping: PingMessage,
        incoming: IncomingMessage,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), ManagerError> {
        trace!(from = %incoming.sender_node_id, enr_seq = ping.enr_seq, "Handling Ping");
        self.note_active(incoming.sender_node_id, handle).await;

        let local_enr = self
            .enr_store
            .get(self.local_node_id)
            .await?
            .ok_or(ManagerError::MissingLocalEnr)?;
        let pong = Message::Pong(PongMessage {
            request_id: ping.request_id,
            enr_seq: local_enr.seq(),
            packet_ip: incoming.sender.ip,
            packet_port: incoming.sender.port,
        });
        self.outgoing_message_tx
            .send(incoming.to_response(pong))
            .await
            .map_err(|_| ManagerError::ChannelClosed)?;

        // fetch the peer's record in the background if it advertises a
        // newer one
        tokio::spawn(maybe_refresh_remote_enr(
            self.dispatcher.clone(),
            self.enr_store.clone(),
            self.registry.clone(),
            handle.clone(),
            incoming.sender_node_id,
            ping.enr_seq,
        ));
        Ok(())
    }

    async fn handle_find_node(
        &mut self,
        find_node: FindNodeMessage,
        incoming: IncomingMessage,
        handle: &GenServerHandle<Self>,
    ) -> Result<(), ManagerError> {
        trace!(
            from = %incoming.sender_node_id,
            distance = find_node.distance,
            "Handling FindNode"
        );
        self.note_active(incoming.sender_node_id, handle).await;

        let records = if find_node.distance == 0 {
            let local_enr = self
                .enr_store
                .get(self.local_node_id)
                .await?
                .ok_or(ManagerError::MissingLocalEnr)?;
            vec![local_enr]
        } else if find_node.distance > MAX_LOG_DISTANCE {
            warn!(
                from = %incoming.sender_node_id,
                distance = find_node.distance,
                "Dropping FindNode for impossible distance"
            );
            return Ok(());
        } else {
            let mut records = Vec::new();
            for node_id in self.table.nodes_at_log_distance(find_node.distance as usize) {
                if let Some(record) = self.enr_store.get(node_id).await? {
                    records.push(record);
                }
            }
            records
        };

        // all chunks advertise the same total so the requester knows when
        // the response is complete
        let total = records.len().div_ceil(MAX_ENRS_PER_MESSAGE).max(1) as u64;
        if records.is_empty() {
            let nodes = Message::Nodes(NodesMessage {
                request_id: find_node.request_id,
                total,
                enrs: Vec::new(),
            });
            self.outgoing_message_tx
                .send(incoming.to_response(nodes))
                .await
                .map_err(|_| ManagerError::ChannelClosed)?;
            return Ok(());
        }
        for chunk in records.chunks(MAX_ENRS_PER_MESSAGE) {
            let nodes = Message::Nodes(NodesMessage {
                request_id: find_node.request_id,
                total,
                enrs: chunk.to_vec(),
            });
            self.outgoing_message_tx
                .send(incoming.to_response(nodes))
                .await
                .map_err(|_| ManagerError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Updates a peer's table position; a full bucket hands back an
    /// eviction candidate that goes off to be probed.
    async fn note_active(&mut self, node_id: H256, handle: &GenServerHandle<Self>) {
        if node_id == self.local_node_id {
            return;
        }
        if let Ok(Some(candidate)) = self.table.update(node_id) {
            trace!(candidate = %candidate, "Bucket full, probing eviction candidate");
            let _ = handle
                .clone()
                .cast(InMessage::ProbeNode { node_id: candidate })
                .await;
        }
    }

    fn probe_oldest(&mut self, handle: &GenServerHandle<Self>) {
        match self.table.oldest_entry() {
            Some(node_id) => {
                debug!(node_id = %node_id, "Probing stalest routing table entry");
                self.spawn_probe(node_id, handle);
            }
            None => warn!("Routing table is empty, no one to ping"),
        }
    }

    fn spawn_probe(&self, node_id: H256, handle: &GenServerHandle<Self>) {
        tokio::spawn(probe_node(
            self.dispatcher.clone(),
            self.enr_store.clone(),
            self.registry.clone(),
            self.endpoint_vote_tx.clone(),
            handle.clone(),
            self.local_node_id,
            node_id,
        ));
    }
}

impl GenServer for RoutingTableManagerServer {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = Unused;
    type Error = ManagerError;

    async fn init(
        mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<InitResult<Self>, Self::Error> {
        // the network learns about us through the bootstrap peers; they are
        // the table's seed
        for node_id in std::mem::take(&mut self.bootstrap_node_ids) {
            let _ = self.table.update(node_id);
        }

        let ping_rx = self.dispatcher.subscribe(Message::PING).await?;
        spawn_listener(
            handle.clone(),
            |message| InMessage::Request(Box::new(message)),
            ReceiverStream::new(ping_rx).map(Ok::<_, std::convert::Infallible>),
        );
        let find_node_rx = self.dispatcher.subscribe(Message::FIND_NODE).await?;
        spawn_listener(
            handle.clone(),
            |message| InMessage::Request(Box::new(message)),
            ReceiverStream::new(find_node_rx).map(Ok::<_, std::convert::Infallible>),
        );

        send_interval(self.ping_interval, handle.clone(), InMessage::Probe);

        Ok(InitResult::Success(self))
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            InMessage::Request(incoming) => {
                let _ = self
                    .handle_request(*incoming, handle)
                    .await
                    .inspect_err(|err| warn!(err = %err, "Error handling request"));
            }
            InMessage::Probe => self.probe_oldest(handle),
            InMessage::ProbeNode { node_id } => self.spawn_probe(node_id, handle),
            InMessage::NodeActive { node_id } => self.note_active(node_id, handle).await,
            InMessage::EvictNode { node_id } => {
                debug!(node_id = %node_id, "Evicting peer from routing table");
                self.table.remove(node_id);
            }
            InMessage::Shutdown => return CastResponse::Stop,
        }
        CastResponse::NoReply
    }
}

/// Pings a node and reports the verdict back to the manager: a Pong keeps
/// it in the table and casts an endpoint vote, anything else evicts it.
#[allow(clippy::too_many_arguments)]
async fn probe_node(
    mut dispatcher: MessageDispatcher,
    mut enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    endpoint_vote_tx: mpsc::Sender<EndpointVote>,
    mut handle: GenServerHandle<RoutingTableManagerServer>,
    local_node_id: H256,
    node_id: H256,
) {
    let local_seq = match enr_store.get(local_node_id).await {
        Ok(Some(record)) => record.seq(),
        _ => {
            warn!("Local record missing from the store, skipping probe");
            return;
        }
    };

    let response = dispatcher
        .request(node_id, |request_id| {
            Message::Ping(PingMessage {
                request_id,
                enr_seq: local_seq,
            })
        })
        .await;

    match response {
        Ok(incoming) => match &incoming.message {
            Message::Pong(pong) => {
                trace!(from = %node_id, "Received Pong");
                let _ = handle.cast(InMessage::NodeActive { node_id }).await;
                let vote = EndpointVote {
                    endpoint: Endpoint::new(pong.packet_ip, pong.packet_port),
                    node_id,
                    at: Instant::now(),
                };
                let _ = endpoint_vote_tx.send(vote).await;
                maybe_refresh_remote_enr(
                    dispatcher,
                    enr_store,
                    registry,
                    handle,
                    node_id,
                    pong.enr_seq,
                )
                .await;
            }
            other => {
                warn!(from = %node_id, message = %other, "Peer answered Ping with the wrong message, evicting");
                let _ = handle.cast(InMessage::EvictNode { node_id }).await;
            }
        },
        Err(err) => {
            debug!(node_id = %node_id, err = %err, "Ping probe failed, evicting");
            let _ = handle.cast(InMessage::EvictNode { node_id }).await;
        }
    }
}

/// Requests the peer's record via FindNode(distance 0) when its advertised
/// sequence number is ahead of the stored one.
async fn maybe_refresh_remote_enr(
    dispatcher: MessageDispatcher,
    mut enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    handle: GenServerHandle<RoutingTableManagerServer>,
    node_id: H256,
    advertised_seq: u64,
) {
    let current_seq = match enr_store.get(node_id).await {
        Ok(record) => record.map(|record| record.seq()),
        Err(err) => {
            debug!(err = %err, "Failed to look up record");
            return;
        }
    };

    let request_update = match current_seq {
        None => {
            warn!(
                node_id = %node_id,
                "No record for peer present even though it should be post handshake, requesting it"
            );
            true
        }
        Some(current) if current < advertised_seq => {
            debug!(
                node_id = %node_id,
                current,
                advertised = advertised_seq,
                "Peer advertises a newer record"
            );
            true
        }
        Some(current) if current > advertised_seq => {
            warn!(
                node_id = %node_id,
                current,
                advertised = advertised_seq,
                "Peer advertises an outdated record"
            );
            false
        }
        Some(_) => false,
    };

    if request_update {
        refresh_remote_enr(dispatcher, enr_store, registry, handle, node_id).await;
    }
}

async fn refresh_remote_enr(
    mut dispatcher: MessageDispatcher,
    mut enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    mut handle: GenServerHandle<RoutingTableManagerServer>,
    node_id: H256,
) {
    let response = dispatcher
        .request(node_id, |request_id| {
            Message::FindNode(FindNodeMessage {
                request_id,
                distance: 0,
            })
        })
        .await;

    let incoming = match response {
        Ok(incoming) => incoming,
        Err(err) => {
            warn!(node_id = %node_id, err = %err, "FindNode record refresh failed");
            return;
        }
    };
    let _ = handle.cast(InMessage::NodeActive { node_id }).await;

    let Message::Nodes(nodes) = &incoming.message else {
        warn!(
            node_id = %node_id,
            message = %incoming.message,
            "Peer responded to FindNode with the wrong message"
        );
        return;
    };

    if nodes.enrs.is_empty() {
        warn!(node_id = %node_id, "Peer responded to FindNode with an empty Nodes message");
    } else if nodes.enrs.len() > 1 {
        warn!(node_id = %node_id, "Peer responded to FindNode(0) with more than one record");
    }

    for record in &nodes.enrs {
        match record.node_id(&registry) {
            Ok(record_node_id) if record_node_id == node_id => {}
            Ok(record_node_id) => {
                warn!(
                    node_id = %node_id,
                    got = %record_node_id,
                    "Peer responded with a record belonging to a different node"
                );
                continue;
            }
            Err(err) => {
                warn!(node_id = %node_id, err = %err, "Peer responded with an invalid record");
                continue;
            }
        }
        if record.verify_signature(&registry).is_err() {
            warn!(node_id = %node_id, "Peer responded with a record carrying a bad signature");
            continue;
        }
        if let Err(err) = enr_store.insert_or_update(record.clone()).await {
            debug!(node_id = %node_id, err = %err, "Failed to store refreshed record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        table::log_distance,
        types::EnrBuilder,
    };
    use secp256k1::{SECP256K1, SecretKey};
    use std::net::{IpAddr, Ipv4Addr};

    fn registry() -> IdentitySchemeRegistry {
        IdentitySchemeRegistry::with_default_schemes()
    }

    fn make_record(seed: u8, seq: u64) -> crate::types::Enr {
        let signer = SecretKey::from_slice(&[seed; 32]).unwrap();
        EnrBuilder::new(seq)
            .add(b"id", "v4")
            .add(
                b"secp256k1",
                signer.public_key(SECP256K1).serialize().as_slice(),
            )
            .add(b"ip", &Ipv4Addr::new(127, 0, 0, 1))
            .add(b"udp", &(41000 + seed as u16))
            .sign(&signer.secret_bytes(), &registry())
            .unwrap()
    }

    struct Harness {
        manager: RoutingTableManager,
        incoming_tx: mpsc::Sender<IncomingMessage>,
        outgoing_rx: mpsc::Receiver<OutgoingMessage>,
        vote_rx: mpsc::Receiver<EndpointVote>,
        local_node_id: H256,
        local_enr: crate::types::Enr,
    }

    /// A manager wired to a real dispatcher whose packet side is the test
    /// itself: requests surface on `outgoing_rx`, responses are fed through
    /// `incoming_tx`.
    async fn harness(extra_records: Vec<crate::types::Enr>) -> Harness {
        let local_enr = make_record(0x31, 4);
        let local_node_id = local_enr.node_id(&registry()).unwrap();

        let mut store = EnrStore::spawn(registry());
        store.insert(local_enr.clone()).await.unwrap();
        for record in extra_records {
            store.insert_or_update(record).await.unwrap();
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
        let (vote_tx, vote_rx) = mpsc::channel(16);
        let dispatcher = MessageDispatcher::spawn(
            store.clone(),
            outgoing_tx.clone(),
            incoming_rx,
            Duration::from_millis(200),
        );
        let manager = RoutingTableManager::spawn(
            local_node_id,
            16,
            vec![],
            dispatcher,
            store,
            registry(),
            outgoing_tx,
            vote_tx,
            Duration::from_secs(3600),
        );
        Harness {
            manager,
            incoming_tx,
            outgoing_rx,
            vote_rx,
            local_node_id,
            local_enr,
        }
    }

    fn peer_endpoint(seed: u8) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 41000 + seed as u16)
    }

    async fn recv_outgoing(rx: &mut mpsc::Receiver<OutgoingMessage>) -> OutgoingMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outgoing message")
            .expect("outgoing channel closed")
    }

    #[tokio::test]
    async fn ping_is_answered_with_observed_endpoint() {
        let peer = make_record(0x32, 1);
        let peer_id = peer.node_id(&registry()).unwrap();
        let mut h = harness(vec![peer]).await;

        h.incoming_tx
            .send(IncomingMessage {
                message: Message::Ping(PingMessage {
                    request_id: 42,
                    enr_seq: 1,
                }),
                sender: peer_endpoint(0x32),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();

        let outgoing = recv_outgoing(&mut h.outgoing_rx).await;
        assert_eq!(outgoing.receiver_node_id, peer_id);
        let Message::Pong(pong) = outgoing.message else {
            panic!("expected Pong, got {}", outgoing.message);
        };
        assert_eq!(pong.request_id, 42);
        assert_eq!(pong.enr_seq, h.local_enr.seq());
        assert_eq!(pong.packet_ip, peer_endpoint(0x32).ip);
        assert_eq!(pong.packet_port, peer_endpoint(0x32).port);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn newer_advertised_seq_triggers_record_refresh() {
        let peer = make_record(0x33, 1);
        let peer_id = peer.node_id(&registry()).unwrap();
        let mut h = harness(vec![peer]).await;

        h.incoming_tx
            .send(IncomingMessage {
                message: Message::Ping(PingMessage {
                    request_id: 1,
                    enr_seq: 9,
                }),
                sender: peer_endpoint(0x33),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();

        // first the pong, then the background FindNode(0) asking for the
        // advertised record
        let pong = recv_outgoing(&mut h.outgoing_rx).await;
        assert!(matches!(pong.message, Message::Pong(_)));
        let refresh = recv_outgoing(&mut h.outgoing_rx).await;
        let Message::FindNode(find_node) = refresh.message else {
            panic!("expected FindNode, got {}", refresh.message);
        };
        assert_eq!(find_node.distance, 0);
        assert_eq!(refresh.receiver_node_id, peer_id);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn find_node_zero_serves_the_local_record() {
        let peer = make_record(0x34, 1);
        let peer_id = peer.node_id(&registry()).unwrap();
        let mut h = harness(vec![peer]).await;

        h.incoming_tx
            .send(IncomingMessage {
                message: Message::FindNode(FindNodeMessage {
                    request_id: 7,
                    distance: 0,
                }),
                sender: peer_endpoint(0x34),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();

        let outgoing = recv_outgoing(&mut h.outgoing_rx).await;
        let Message::Nodes(nodes) = outgoing.message else {
            panic!("expected Nodes, got {}", outgoing.message);
        };
        assert_eq!(nodes.request_id, 7);
        assert_eq!(nodes.total, 1);
        assert_eq!(nodes.enrs, vec![h.local_enr.clone()]);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn find_node_serves_bucket_members_at_distance() {
        let peer = make_record(0x35, 1);
        let peer_id = peer.node_id(&registry()).unwrap();
        let mut h = harness(vec![peer.clone()]).await;

        // a ping makes the peer a table member
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::Ping(PingMessage {
                    request_id: 1,
                    enr_seq: 1,
                }),
                sender: peer_endpoint(0x35),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();
        let _pong = recv_outgoing(&mut h.outgoing_rx).await;

        let distance = log_distance(&h.local_node_id, &peer_id).unwrap() as u64;
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::FindNode(FindNodeMessage {
                    request_id: 8,
                    distance,
                }),
                sender: peer_endpoint(0x35),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();

        let outgoing = recv_outgoing(&mut h.outgoing_rx).await;
        let Message::Nodes(nodes) = outgoing.message else {
            panic!("expected Nodes, got {}", outgoing.message);
        };
        assert_eq!(nodes.total, 1);
        assert_eq!(nodes.enrs, vec![peer]);

        // an empty bucket yields a single empty response
        let other_distance = if distance == 255 { 254 } else { 255 };
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::FindNode(FindNodeMessage {
                    request_id: 9,
                    distance: other_distance,
                }),
                sender: peer_endpoint(0x35),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();
        let outgoing = recv_outgoing(&mut h.outgoing_rx).await;
        let Message::Nodes(nodes) = outgoing.message else {
            panic!("expected Nodes, got {}", outgoing.message);
        };
        assert_eq!(nodes.total, 1);
        assert!(nodes.enrs.is_empty());
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn large_buckets_are_served_in_chunks_with_matching_totals() {
        let local_enr = make_record(0x31, 4);
        let local_node_id = local_enr.node_id(&registry()).unwrap();

        // four peers sharing bucket 255 with the harness-local node
        let mut peers = Vec::new();
        for seed in 1u8..=255 {
            if seed == 0x31 {
                continue;
            }
            let record = make_record(seed, 1);
            let node_id = record.node_id(&registry()).unwrap();
            if log_distance(&local_node_id, &node_id) == Some(255) {
                peers.push((record, node_id, seed));
            }
            if peers.len() == 4 {
                break;
            }
        }
        assert_eq!(peers.len(), 4);

        let mut h = harness(peers.iter().map(|(record, _, _)| record.clone()).collect()).await;
        for (_, node_id, seed) in &peers {
            h.incoming_tx
                .send(IncomingMessage {
                    message: Message::Ping(PingMessage {
                        request_id: 1,
                        enr_seq: 1,
                    }),
                    sender: peer_endpoint(*seed),
                    sender_node_id: *node_id,
                })
                .await
                .unwrap();
            let _pong = recv_outgoing(&mut h.outgoing_rx).await;
        }

        let prober_id = h.local_node_id ^ H256::from_low_u64_be(1);
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::FindNode(FindNodeMessage {
                    request_id: 3,
                    distance: 255,
                }),
                sender: peer_endpoint(0x01),
                sender_node_id: prober_id,
            })
            .await
            .unwrap();

        let mut served = Vec::new();
        for expected_len in [3usize, 1] {
            let outgoing = recv_outgoing(&mut h.outgoing_rx).await;
            let Message::Nodes(nodes) = outgoing.message else {
                panic!("expected Nodes, got {}", outgoing.message);
            };
            assert_eq!(nodes.request_id, 3);
            assert_eq!(nodes.total, 2);
            assert_eq!(nodes.enrs.len(), expected_len);
            served.extend(nodes.enrs);
        }
        for (record, _, _) in &peers {
            assert!(served.contains(record));
        }
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn unanswered_probe_evicts_the_peer() {
        let peer = make_record(0x36, 1);
        let peer_id = peer.node_id(&registry()).unwrap();
        let mut h = harness(vec![peer]).await;

        // seat the peer in the table
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::Ping(PingMessage {
                    request_id: 1,
                    enr_seq: 1,
                }),
                sender: peer_endpoint(0x36),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();
        let _pong = recv_outgoing(&mut h.outgoing_rx).await;

        // probe it; the ping goes unanswered and times out
        h.manager
            .handle
            .cast(InMessage::ProbeNode { node_id: peer_id })
            .await
            .unwrap();
        let probe = recv_outgoing(&mut h.outgoing_rx).await;
        assert!(matches!(probe.message, Message::Ping(_)));
        tokio::time::sleep(Duration::from_millis(500)).await;

        // the peer is gone from its bucket; query from a sender sitting in
        // bucket 0 so asking does not re-seat the evicted peer
        let prober_id = h.local_node_id ^ H256::from_low_u64_be(1);
        let distance = log_distance(&h.local_node_id, &peer_id).unwrap() as u64;
        assert_ne!(distance, 0);
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::FindNode(FindNodeMessage {
                    request_id: 2,
                    distance,
                }),
                sender: peer_endpoint(0x36),
                sender_node_id: prober_id,
            })
            .await
            .unwrap();
        let outgoing = recv_outgoing(&mut h.outgoing_rx).await;
        let Message::Nodes(nodes) = outgoing.message else {
            panic!("expected Nodes, got {}", outgoing.message);
        };
        assert!(nodes.enrs.is_empty());
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn answered_probe_casts_an_endpoint_vote() {
        let peer = make_record(0x37, 1);
        let peer_id = peer.node_id(&registry()).unwrap();
        let mut h = harness(vec![peer]).await;

        h.manager
            .handle
            .cast(InMessage::ProbeNode { node_id: peer_id })
            .await
            .unwrap();
        let probe = recv_outgoing(&mut h.outgoing_rx).await;
        let observed = Endpoint::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 44)), 30344);
        h.incoming_tx
            .send(IncomingMessage {
                message: Message::Pong(PongMessage {
                    request_id: probe.message.request_id(),
                    enr_seq: 1,
                    packet_ip: observed.ip,
                    packet_port: observed.port,
                }),
                sender: peer_endpoint(0x37),
                sender_node_id: peer_id,
            })
            .await
            .unwrap();

        let vote = tokio::time::timeout(Duration::from_secs(2), h.vote_rx.recv())
            .await
            .expect("timed out waiting for endpoint vote")
            .expect("vote channel closed");
        assert_eq!(vote.endpoint, observed);
        assert_eq!(vote.node_id, peer_id);
        h.manager.shutdown().await;
    }
}
