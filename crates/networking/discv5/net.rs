//! Construction and wiring of the discovery service.
//!
//! All components are GenServers connected by bounded channels fixed here,
//! at construction:
//!
//! ```text
//! UdpFramed ──────────────────────> PackerSupervisor ──> PeerPacker*
//! PeerPacker* ──incoming-message──> MessageDispatcher
//! MessageDispatcher / Manager ──outgoing-message──> PackerSupervisor
//! PeerPacker* / Supervisor ────outgoing-packet────> DatagramSender
//! Manager ──endpoint-vote──> EndpointTracker
//! ```
//!
//! There are no runtime reference cycles: services hold sender halves only.

use crate::{
    dispatcher::MessageDispatcher,
    enr_store::EnrStore,
    error::DiscoveryError,
    manager::RoutingTableManager,
    scheme::IdentitySchemeRegistry,
    sender::{self, DatagramSender},
    supervisor::{self, PackerSupervisor},
    table::DEFAULT_BUCKET_SIZE,
    tracker::{self, EndpointTracker, EndpointVote},
    types::{
        Enr, EnrBuilder, ID_ENR_KEY, IP6_ENR_KEY, IP_ENR_KEY, IncomingMessage, OutgoingMessage,
        OutgoingPacket, UDP6_PORT_ENR_KEY, UDP_PORT_ENR_KEY,
    },
};
use ethereum_types::H256;
use secp256k1::{SECP256K1, SecretKey};
use spawned_concurrency::tasks::GenServerHandle;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{info, warn};

/// Capacity of the inter-service channels.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Discv5Config {
    /// Local UDP bind address.
    pub listen_address: SocketAddr,
    /// Seed records loaded at startup.
    pub bootstrap_enrs: Vec<Enr>,
    /// Routing bucket capacity (the `k` in k-bucket).
    pub bucket_size: usize,
    /// Cadence of the liveness prober.
    pub ping_interval: Duration,
    /// Default timeout of a request awaiting its response.
    pub request_timeout: Duration,
}

impl Default for Discv5Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:30303".parse().expect("valid literal address"),
            bootstrap_enrs: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            ping_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(1),
        }
    }
}

/// A running discovery node.
///
/// Dropping the service does not stop it; call [`shutdown`] for an orderly
/// teardown.
///
/// [`shutdown`]: Discv5Service::shutdown
#[derive(Debug)]
pub struct Discv5Service {
    pub local_node_id: H256,
    pub local_enr: Enr,
    pub enr_store: EnrStore,
    pub dispatcher: MessageDispatcher,
    supervisor: GenServerHandle<PackerSupervisor>,
    datagram_sender: GenServerHandle<DatagramSender>,
    manager: RoutingTableManager,
    tracker: GenServerHandle<EndpointTracker>,
}

impl Discv5Service {
    pub async fn spawn(config: Discv5Config, signer: SecretKey) -> Result<Self, DiscoveryError> {
        let registry = IdentitySchemeRegistry::with_default_schemes();

        let udp_socket = Arc::new(UdpSocket::bind(config.listen_address).await?);
        let local_addr = udp_socket.local_addr()?;

        let local_enr = build_local_enr(&signer, local_addr, &registry)?;
        let local_node_id = local_enr.node_id(&registry)?;
        info!(node_id = %local_node_id, addr = %local_addr, "Starting discovery service");

        let (incoming_message_tx, incoming_message_rx) =
            mpsc::channel::<IncomingMessage>(CHANNEL_CAPACITY);
        let (outgoing_message_tx, outgoing_message_rx) =
            mpsc::channel::<OutgoingMessage>(CHANNEL_CAPACITY);
        let (outgoing_packet_tx, outgoing_packet_rx) =
            mpsc::channel::<OutgoingPacket>(CHANNEL_CAPACITY);
        let (endpoint_vote_tx, endpoint_vote_rx) = mpsc::channel::<EndpointVote>(CHANNEL_CAPACITY);

        let mut enr_store = EnrStore::spawn(registry.clone());
        enr_store.insert(local_enr.clone()).await?;

        info!(count = config.bootstrap_enrs.len(), "Adding bootstrap records");
        let mut bootstrap_node_ids = Vec::new();
        for record in config.bootstrap_enrs {
            if let Err(err) = record.verify_signature(&registry) {
                warn!(err = %err, "Skipping bootstrap record with invalid signature");
                continue;
            }
            let node_id = record.node_id(&registry)?;
            enr_store.insert_or_update(record).await?;
            bootstrap_node_ids.push(node_id);
        }

        let datagram_sender = DatagramSender::spawn(udp_socket.clone(), outgoing_packet_rx);
        let supervisor = PackerSupervisor::spawn(
            signer,
            local_node_id,
            enr_store.clone(),
            registry.clone(),
            udp_socket,
            incoming_message_tx,
            outgoing_packet_tx,
            outgoing_message_rx,
        );
        let dispatcher = MessageDispatcher::spawn(
            enr_store.clone(),
            outgoing_message_tx.clone(),
            incoming_message_rx,
            config.request_timeout,
        );
        let manager = RoutingTableManager::spawn(
            local_node_id,
            config.bucket_size,
            bootstrap_node_ids,
            dispatcher.clone(),
            enr_store.clone(),
            registry.clone(),
            outgoing_message_tx,
            endpoint_vote_tx,
            config.ping_interval,
        );
        let tracker = EndpointTracker::spawn(
            signer,
            local_node_id,
            enr_store.clone(),
            registry,
            endpoint_vote_rx,
        );

        Ok(Self {
            local_node_id,
            local_enr,
            enr_store,
            dispatcher,
            supervisor,
            datagram_sender,
            manager,
            tracker,
        })
    }

    /// Stops all services. Pending requests observe the shutdown as a
    /// cancellation error.
    pub async fn shutdown(&mut self) {
        self.manager.shutdown().await;
        let _ = self.tracker.cast(tracker::InMessage::Shutdown).await;
        let _ = self.dispatcher.shutdown().await;
        let _ = self
            .supervisor
            .cast(supervisor::InMessage::Shutdown)
            .await;
        let _ = self
            .datagram_sender
            .cast(sender::InMessage::Shutdown)
            .await;
        let _ = self.enr_store.shutdown().await;
    }
}

/// The local record: identity scheme, public key, and, when the bind
/// address is routable, the advertised endpoint. The endpoint tracker
/// fills in or corrects the endpoint later from peer votes.
fn build_local_enr(
    signer: &SecretKey,
    local_addr: SocketAddr,
    registry: &IdentitySchemeRegistry,
) -> Result<Enr, DiscoveryError> {
    let public_key = signer.public_key(SECP256K1).serialize();
    let mut builder = EnrBuilder::new(1)
        .add(ID_ENR_KEY, "v4")
        .add(b"secp256k1", public_key.as_slice());

    if !local_addr.ip().is_unspecified() {
        builder = match local_addr.ip() {
            IpAddr::V4(ip) => builder
                .add(IP_ENR_KEY, &ip)
                .add(UDP_PORT_ENR_KEY, &local_addr.port()),
            IpAddr::V6(ip) => builder
                .add(IP6_ENR_KEY, &ip)
                .add(UDP6_PORT_ENR_KEY, &local_addr.port()),
        };
    }

    Ok(builder.sign(&signer.secret_bytes(), registry)?)
}
