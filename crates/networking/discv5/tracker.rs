//! The endpoint tracker: learns the node's own external UDP endpoint from
//! the `Pong` echoes collected by the prober and keeps the local record's
//! `ip`/`udp` entries in sync with it.
//!
//! Every vote is a single sample; the current behavior installs any
//! endpoint that differs from the advertised one, bumping the record's
//! sequence number and re-signing it.

use crate::{
    enr_store::EnrStore,
    scheme::IdentitySchemeRegistry,
    types::{Endpoint, EnrError},
};
use ethereum_types::H256;
use futures::StreamExt;
use secp256k1::SecretKey;
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, InitResult, spawn_listener},
};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// One peer's observation of our external endpoint.
#[derive(Debug, Clone)]
pub struct EndpointVote {
    pub endpoint: Endpoint,
    /// The peer that reported the endpoint.
    pub node_id: H256,
    pub at: Instant,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Enr(#[from] EnrError),
}

#[derive(Debug)]
pub struct EndpointTracker {
    local_private_key: SecretKey,
    local_node_id: H256,
    enr_store: EnrStore,
    registry: IdentitySchemeRegistry,
    vote_rx: Option<mpsc::Receiver<EndpointVote>>,
}

#[derive(Debug, Clone)]
pub enum InMessage {
    Vote(Box<EndpointVote>),
    Shutdown,
}

impl EndpointTracker {
    pub fn spawn(
        local_private_key: SecretKey,
        local_node_id: H256,
        enr_store: EnrStore,
        registry: IdentitySchemeRegistry,
        vote_rx: mpsc::Receiver<EndpointVote>,
    ) -> GenServerHandle<Self> {
        Self {
            local_private_key,
            local_node_id,
            enr_store,
            registry,
            vote_rx: Some(vote_rx),
        }
        .start()
    }

    async fn handle_vote(&mut self, vote: EndpointVote) {
        debug!(endpoint = %vote.endpoint, from = %vote.node_id, "Received endpoint vote");

        let current_enr = match self.enr_store.get(self.local_node_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Local record missing from the store, ignoring endpoint vote");
                return;
            }
            Err(err) => {
                warn!(err = %err, "Failed to load local record, ignoring endpoint vote");
                return;
            }
        };

        // TODO: weigh concurrent votes and discard stale ones instead of
        // trusting every single sample
        let advertised = current_enr.udp_endpoint();
        let needs_update = match advertised {
            None => true,
            Some(endpoint) => endpoint != vote.endpoint,
        };
        if !needs_update {
            return;
        }

        let updated = match current_enr.with_updated_endpoint(
            vote.endpoint,
            &self.local_private_key.secret_bytes(),
            &self.registry,
        ) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(err = %err, "Failed to re-sign local record");
                return;
            }
        };
        info!(
            endpoint = %vote.endpoint,
            seq = updated.seq(),
            "Updating local endpoint"
        );
        if let Err(err) = self.enr_store.update(updated).await {
            warn!(err = %err, "Failed to store updated local record");
        }
    }
}

impl GenServer for EndpointTracker {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = Unused;
    type Error = TrackerError;

    async fn init(
        mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<InitResult<Self>, Self::Error> {
        if let Some(rx) = self.vote_rx.take() {
            spawn_listener(
                handle.clone(),
                |vote| InMessage::Vote(Box::new(vote)),
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
            InMessage::Vote(vote) => {
                self.handle_vote(*vote).await;
                CastResponse::NoReply
            }
            InMessage::Shutdown => CastResponse::Stop,
        }
    }
}
