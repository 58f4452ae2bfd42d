//! The request/response multiplexer sitting above the packers.
//!
//! Inbound messages are routed two ways, not mutually exclusive: by message
//! type to the registered request handler, and by `(sender, request id)` to
//! the awaiter of a pending request. A message matching both is delivered
//! twice (and logged); one matching neither is dropped.
//!
//! [`MessageDispatcher::request`] allocates a collision-free request id,
//! resolves the peer's endpoint from the record store, sends the message and
//! awaits the correlated response under a timeout.

use crate::{
    enr_store::{EnrStore, EnrStoreError},
    messages::Message,
    types::{IncomingMessage, OutgoingMessage},
};
use ethereum_types::H256;
use futures::StreamExt;
use rand::{RngCore, rngs::OsRng};
use rustc_hash::FxHashMap;
use spawned_concurrency::{
    error::GenServerError,
    tasks::{CallResponse, CastResponse, GenServer, GenServerHandle, InitResult, spawn_listener},
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// How often a colliding request id is re-sampled before giving up.
const MAX_REQUEST_ID_ATTEMPTS: usize = 3;
/// Capacity of a request handler's subscription channel.
const REQUEST_HANDLER_CHANNEL_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no known endpoint for peer {0:#x}")]
    UnknownEndpoint(H256),
    #[error("request timed out")]
    Timeout,
    #[error("request was cancelled")]
    Cancelled,
    #[error("request id space for the peer is exhausted")]
    IdSpaceExhausted,
    #[error("a handler for message type {0} is already registered")]
    AlreadySubscribed(u8),
    #[error(transparent)]
    Store(#[from] EnrStoreError),
    #[error("internal dispatcher error: {0}")]
    Internal(#[from] GenServerError),
}

/// Handle to the dispatcher, cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    handle: GenServerHandle<MessageDispatcherServer>,
    enr_store: EnrStore,
    outgoing_message_tx: mpsc::Sender<OutgoingMessage>,
    request_timeout: Duration,
}

impl MessageDispatcher {
    pub fn spawn(
        enr_store: EnrStore,
        outgoing_message_tx: mpsc::Sender<OutgoingMessage>,
        incoming_message_rx: mpsc::Receiver<IncomingMessage>,
        request_timeout: Duration,
    ) -> Self {
        let handle = MessageDispatcherServer {
            incoming_message_rx: Some(incoming_message_rx),
            request_handlers: Default::default(),
            response_slots: Default::default(),
        }
        .start();
        Self {
            handle,
            enr_store,
            outgoing_message_tx,
            request_timeout,
        }
    }

    /// Sends a request built from a fresh request id and awaits the
    /// response under the default timeout.
    pub async fn request(
        &mut self,
        receiver_node_id: H256,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<IncomingMessage, RequestError> {
        self.request_with_timeout(receiver_node_id, build, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &mut self,
        receiver_node_id: H256,
        build: impl FnOnce(u64) -> Message,
        timeout: Duration,
    ) -> Result<IncomingMessage, RequestError> {
        let opened = self
            .handle
            .call(CallMessage::OpenRequest {
                node_id: receiver_node_id,
            })
            .await?;
        let (request_id, response_rx) = match opened {
            OutMessage::RequestOpened {
                request_id,
                response_rx,
            } => (request_id, response_rx),
            OutMessage::IdSpaceExhausted => return Err(RequestError::IdSpaceExhausted),
            _ => unreachable!(),
        };

        let message = build(request_id);
        debug_assert_eq!(message.request_id(), request_id);

        let outgoing = match self.prepare_outgoing_message(receiver_node_id, message).await {
            Ok(outgoing) => outgoing,
            Err(err) => {
                self.close_request(receiver_node_id, request_id).await;
                return Err(err);
            }
        };
        debug!(
            to = %receiver_node_id,
            message = %outgoing.message,
            "Sending request"
        );
        if self.outgoing_message_tx.send(outgoing).await.is_err() {
            self.close_request(receiver_node_id, request_id).await;
            return Err(RequestError::Cancelled);
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => {
                debug!(from = %receiver_node_id, message = %response.message, "Received response");
                Ok(response)
            }
            // the dispatcher dropped the slot, e.g. on shutdown
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                self.close_request(receiver_node_id, request_id).await;
                Err(RequestError::Timeout)
            }
        }
    }

    /// Subscribes to inbound requests of the given message type. At most
    /// one handler per type may exist at a time.
    pub async fn subscribe(
        &mut self,
        message_type: u8,
    ) -> Result<mpsc::Receiver<IncomingMessage>, RequestError> {
        match self
            .handle
            .call(CallMessage::Subscribe { message_type })
            .await?
        {
            OutMessage::Subscribed(receiver) => Ok(receiver),
            OutMessage::AlreadySubscribed => Err(RequestError::AlreadySubscribed(message_type)),
            _ => unreachable!(),
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), RequestError> {
        self.handle.cast(CastMessage::Shutdown).await?;
        Ok(())
    }

    /// Resolves the peer's UDP endpoint from its stored record.
    async fn prepare_outgoing_message(
        &mut self,
        receiver_node_id: H256,
        message: Message,
    ) -> Result<OutgoingMessage, RequestError> {
        let record = self
            .enr_store
            .get(receiver_node_id)
            .await?
            .ok_or(RequestError::UnknownEndpoint(receiver_node_id))?;
        let receiver = record
            .udp_endpoint()
            .ok_or(RequestError::UnknownEndpoint(receiver_node_id))?;
        Ok(OutgoingMessage {
            message,
            receiver,
            receiver_node_id,
        })
    }

    async fn close_request(&mut self, node_id: H256, request_id: u64) {
        let _ = self
            .handle
            .cast(CastMessage::CloseRequest {
                node_id,
                request_id,
            })
            .await;
    }
}

#[derive(Debug)]
struct MessageDispatcherServer {
    incoming_message_rx: Option<mpsc::Receiver<IncomingMessage>>,
    request_handlers: FxHashMap<u8, mpsc::Sender<IncomingMessage>>,
    response_slots: FxHashMap<(H256, u64), oneshot::Sender<IncomingMessage>>,
}

impl MessageDispatcherServer {
    async fn handle_incoming_message(&mut self, incoming: IncomingMessage) {
        let sender_node_id = incoming.sender_node_id;
        let message_type = incoming.message.code();
        let request_id = incoming.message.request_id();

        let is_request = self.request_handlers.contains_key(&message_type);
        let is_response = self.response_slots.contains_key(&(sender_node_id, request_id));

        if is_request && is_response {
            warn!(
                from = %sender_node_id,
                message = %incoming.message,
                "Message matches both a request handler and a pending response, handling twice"
            );
        }
        if !is_request && !is_response {
            debug!(
                from = %sender_node_id,
                message = %incoming.message,
                "Dropping message, no request or response handler is present"
            );
            return;
        }

        if is_request
            && let Some(handler) = self.request_handlers.get(&message_type).cloned()
            && handler.send(incoming.clone()).await.is_err()
        {
            debug!(
                message_type,
                "Request handler went away, removing subscription"
            );
            self.request_handlers.remove(&message_type);
        }

        if is_response
            && let Some(slot) = self.response_slots.remove(&(sender_node_id, request_id))
        {
            // the awaiter may have timed out in the meantime
            let _ = slot.send(incoming);
        }
    }

    fn open_request(&mut self, node_id: H256) -> OutMessage {
        for _ in 0..MAX_REQUEST_ID_ATTEMPTS {
            let request_id = OsRng.next_u64();
            if self.response_slots.contains_key(&(node_id, request_id)) {
                continue;
            }
            let (response_tx, response_rx) = oneshot::channel();
            self.response_slots.insert((node_id, request_id), response_tx);
            return OutMessage::RequestOpened {
                request_id,
                response_rx,
            };
        }
        // with 64-bit ids this is all but unreachable
        OutMessage::IdSpaceExhausted
    }

    fn subscribe(&mut self, message_type: u8) -> OutMessage {
        if self.request_handlers.contains_key(&message_type) {
            return OutMessage::AlreadySubscribed;
        }
        let (handler_tx, handler_rx) = mpsc::channel(REQUEST_HANDLER_CHANNEL_SIZE);
        debug!(message_type, "Adding request handler");
        self.request_handlers.insert(message_type, handler_tx);
        OutMessage::Subscribed(handler_rx)
    }
}

#[derive(Debug, Clone)]
enum CallMessage {
    OpenRequest { node_id: H256 },
    Subscribe { message_type: u8 },
}

#[derive(Debug, Clone)]
enum CastMessage {
    Incoming(Box<IncomingMessage>),
    CloseRequest { node_id: H256, request_id: u64 },
    Shutdown,
}

#[derive(Debug)]
enum OutMessage {
    RequestOpened {
        request_id: u64,
        response_rx: oneshot::Receiver<IncomingMessage>,
    },
    IdSpaceExhausted,
    Subscribed(mpsc::Receiver<IncomingMessage>),
    AlreadySubscribed,
}

impl GenServer for MessageDispatcherServer {
    type CallMsg = CallMessage;
    type CastMsg = CastMessage;
    type OutMsg = OutMessage;
    type Error = RequestError;

    async fn init(
        mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<InitResult<Self>, Self::Error> {
        if let Some(rx) = self.incoming_message_rx.take() {
            spawn_listener(
                handle.clone(),
                |message| CastMessage::Incoming(Box::new(message)),
                ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
            );
        }
        Ok(InitResult::Success(self))
    }

    async fn handle_call(
        &mut self,
        message: Self::CallMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CallResponse<Self> {
        match message {
            CallMessage::OpenRequest { node_id } => CallResponse::Reply(self.open_request(node_id)),
            CallMessage::Subscribe { message_type } => {
                CallResponse::Reply(self.subscribe(message_type))
            }
        }
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            CastMessage::Incoming(incoming) => {
                self.handle_incoming_message(*incoming).await;
                CastResponse::NoReply
            }
            CastMessage::CloseRequest {
                node_id,
                request_id,
            } => {
                self.response_slots.remove(&(node_id, request_id));
                CastResponse::NoReply
            }
            // dropping the state fails all pending awaiters
            CastMessage::Shutdown => CastResponse::Stop,
        }
    }
}
