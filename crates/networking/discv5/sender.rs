//! The datagram sender: owns the outbound half of the UDP socket and drains
//! the outgoing packet channel. Together with the `UdpFramed` receive
//! stream, it is the only place the socket is touched.

use crate::types::OutgoingPacket;
use futures::StreamExt;
use spawned_concurrency::{
    messages::Unused,
    tasks::{CastResponse, GenServer, GenServerHandle, InitResult, spawn_listener},
};
use std::sync::Arc;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum DatagramSenderError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct DatagramSender {
    udp_socket: Arc<UdpSocket>,
    outgoing_packet_rx: Option<mpsc::Receiver<OutgoingPacket>>,
}

impl DatagramSender {
    pub fn spawn(
        udp_socket: Arc<UdpSocket>,
        outgoing_packet_rx: mpsc::Receiver<OutgoingPacket>,
    ) -> GenServerHandle<Self> {
        Self {
            udp_socket,
            outgoing_packet_rx: Some(outgoing_packet_rx),
        }
        .start()
    }

    async fn send(&self, outgoing: OutgoingPacket) {
        let encoded = match outgoing.packet.encode_to_vec() {
            Ok(encoded) => encoded,
            Err(err) => {
                debug!(err = %err, to = %outgoing.receiver, "Dropping unencodable packet");
                return;
            }
        };
        match self
            .udp_socket
            .send_to(&encoded, outgoing.receiver.udp_addr())
            .await
        {
            Ok(sent) => trace!(
                bytes = sent,
                to = %outgoing.receiver,
                packet = %outgoing.packet,
                "Sent packet"
            ),
            Err(err) => debug!(err = %err, to = %outgoing.receiver, "Failed to send packet"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum InMessage {
    Packet(Box<OutgoingPacket>),
    Shutdown,
}

impl GenServer for DatagramSender {
    type CallMsg = Unused;
    type CastMsg = InMessage;
    type OutMsg = Unused;
    type Error = DatagramSenderError;

    async fn init(
        mut self,
        handle: &GenServerHandle<Self>,
    ) -> Result<InitResult<Self>, Self::Error> {
        if let Some(rx) = self.outgoing_packet_rx.take() {
            spawn_listener(
                handle.clone(),
                |packet| InMessage::Packet(Box::new(packet)),
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
            InMessage::Packet(outgoing) => {
                self.send(*outgoing).await;
                CastResponse::NoReply
            }
            InMessage::Shutdown => CastResponse::Stop,
        }
    }
}
