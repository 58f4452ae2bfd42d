//! Datagram-to-packet decoder used with `UdpFramed` on the receive path.

use crate::packet::{Packet, PacketError};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct Discv5Codec;

impl Discv5Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Discv5Codec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // a datagram is always one packet
        let datagram = buf.split_to(buf.len());
        Ok(Some(Packet::decode(&datagram)?))
    }
}

impl Encoder<Packet> for Discv5Codec {
    type Error = PacketError;

    fn encode(&mut self, _packet: Packet, _buf: &mut BytesMut) -> Result<(), Self::Error> {
        // receive-only; the datagram sender handles its own encoding
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Discv5Codec is receive-only",
        )
        .into())
    }
}
