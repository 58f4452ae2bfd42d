//! The discovery protocol messages.
//!
//! On the wire a message is a one-byte type code followed by the RLP list of
//! its fields, the first of which is always the request id. Type codes are
//! contiguous starting from 1.

use crate::types::Enr;
use bytes::{BufMut, Bytes};
use ethereum_types::H256;
use kadmos_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use std::{fmt::Display, net::IpAddr};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageDecodeError {
    #[error("message is empty")]
    Empty,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(PingMessage),
    Pong(PongMessage),
    FindNode(FindNodeMessage),
    Nodes(NodesMessage),
    ReqTicket(ReqTicketMessage),
    Ticket(TicketMessage),
    RegTopic(RegTopicMessage),
    RegConfirmation(RegConfirmationMessage),
    TopicQuery(TopicQueryMessage),
}

impl Message {
    pub const PING: u8 = 1;
    pub const PONG: u8 = 2;
    pub const FIND_NODE: u8 = 3;
    pub const NODES: u8 = 4;
    pub const REQ_TICKET: u8 = 5;
    pub const TICKET: u8 = 6;
    pub const REG_TOPIC: u8 = 7;
    pub const REG_CONFIRMATION: u8 = 8;
    pub const TOPIC_QUERY: u8 = 9;

    pub fn code(&self) -> u8 {
        match self {
            Message::Ping(_) => Self::PING,
            Message::Pong(_) => Self::PONG,
            Message::FindNode(_) => Self::FIND_NODE,
            Message::Nodes(_) => Self::NODES,
            Message::ReqTicket(_) => Self::REQ_TICKET,
            Message::Ticket(_) => Self::TICKET,
            Message::RegTopic(_) => Self::REG_TOPIC,
            Message::RegConfirmation(_) => Self::REG_CONFIRMATION,
            Message::TopicQuery(_) => Self::TOPIC_QUERY,
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            Message::Ping(m) => m.request_id,
            Message::Pong(m) => m.request_id,
            Message::FindNode(m) => m.request_id,
            Message::Nodes(m) => m.request_id,
            Message::ReqTicket(m) => m.request_id,
            Message::Ticket(m) => m.request_id,
            Message::RegTopic(m) => m.request_id,
            Message::RegConfirmation(m) => m.request_id,
            Message::TopicQuery(m) => m.request_id,
        }
    }

    /// Wire form: type byte followed by the RLP body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.code()];
        match self {
            Message::Ping(m) => m.encode(&mut buf),
            Message::Pong(m) => m.encode(&mut buf),
            Message::FindNode(m) => m.encode(&mut buf),
            Message::Nodes(m) => m.encode(&mut buf),
            Message::ReqTicket(m) => m.encode(&mut buf),
            Message::Ticket(m) => m.encode(&mut buf),
            Message::RegTopic(m) => m.encode(&mut buf),
            Message::RegConfirmation(m) => m.encode(&mut buf),
            Message::TopicQuery(m) => m.encode(&mut buf),
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Message, MessageDecodeError> {
        let (&code, body) = data.split_first().ok_or(MessageDecodeError::Empty)?;
        let message = match code {
            Self::PING => Message::Ping(PingMessage::decode(body)?),
            Self::PONG => Message::Pong(PongMessage::decode(body)?),
            Self::FIND_NODE => Message::FindNode(FindNodeMessage::decode(body)?),
            Self::NODES => Message::Nodes(NodesMessage::decode(body)?),
            Self::REQ_TICKET => Message::ReqTicket(ReqTicketMessage::decode(body)?),
            Self::TICKET => Message::Ticket(TicketMessage::decode(body)?),
            Self::REG_TOPIC => Message::RegTopic(RegTopicMessage::decode(body)?),
            Self::REG_CONFIRMATION => {
                Message::RegConfirmation(RegConfirmationMessage::decode(body)?)
            }
            Self::TOPIC_QUERY => Message::TopicQuery(TopicQueryMessage::decode(body)?),
            unknown => return Err(MessageDecodeError::UnknownType(unknown)),
        };
        Ok(message)
    }

    fn name(&self) -> &'static str {
        match self {
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::FindNode(_) => "FindNode",
            Message::Nodes(_) => "Nodes",
            Message::ReqTicket(_) => "ReqTicket",
            Message::Ticket(_) => "Ticket",
            Message::RegTopic(_) => "RegTopic",
            Message::RegConfirmation(_) => "RegConfirmation",
            Message::TopicQuery(_) => "TopicQuery",
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(request_id={})", self.name(), self.request_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingMessage {
    pub request_id: u64,
    /// The sender's current record sequence number.
    pub enr_seq: u64,
}

impl RLPEncode for PingMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.enr_seq);
        fields.finish(buf);
    }
}

impl RLPDecode for PingMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let enr_seq = fields.decode_field("enr_seq")?;
        let remaining = fields.finish()?;
        Ok((Self { request_id, enr_seq }, remaining))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMessage {
    pub request_id: u64,
    pub enr_seq: u64,
    /// The UDP endpoint the corresponding Ping was observed to come from.
    pub packet_ip: IpAddr,
    pub packet_port: u16,
}

impl RLPEncode for PongMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.enr_seq)
            .encode_field(&self.packet_ip)
            .encode_field(&self.packet_port);
        fields.finish(buf);
    }
}

impl RLPDecode for PongMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let enr_seq = fields.decode_field("enr_seq")?;
        let packet_ip = fields.decode_field("packet_ip")?;
        let packet_port = fields.decode_field("packet_port")?;
        let remaining = fields.finish()?;
        Ok((
            Self {
                request_id,
                enr_seq,
                packet_ip,
                packet_port,
            },
            remaining,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodeMessage {
    pub request_id: u64,
    /// Log2 of the XOR distance between the recipient and the nodes being
    /// looked up; 0 asks for the recipient's own record.
    pub distance: u64,
}

impl RLPEncode for FindNodeMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.distance);
        fields.finish(buf);
    }
}

impl RLPDecode for FindNodeMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let distance = fields.decode_field("distance")?;
        let remaining = fields.finish()?;
        Ok((
            Self {
                request_id,
                distance,
            },
            remaining,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesMessage {
    pub request_id: u64,
    /// Total number of Nodes responses answering the request.
    pub total: u64,
    pub enrs: Vec<Enr>,
}

impl RLPEncode for NodesMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.total)
            .encode_field(&self.enrs);
        fields.finish(buf);
    }
}

impl RLPDecode for NodesMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let total = fields.decode_field("total")?;
        let enrs = fields.decode_field("enrs")?;
        let remaining = fields.finish()?;
        Ok((
            Self {
                request_id,
                total,
                enrs,
            },
            remaining,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqTicketMessage {
    pub request_id: u64,
    pub topic: H256,
}

impl RLPEncode for ReqTicketMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.topic);
        fields.finish(buf);
    }
}

impl RLPDecode for ReqTicketMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let topic = fields.decode_field("topic")?;
        let remaining = fields.finish()?;
        Ok((Self { request_id, topic }, remaining))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMessage {
    pub request_id: u64,
    pub ticket: Bytes,
    pub wait_time: u64,
}

impl RLPEncode for TicketMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.ticket)
            .encode_field(&self.wait_time);
        fields.finish(buf);
    }
}

impl RLPDecode for TicketMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let ticket = fields.decode_field("ticket")?;
        let wait_time = fields.decode_field("wait_time")?;
        let remaining = fields.finish()?;
        Ok((
            Self {
                request_id,
                ticket,
                wait_time,
            },
            remaining,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegTopicMessage {
    pub request_id: u64,
    pub ticket: Bytes,
}

impl RLPEncode for RegTopicMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.ticket);
        fields.finish(buf);
    }
}

impl RLPDecode for RegTopicMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let ticket = fields.decode_field("ticket")?;
        let remaining = fields.finish()?;
        Ok((Self { request_id, ticket }, remaining))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegConfirmationMessage {
    pub request_id: u64,
    pub registered: bool,
}

impl RLPEncode for RegConfirmationMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.registered);
        fields.finish(buf);
    }
}

impl RLPDecode for RegConfirmationMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let registered = fields.decode_field("registered")?;
        let remaining = fields.finish()?;
        Ok((
            Self {
                request_id,
                registered,
            },
            remaining,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQueryMessage {
    pub request_id: u64,
    pub topic: H256,
}

impl RLPEncode for TopicQueryMessage {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut fields = Encoder::new();
        fields
            .encode_field(&self.request_id)
            .encode_field(&self.topic);
        fields.finish(buf);
    }
}

impl RLPDecode for TopicQueryMessage {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        let request_id = fields.decode_field("request_id")?;
        let topic = fields.decode_field("topic")?;
        let remaining = fields.finish()?;
        Ok((Self { request_id, topic }, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scheme::IdentitySchemeRegistry,
        types::{EnrBuilder, ID_ENR_KEY},
    };
    use secp256k1::{SECP256K1, SecretKey};
    use std::net::Ipv4Addr;

    fn sample_messages() -> Vec<Message> {
        let signer = SecretKey::from_slice(&[0x21; 32]).unwrap();
        let enr = EnrBuilder::new(1)
            .add(ID_ENR_KEY, "v4")
            .add(
                b"secp256k1",
                signer.public_key(SECP256K1).serialize().as_slice(),
            )
            .sign(
                &signer.secret_bytes(),
                &IdentitySchemeRegistry::with_default_schemes(),
            )
            .unwrap();

        vec![
            Message::Ping(PingMessage {
                request_id: 1,
                enr_seq: 7,
            }),
            Message::Pong(PongMessage {
                request_id: 2,
                enr_seq: 7,
                packet_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                packet_port: 30303,
            }),
            Message::FindNode(FindNodeMessage {
                request_id: 3,
                distance: 255,
            }),
            Message::Nodes(NodesMessage {
                request_id: 4,
                total: 1,
                enrs: vec![enr],
            }),
            Message::ReqTicket(ReqTicketMessage {
                request_id: 5,
                topic: H256::repeat_byte(0xab),
            }),
            Message::Ticket(TicketMessage {
                request_id: 6,
                ticket: Bytes::from_static(b"opaque"),
                wait_time: 30,
            }),
            Message::RegTopic(RegTopicMessage {
                request_id: 7,
                ticket: Bytes::from_static(b"opaque"),
            }),
            Message::RegConfirmation(RegConfirmationMessage {
                request_id: 8,
                registered: true,
            }),
            Message::TopicQuery(TopicQueryMessage {
                request_id: 9,
                topic: H256::repeat_byte(0xcd),
            }),
        ]
    }

    #[test]
    fn type_codes_are_contiguous_from_one() {
        let codes: Vec<u8> = sample_messages().iter().map(Message::code).collect();
        let expected: Vec<u8> = (1..=9).collect();
        assert_eq!(codes, expected);
    }

    #[test]
    fn wire_roundtrip() {
        for message in sample_messages() {
            let encoded = message.to_bytes();
            assert_eq!(encoded[0], message.code());
            let decoded = Message::decode(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn request_id_is_the_first_field() {
        for message in sample_messages() {
            let encoded = message.to_bytes();
            let mut fields = Decoder::new(&encoded[1..]).unwrap();
            let request_id: u64 = fields.decode_field("request_id").unwrap();
            assert_eq!(request_id, message.request_id());
        }
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            Message::decode(&[0x0a, 0xc2, 0x01, 0x02]),
            Err(MessageDecodeError::UnknownType(10))
        );
        assert_eq!(Message::decode(&[]), Err(MessageDecodeError::Empty));
    }

    #[test]
    fn pong_carries_ipv6_endpoints() {
        let pong = Message::Pong(PongMessage {
            request_id: 11,
            enr_seq: 0,
            packet_ip: "2001:db8::1".parse().unwrap(),
            packet_port: 4000,
        });
        assert_eq!(Message::decode(&pong.to_bytes()).unwrap(), pong);
    }

    #[test]
    fn trailing_fields_rejected() {
        // a Ping body with a third list element must not decode
        let mut buf = vec![Message::PING];
        let mut body = Encoder::new();
        body.encode_field(&1u64)
            .encode_field(&2u64)
            .encode_field(&3u64);
        body.finish(&mut buf);
        assert!(Message::decode(&buf).is_err());
    }
}
