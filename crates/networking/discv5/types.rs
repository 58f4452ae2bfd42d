//! Node records (ENR), endpoints, and the items flowing through the service
//! channels.

use crate::{
    base64,
    messages::Message,
    packet::Packet,
    scheme::{IdentitySchemeRegistry, SchemeError},
};
use bytes::{BufMut, Bytes};
use ethereum_types::H256;
use kadmos_rlp::{
    decode::RLPDecode,
    encode::RLPEncode,
    error::RLPDecodeError,
    structs::{Decoder, Encoder},
};
use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::OnceLock,
};
use thiserror::Error;

/// Maximum serialized size of a node record.
pub const MAX_ENR_ENCODED_SIZE: usize = 300;

const ENR_REPR_PREFIX: &str = "enr:";

pub const ID_ENR_KEY: &[u8] = b"id";
pub const IP_ENR_KEY: &[u8] = b"ip";
pub const IP6_ENR_KEY: &[u8] = b"ip6";
pub const TCP_PORT_ENR_KEY: &[u8] = b"tcp";
pub const TCP6_PORT_ENR_KEY: &[u8] = b"tcp6";
pub const UDP_PORT_ENR_KEY: &[u8] = b"udp";
pub const UDP6_PORT_ENR_KEY: &[u8] = b"udp6";

#[derive(Debug, Error)]
pub enum EnrError {
    #[error("record is missing required key {0}")]
    MissingKey(&'static str),
    #[error("record keys are not unique and sorted")]
    InvalidKeyOrder,
    #[error("record exceeds {MAX_ENR_ENCODED_SIZE} bytes")]
    TooLarge,
    #[error("record names unknown identity scheme {0}")]
    UnknownScheme(String),
    #[error("record signature is invalid")]
    InvalidSignature,
    #[error("invalid record representation: {0}")]
    InvalidRepr(String),
    #[error(transparent)]
    Rlp(#[from] RLPDecodeError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
}

/// A UDP endpoint of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.to_canonical(), self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A signed node record.
///
/// The key/value pairs are kept in wire form (keys sorted, values as raw RLP
/// items) so that re-encoding a decoded record reproduces it byte for byte,
/// unknown keys included. Typed accessors decode the known keys on demand.
///
/// Reference: [ENR records](https://github.com/ethereum/devp2p/blob/master/enr.md)
#[derive(Debug, Clone)]
pub struct Enr {
    signature: Bytes,
    seq: u64,
    pairs: Vec<(Bytes, Bytes)>,
    node_id: OnceLock<H256>,
}

impl PartialEq for Enr {
    fn eq(&self, other: &Self) -> bool {
        // the node id cache does not take part in record identity
        self.signature == other.signature && self.seq == other.seq && self.pairs == other.pairs
    }
}

impl Eq for Enr {}

impl Enr {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn pairs(&self) -> &[(Bytes, Bytes)] {
        &self.pairs
    }

    /// Raw RLP value stored under the given key.
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.pairs
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v)
    }

    /// Decoded value stored under the given key, or None if the key is
    /// absent or its value does not decode as `T`.
    pub fn get_value<T: RLPDecode>(&self, key: &[u8]) -> Option<T> {
        T::decode(self.get(key)?).ok()
    }

    pub fn id(&self) -> Option<Bytes> {
        self.get_value(ID_ENR_KEY)
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.get_value(IP_ENR_KEY)
    }

    pub fn ip6(&self) -> Option<Ipv6Addr> {
        self.get_value(IP6_ENR_KEY)
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.get_value(UDP_PORT_ENR_KEY)
    }

    pub fn udp6_port(&self) -> Option<u16> {
        self.get_value(UDP6_PORT_ENR_KEY)
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.get_value(TCP_PORT_ENR_KEY)
    }

    /// The advertised UDP endpoint, preferring IPv4.
    pub fn udp_endpoint(&self) -> Option<Endpoint> {
        if let (Some(ip), Some(port)) = (self.ip(), self.udp_port()) {
            return Some(Endpoint::new(IpAddr::V4(ip), port));
        }
        if let (Some(ip), Some(port)) = (self.ip6(), self.udp6_port()) {
            return Some(Endpoint::new(IpAddr::V6(ip), port));
        }
        None
    }

    /// The node id under the record's identity scheme, cached after the
    /// first computation.
    pub fn node_id(&self, registry: &IdentitySchemeRegistry) -> Result<H256, EnrError> {
        if let Some(node_id) = self.node_id.get() {
            return Ok(*node_id);
        }
        let scheme = self.scheme(registry)?;
        let public_key = self
            .get(scheme.public_key_enr_key())
            .ok_or(EnrError::MissingKey("public key"))?;
        let public_key = Bytes::decode(public_key)?;
        let node_id = scheme.extract_node_id(&public_key)?;
        let _ = self.node_id.set(node_id);
        Ok(node_id)
    }

    /// The RLP content covered by the signature: `[seq, k1, v1, k2, v2, ...]`.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut content = Vec::new();
        let mut list = Encoder::new();
        list.encode_field(&self.seq);
        self.append_pairs(&mut list);
        list.finish(&mut content);
        content
    }

    /// Appends the key/value section: plain keys, values spliced in as the
    /// raw RLP they were stored as.
    fn append_pairs(&self, list: &mut Encoder) {
        for (key, value) in &self.pairs {
            list.encode_field(key);
            list.encode_raw(value);
        }
    }

    /// Checks the signature under the public key declared by the record's
    /// identity scheme.
    pub fn verify_signature(&self, registry: &IdentitySchemeRegistry) -> Result<(), EnrError> {
        let scheme = self.scheme(registry)?;
        let public_key = self
            .get(scheme.public_key_enr_key())
            .ok_or(EnrError::MissingKey("public key"))?;
        let public_key = Bytes::decode(public_key)?;
        scheme
            .validate_enr_signature(&self.signing_message(), &self.signature, &public_key)
            .map_err(|_| EnrError::InvalidSignature)
    }

    /// A copy of this record with the endpoint keys replaced, the sequence
    /// number bumped and a fresh signature.
    pub fn with_updated_endpoint(
        &self,
        endpoint: Endpoint,
        private_key: &[u8],
        registry: &IdentitySchemeRegistry,
    ) -> Result<Enr, EnrError> {
        let replaced: &[&[u8]] = match endpoint.ip {
            IpAddr::V4(_) => &[IP_ENR_KEY, UDP_PORT_ENR_KEY],
            IpAddr::V6(_) => &[IP6_ENR_KEY, UDP6_PORT_ENR_KEY],
        };

        let mut builder = EnrBuilder::new(self.seq + 1);
        for (key, value) in &self.pairs {
            if !replaced.contains(&key.as_ref()) {
                builder = builder.add_raw(key, value.to_vec());
            }
        }
        match endpoint.ip {
            IpAddr::V4(ip) => {
                builder = builder
                    .add(IP_ENR_KEY, &ip)
                    .add(UDP_PORT_ENR_KEY, &endpoint.port)
            }
            IpAddr::V6(ip) => {
                builder = builder
                    .add(IP6_ENR_KEY, &ip)
                    .add(UDP6_PORT_ENR_KEY, &endpoint.port)
            }
        }
        builder.sign(private_key, registry)
    }

    fn scheme(
        &self,
        registry: &IdentitySchemeRegistry,
    ) -> Result<std::sync::Arc<dyn crate::scheme::IdentityScheme>, EnrError> {
        let id = self.id().ok_or(EnrError::MissingKey("id"))?;
        registry
            .get(&id)
            .ok_or_else(|| EnrError::UnknownScheme(String::from_utf8_lossy(&id).into_owned()))
    }

    /// Textual form: `enr:` followed by the unpadded base64url encoding of
    /// the RLP record.
    pub fn to_repr(&self) -> String {
        let mut repr: String = ENR_REPR_PREFIX.into();
        repr.push_str(&base64::encode(&self.encode_to_vec()));
        repr
    }

    pub fn from_repr(repr: &str) -> Result<Enr, EnrError> {
        let encoded = repr
            .strip_prefix(ENR_REPR_PREFIX)
            .ok_or_else(|| EnrError::InvalidRepr("missing enr: prefix".into()))?;
        let rlp = base64::decode(encoded.as_bytes())
            .ok_or_else(|| EnrError::InvalidRepr("invalid base64url payload".into()))?;
        Ok(Enr::decode(&rlp)?)
    }
}

impl Display for Enr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_repr())
    }
}

impl FromStr for Enr {
    type Err = EnrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Enr::from_repr(s)
    }
}

impl RLPEncode for Enr {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut list = Encoder::new();
        list.encode_field(&self.signature);
        list.encode_field(&self.seq);
        self.append_pairs(&mut list);
        list.finish(buf);
    }
}

impl RLPDecode for Enr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let mut fields = Decoder::new(rlp)?;
        if fields.payload_len() > MAX_ENR_ENCODED_SIZE {
            return Err(RLPDecodeError::InvalidLength);
        }
        let signature: Bytes = fields.decode_field("signature")?;
        let seq: u64 = fields.decode_field("seq")?;

        // the key/value tail: keys strictly ascending (which also makes
        // them unique), values kept raw so they re-encode verbatim
        let mut pairs: Vec<(Bytes, Bytes)> = Vec::new();
        while let Some(key) = fields.try_decode_field::<Bytes>() {
            if let Some((previous, _)) = pairs.last()
                && previous >= &key
            {
                return Err(RLPDecodeError::Custom(
                    "invalid node record, keys out of order".into(),
                ));
            }
            let value = fields.next_raw_item()?;
            pairs.push((key, Bytes::copy_from_slice(value)));
        }

        // the id entry names the identity scheme and must always be present
        if !pairs.iter().any(|(key, _)| key.as_ref() == ID_ENR_KEY) {
            return Err(RLPDecodeError::Custom(
                "invalid node record, 'id' entry missing".into(),
            ));
        }

        let record = Enr {
            signature,
            seq,
            pairs,
            node_id: OnceLock::new(),
        };
        let remaining = fields.finish()?;
        Ok((record, remaining))
    }
}

/// Builds and signs node records.
#[derive(Debug, Default)]
pub struct EnrBuilder {
    seq: u64,
    pairs: Vec<(Bytes, Bytes)>,
}

impl EnrBuilder {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            pairs: Vec::new(),
        }
    }

    /// Adds an entry whose value is already RLP-encoded.
    pub fn add_raw(mut self, key: &[u8], encoded_value: Vec<u8>) -> Self {
        self.pairs
            .push((Bytes::copy_from_slice(key), Bytes::from(encoded_value)));
        self
    }

    /// Adds an entry, RLP-encoding the value.
    pub fn add<T: RLPEncode + ?Sized>(self, key: &[u8], value: &T) -> Self {
        let encoded = value.encode_to_vec();
        self.add_raw(key, encoded)
    }

    /// Sorts the entries, signs the content under the scheme named by the
    /// `id` entry and returns the finished record.
    pub fn sign(
        mut self,
        private_key: &[u8],
        registry: &IdentitySchemeRegistry,
    ) -> Result<Enr, EnrError> {
        self.pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
        if self.pairs.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(EnrError::InvalidKeyOrder);
        }

        let unsigned = Enr {
            signature: Bytes::new(),
            seq: self.seq,
            pairs: self.pairs,
            node_id: OnceLock::new(),
        };
        let scheme = unsigned.scheme(registry)?;
        let signature = scheme.create_enr_signature(
            &unsigned.signing_message(),
            private_key,
        )?;

        let record = Enr {
            signature,
            ..unsigned
        };
        if record.encode_to_vec().len() > MAX_ENR_ENCODED_SIZE {
            return Err(EnrError::TooLarge);
        }
        Ok(record)
    }
}

//
// Channel items
//

/// A decoded packet received from the wire.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub packet: Packet,
    pub sender: Endpoint,
}

/// A packet on its way to the wire.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub packet: Packet,
    pub receiver: Endpoint,
}

/// A decrypted message attributed to its sender.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: Message,
    pub sender: Endpoint,
    pub sender_node_id: H256,
}

impl IncomingMessage {
    /// An outgoing message addressed back at this message's sender.
    pub fn to_response(&self, message: Message) -> OutgoingMessage {
        OutgoingMessage {
            message,
            receiver: self.sender,
            receiver_node_id: self.sender_node_id,
        }
    }
}

/// A message to deliver to a peer, to be framed by its packer.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: Message,
    pub receiver: Endpoint,
    pub receiver_node_id: H256,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::V4_SCHEME_ID;
    use secp256k1::{SECP256K1, SecretKey};

    fn registry() -> IdentitySchemeRegistry {
        IdentitySchemeRegistry::with_default_schemes()
    }

    fn test_record(seq: u64) -> (Enr, SecretKey) {
        let signer = SecretKey::from_slice(&[0x33; 32]).unwrap();
        let public_key = signer.public_key(SECP256K1).serialize();
        let record = EnrBuilder::new(seq)
            .add(ID_ENR_KEY, "v4")
            .add(b"secp256k1", public_key.as_slice())
            .add(IP_ENR_KEY, &Ipv4Addr::new(127, 0, 0, 1))
            .add(UDP_PORT_ENR_KEY, &30303u16)
            .sign(&signer.secret_bytes(), &registry())
            .unwrap();
        (record, signer)
    }

    #[test]
    fn signed_record_verifies() {
        let (record, _) = test_record(1);
        record.verify_signature(&registry()).unwrap();
        assert_eq!(record.id().unwrap().as_ref(), V4_SCHEME_ID);
        assert_eq!(record.udp_port(), Some(30303));
        assert_eq!(record.ip(), Some(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn tampered_record_fails_verification() {
        let (record, _) = test_record(1);
        let mut encoded = record.encode_to_vec();
        // flip a bit inside the udp port value at the end of the record
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        let tampered = Enr::decode(&encoded).unwrap();
        assert!(tampered.verify_signature(&registry()).is_err());
    }

    #[test]
    fn rlp_roundtrip_preserves_unknown_keys() {
        let signer = SecretKey::from_slice(&[0x44; 32]).unwrap();
        let public_key = signer.public_key(SECP256K1).serialize();
        let record = EnrBuilder::new(7)
            .add(ID_ENR_KEY, "v4")
            .add(b"secp256k1", public_key.as_slice())
            .add(b"zzz-custom", &0xdeadbeefu32)
            .sign(&signer.secret_bytes(), &registry())
            .unwrap();

        let decoded = Enr::decode(&record.encode_to_vec()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.get_value::<u32>(b"zzz-custom"), Some(0xdeadbeef));
        assert_eq!(decoded.encode_to_vec(), record.encode_to_vec());
    }

    #[test]
    fn repr_roundtrip() {
        let (record, _) = test_record(3);
        let repr = record.to_repr();
        assert!(repr.starts_with("enr:"));
        assert!(!repr.contains('='));
        let parsed = Enr::from_repr(&repr).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn known_test_vector_parses_and_verifies() {
        // https://github.com/ethereum/devp2p/blob/master/enr.md#test-vectors
        let repr = "enr:-IS4QHCYrYZbAKWCBRlAy5zzaDZXJBGkcnh4MHcBFZntXNFrdvJjX04jRzjzCBOonrkTfj499SZuOh8R33Ls8RRcy5wBgmlkgnY0gmlwhH8AAAGJc2VjcDI1NmsxoQPKY0yuDUmstAHYpMa2_oxVtw0RW_QAdpzBQA8yWM0xOIN1ZHCCdl8";
        let record = Enr::from_repr(repr).unwrap();
        assert_eq!(record.seq(), 1);
        assert_eq!(record.ip(), Some(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(record.udp_port(), Some(30303));
        record.verify_signature(&registry()).unwrap();
        assert_eq!(record.to_repr(), repr);
    }

    #[test]
    fn node_id_of_test_vector() {
        let repr = "enr:-IS4QHCYrYZbAKWCBRlAy5zzaDZXJBGkcnh4MHcBFZntXNFrdvJjX04jRzjzCBOonrkTfj499SZuOh8R33Ls8RRcy5wBgmlkgnY0gmlwhH8AAAGJc2VjcDI1NmsxoQPKY0yuDUmstAHYpMa2_oxVtw0RW_QAdpzBQA8yWM0xOIN1ZHCCdl8";
        let record = Enr::from_repr(repr).unwrap();
        let node_id = record.node_id(&registry()).unwrap();
        assert_eq!(
            format!("{node_id:x}"),
            "a448f24c6d18e575453db13171562b71999873db5b286df957af199ec94617f7"
        );
    }

    #[test]
    fn out_of_order_keys_rejected() {
        let (record, _) = test_record(1);
        // re-encode with the pair section reversed
        let mut reversed: Vec<(Bytes, Bytes)> = record.pairs().to_vec();
        reversed.reverse();
        let mut list = Encoder::new();
        list.encode_field(record.signature());
        list.encode_field(&record.seq());
        for (key, value) in &reversed {
            list.encode_field(key);
            list.encode_raw(value);
        }
        let mut content = Vec::new();
        list.finish(&mut content);
        assert!(Enr::decode(&content).is_err());
    }

    #[test]
    fn oversize_record_rejected() {
        let signer = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let public_key = signer.public_key(SECP256K1).serialize();
        let result = EnrBuilder::new(1)
            .add(ID_ENR_KEY, "v4")
            .add(b"secp256k1", public_key.as_slice())
            .add(b"padding", [0xaau8; 300].as_slice())
            .sign(&signer.secret_bytes(), &registry());
        assert!(matches!(result, Err(EnrError::TooLarge)));
    }

    #[test]
    fn missing_id_entry_rejected() {
        let mut list = Encoder::new();
        list.encode_field(&Bytes::from_static(&[0u8; 64]))
            .encode_field(&1u64);
        let mut content = Vec::new();
        list.finish(&mut content);
        assert!(Enr::decode(&content).is_err());
    }

    #[test]
    fn endpoint_update_bumps_seq_and_resigns() {
        let (record, signer) = test_record(5);
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 40404);
        let updated = record
            .with_updated_endpoint(endpoint, &signer.secret_bytes(), &registry())
            .unwrap();
        assert_eq!(updated.seq(), 6);
        assert_eq!(updated.udp_endpoint(), Some(endpoint));
        updated.verify_signature(&registry()).unwrap();
        // identity keys survive the update
        assert_eq!(updated.id(), record.id());
        assert_eq!(updated.get(b"secp256k1"), record.get(b"secp256k1"));
    }
}
