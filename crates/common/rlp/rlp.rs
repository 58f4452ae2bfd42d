//! # kadmos-rlp
//!
//! Recursive Length Prefix (RLP) encoding and decoding for the kadmos
//! discovery stack.
//!
//! RLP is the serialization format used on the discovery wire: node records,
//! packet authentication sections and protocol messages are all RLP items.
//!
//! ## Core Traits
//!
//! - [`encode::RLPEncode`]: Trait for types that can be RLP-encoded
//! - [`decode::RLPDecode`]: Trait for types that can be RLP-decoded
//!
//! For structured types, [`structs::Encoder`] assembles a list field by
//! field and [`structs::Decoder`] walks one back:
//!
//! ```rust
//! use kadmos_rlp::{
//!     decode::RLPDecode,
//!     encode::RLPEncode,
//!     error::RLPDecodeError,
//!     structs::{Decoder, Encoder},
//! };
//! use bytes::BufMut;
//!
//! struct Probe {
//!     seq: u64,
//!     port: u16,
//! }
//!
//! impl RLPEncode for Probe {
//!     fn encode(&self, buf: &mut dyn BufMut) {
//!         let mut fields = Encoder::new();
//!         fields.encode_field(&self.seq).encode_field(&self.port);
//!         fields.finish(buf);
//!     }
//! }
//!
//! impl RLPDecode for Probe {
//!     fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
//!         let mut fields = Decoder::new(rlp)?;
//!         let seq = fields.decode_field("seq")?;
//!         let port = fields.decode_field("port")?;
//!         let remaining = fields.finish()?;
//!         Ok((Self { seq, port }, remaining))
//!     }
//! }
//! ```
//!
//! Decoding is strict: trailing bytes, non-canonical integer encodings and
//! oversized payloads are rejected.

pub mod constants;
pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;
