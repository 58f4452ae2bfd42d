use bytes::{BufMut, Bytes};
use ethereum_types::{H256, H264, H512};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::constants::{RLP_EMPTY_LIST, RLP_NULL};

/// Trait for types with an RLP wire form.
pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the prefix of an item carrying `payload_len` bytes. `base` picks
/// the item kind: [`RLP_NULL`] for strings, [`RLP_EMPTY_LIST`] for lists.
///
/// Payloads up to 55 bytes put their length into the prefix byte itself;
/// longer ones follow the prefix with the length spelled in big-endian.
pub(crate) fn write_prefix(base: u8, payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len <= 55 {
        buf.put_u8(base + payload_len as u8);
        return;
    }
    let payload_len_be = payload_len.to_be_bytes();
    let digits = significant_be_digits(&payload_len_be);
    buf.put_u8(base + 55 + digits.len() as u8);
    buf.put_slice(digits);
}

/// Big-endian bytes with the leading zeros stripped; empty for zero.
fn significant_be_digits(bytes: &[u8]) -> &[u8] {
    let zeros = bytes.iter().take_while(|byte| **byte == 0).count();
    &bytes[zeros..]
}

/// Canonical integer encoding: no leading zeros, zero itself is the empty
/// string, and a lone byte under 0x80 stands for itself.
fn encode_integer(value_be: &[u8], buf: &mut dyn BufMut) {
    match significant_be_digits(value_be) {
        [] => buf.put_u8(RLP_NULL),
        [digit] if *digit <= 0x7f => buf.put_u8(*digit),
        digits => {
            write_prefix(RLP_NULL, digits.len(), buf);
            buf.put_slice(digits);
        }
    }
}

macro_rules! uint_rlp_encode {
    ($($int:ty),* $(,)?) => {$(
        impl RLPEncode for $int {
            fn encode(&self, buf: &mut dyn BufMut) {
                encode_integer(&self.to_be_bytes(), buf);
            }
        }
    )*};
}

uint_rlp_encode!(u8, u16, u32, u64, usize);

impl RLPEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(if *self { 0x01 } else { RLP_NULL });
    }
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            [byte] if *byte < RLP_NULL => buf.put_u8(*byte),
            payload => {
                write_prefix(RLP_NULL, payload.len(), buf);
                buf.put_slice(payload);
            }
        }
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_slice().encode(buf)
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for &str {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

macro_rules! hash_rlp_encode {
    ($($hash:ty),* $(,)?) => {$(
        impl RLPEncode for $hash {
            fn encode(&self, buf: &mut dyn BufMut) {
                self.as_bytes().encode(buf)
            }
        }
    )*};
}

hash_rlp_encode!(H256, H264, H512);

impl RLPEncode for Ipv4Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.octets().encode(buf)
    }
}

impl RLPEncode for Ipv6Addr {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.octets().encode(buf)
    }
}

impl RLPEncode for IpAddr {
    fn encode(&self, buf: &mut dyn BufMut) {
        match self {
            IpAddr::V4(ip) => ip.encode(buf),
            IpAddr::V6(ip) => ip.encode(buf),
        }
    }
}

// A `Vec<T>` encodes as a list of its elements. Note this makes `Vec<u8>` a
// list of one-byte items; byte strings must go through `Bytes`, `[u8]` or
// `Encoder::encode_bytes`.
impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut payload = Vec::new();
        for item in self {
            item.encode(&mut payload);
        }
        write_prefix(RLP_EMPTY_LIST, payload.len(), buf);
        buf.put_slice(&payload);
    }
}
