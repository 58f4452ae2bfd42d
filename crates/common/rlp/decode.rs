use super::{
    constants::{RLP_EMPTY_LIST, RLP_NULL},
    error::RLPDecodeError,
};
use bytes::Bytes;
use ethereum_types::{H256, H264, H512};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Max payload size accepted when decoding.
/// Discovery datagrams are at most 1280 bytes; anything claiming a larger
/// payload is either corrupt or malicious.
const MAX_RLP_BYTES: usize = 1024 * 1024;

/// Trait for decoding RLP encoded slices of data.
/// Implementors provide [`decode_unfinished`](RLPDecode::decode_unfinished),
/// which returns the decoded value along with the remaining bytes; consumers
/// normally use [`decode`](RLPDecode::decode), which additionally rejects
/// trailing data.
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }

        Ok(decoded)
    }
}

/// One parsed item: its payload, discriminated into string or list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlpItem<'a> {
    Str(&'a [u8]),
    List(&'a [u8]),
}

/// Parses the leading item of `data`, returning it together with whatever
/// follows it.
///
/// The prefix byte encodes kind and size at once: bytes below 0x80 stand
/// for themselves, 0x80..=0xbf open a string, 0xc0..=0xff open a list. In
/// either range the first 56 values carry the payload length directly and
/// the rest state how many big-endian bytes spell it out.
pub fn next_item(data: &[u8]) -> Result<(RlpItem<'_>, &[u8]), RLPDecodeError> {
    let &prefix = data.first().ok_or(RLPDecodeError::InvalidLength)?;

    if prefix < RLP_NULL {
        return Ok((RlpItem::Str(&data[..1]), &data[1..]));
    }

    let is_list = prefix >= RLP_EMPTY_LIST;
    let size_code = (prefix - if is_list { RLP_EMPTY_LIST } else { RLP_NULL }) as usize;

    let (header_len, payload_len) = if size_code <= 55 {
        (1, size_code)
    } else {
        let length_digits = data
            .get(1..1 + size_code - 55)
            .ok_or(RLPDecodeError::InvalidLength)?;
        let payload_len = usize::from_be_bytes(left_padded(length_digits)?);
        (1 + length_digits.len(), payload_len)
    };

    if payload_len > MAX_RLP_BYTES {
        return Err(RLPDecodeError::InvalidLength);
    }
    let payload = data
        .get(header_len..header_len + payload_len)
        .ok_or(RLPDecodeError::InvalidLength)?;
    let rest = &data[header_len + payload_len..];

    if is_list {
        Ok((RlpItem::List(payload), rest))
    } else {
        Ok((RlpItem::Str(payload), rest))
    }
}

/// Splits off the leading item, prefix included.
pub fn split_item(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, rest) = next_item(data)?;
    let item_len = data.len() - rest.len();
    Ok((&data[..item_len], rest))
}

/// Payload of a leading string item; lists are refused.
pub fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    match next_item(data)? {
        (RlpItem::Str(payload), rest) => Ok((payload, rest)),
        (RlpItem::List(_), _) => Err(RLPDecodeError::UnexpectedList),
    }
}

/// Left-pads canonical big-endian digits into an `N`-byte array. A leading
/// zero digit means the encoding was not minimal and is refused.
fn left_padded<const N: usize>(digits: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    if digits.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    if digits.first() == Some(&0) {
        return Err(RLPDecodeError::MalformedData);
    }
    let mut padded = [0u8; N];
    padded[N - digits.len()..].copy_from_slice(digits);
    Ok(padded)
}

macro_rules! uint_rlp_decode {
    ($($int:ty),* $(,)?) => {$(
        impl RLPDecode for $int {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (digits, rest) = decode_bytes(rlp)?;
                Ok((<$int>::from_be_bytes(left_padded(digits)?), rest))
            }
        }
    )*};
}

uint_rlp_decode!(u8, u16, u32, u64, usize);

impl RLPDecode for bool {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (&prefix, rest) = rlp.split_first().ok_or(RLPDecodeError::InvalidLength)?;
        let value = match prefix {
            RLP_NULL => false,
            0x01 => true,
            other => return Err(RLPDecodeError::MalformedBoolean(other)),
        };
        Ok((value, rest))
    }
}

// Decodes a byte string of a fixed size. Lists of same-typed elements go
// through the Vec<T> implementation instead.
impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        let value = payload
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;
        Ok((value, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(payload), rest))
    }
}

impl RLPDecode for String {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        let value =
            String::from_utf8(payload.to_vec()).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

macro_rules! hash_rlp_decode {
    ($($hash:ty),* $(,)?) => {$(
        impl RLPDecode for $hash {
            fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
                let (bytes, rest) = RLPDecode::decode_unfinished(rlp)?;
                Ok((Self(bytes), rest))
            }
        }
    )*};
}

hash_rlp_decode!(H256, H264, H512);

impl RLPDecode for Ipv4Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (octets, rest): ([u8; 4], _) = RLPDecode::decode_unfinished(rlp)?;
        Ok((Ipv4Addr::from(octets), rest))
    }
}

impl RLPDecode for Ipv6Addr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (octets, rest): ([u8; 16], _) = RLPDecode::decode_unfinished(rlp)?;
        Ok((Ipv6Addr::from(octets), rest))
    }
}

impl RLPDecode for IpAddr {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (payload, rest) = decode_bytes(rlp)?;
        match payload.len() {
            4 => {
                let octets: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                Ok((IpAddr::V4(Ipv4Addr::from(octets)), rest))
            }
            16 => {
                let octets: [u8; 16] = payload
                    .try_into()
                    .map_err(|_| RLPDecodeError::InvalidLength)?;
                // to_canonical in case it's an Ipv6-mapped Ipv4 address
                Ok((IpAddr::V6(Ipv6Addr::from(octets)).to_canonical(), rest))
            }
            _ => Err(RLPDecodeError::InvalidLength),
        }
    }
}

// A Vec<T> is interpreted as a list of elements of the same type. Byte
// strings must be decoded via [u8; N], Bytes or similar.
impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (item, rest) = next_item(rlp)?;
        let RlpItem::List(mut body) = item else {
            return Err(RLPDecodeError::UnexpectedString);
        };

        let mut items = Vec::new();
        while !body.is_empty() {
            let (element, tail) = T::decode_unfinished(body)?;
            items.push(element);
            body = tail;
        }
        Ok((items, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::RLPEncode;

    #[test]
    fn roundtrip_integers() {
        for value in [0u64, 1, 0x7f, 0x80, 0xffff, u64::MAX] {
            let encoded = value.encode_to_vec();
            assert_eq!(u64::decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn leading_zeros_rejected() {
        // 0x0001 must encode as 0x01; the padded form is non-canonical
        assert_eq!(
            u16::decode(&[0x82, 0x00, 0x01]),
            Err(RLPDecodeError::MalformedData)
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        assert_eq!(
            u64::decode(&[0x01, 0x02]),
            Err(RLPDecodeError::InvalidLength)
        );
    }

    #[test]
    fn roundtrip_ip_addresses() {
        let v4: IpAddr = "10.0.0.7".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        for ip in [v4, v6] {
            assert_eq!(IpAddr::decode(&ip.encode_to_vec()).unwrap(), ip);
        }
    }

    #[test]
    fn item_kinds_and_payloads() {
        // lone low byte, string, empty list, list
        assert_eq!(
            next_item(&[0x05]).unwrap(),
            (RlpItem::Str(&[0x05][..]), &[][..])
        );
        let (item, rest) = next_item(&[0x82, 0x76, 0x5f, 0xee]).unwrap();
        assert_eq!(item, RlpItem::Str(&[0x76, 0x5f][..]));
        assert_eq!(rest, &[0xee]);
        assert_eq!(
            next_item(&[0xc0]).unwrap(),
            (RlpItem::List(&[][..]), &[][..])
        );
        let (item, _) = next_item(&[0xc2, 0x01, 0x02]).unwrap();
        assert!(matches!(item, RlpItem::List(payload) if payload == [0x01, 0x02]));
    }

    #[test]
    fn truncated_items_rejected() {
        assert!(next_item(&[]).is_err());
        assert!(next_item(&[0x83, b'd', b'o']).is_err());
        assert!(next_item(&[0xb8]).is_err());
        assert!(next_item(&[0xb8, 60, 0x00]).is_err());
    }

    #[test]
    fn split_keeps_the_prefix() {
        let mut buf = 0x0102u16.encode_to_vec();
        buf.extend_from_slice(&[0xde, 0xad]);
        let (item, rest) = split_item(&buf).unwrap();
        assert_eq!(item, &[0x82, 0x01, 0x02]);
        assert_eq!(rest, &[0xde, 0xad]);
    }

    #[test]
    fn roundtrip_nested_list() {
        let list: Vec<Vec<u64>> = vec![vec![1, 2], vec![], vec![3]];
        let encoded = list.encode_to_vec();
        assert_eq!(Vec::<Vec<u64>>::decode(&encoded).unwrap(), list);
    }

    #[test]
    fn reference_vectors() {
        use hex_literal::hex;

        // https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp
        assert_eq!(
            Vec::<String>::decode(&hex!("c88363617483646f67")).unwrap(),
            vec!["cat".to_string(), "dog".to_string()]
        );
        assert_eq!(
            String::decode(&hex!("8b68656c6c6f20776f726c64")).unwrap(),
            "hello world"
        );
        assert_eq!(u64::decode(&hex!("820400")).unwrap(), 1024);
    }
}
