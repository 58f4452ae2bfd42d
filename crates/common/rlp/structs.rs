use super::{
    constants::RLP_EMPTY_LIST,
    decode::{RLPDecode, RlpItem, next_item, split_item},
    encode::{RLPEncode, write_prefix},
    error::RLPDecodeError,
};
use bytes::BufMut;

/// Assembles the payload of an RLP list; [`finish`](Encoder::finish) writes
/// the complete prefixed item into the target buffer.
///
/// Fields are appended in wire order. Besides [`RLPEncode`] values, the
/// assembler takes raw byte strings (`encode_bytes`) and pre-encoded items
/// spliced in verbatim (`encode_raw`) — node records store their values in
/// encoded form and re-emit them untouched.
///
/// # Examples
///
/// ```
/// # use kadmos_rlp::structs::Encoder;
/// let mut endpoint = Encoder::new();
/// endpoint.encode_field(&[127u8, 0, 0, 1]);
/// endpoint.encode_field(&30303u16);
///
/// let mut wire = Vec::new();
/// endpoint.finish(&mut wire);
/// assert_eq!(wire, [0xc8, 0x84, 127, 0, 0, 1, 0x82, 0x76, 0x5f]);
/// ```
#[must_use = "the assembled list is only written out by `finish`"]
#[derive(Debug, Default)]
pub struct Encoder {
    payload: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one field.
    pub fn encode_field<T: RLPEncode + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(&mut self.payload);
        self
    }

    /// Appends a byte-string field, sidestepping the list interpretation
    /// of `Vec<u8>`.
    pub fn encode_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        <[u8] as RLPEncode>::encode(bytes, &mut self.payload);
        self
    }

    /// Splices in bytes that already carry their own RLP prefix.
    pub fn encode_raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(encoded);
        self
    }

    /// Writes the finished list into `buf`.
    pub fn finish(self, buf: &mut dyn BufMut) {
        write_prefix(RLP_EMPTY_LIST, self.payload.len(), buf);
        buf.put_slice(&self.payload);
    }
}

/// Walks the fields of an RLP list in order.
///
/// [`decode_field`](Decoder::decode_field) reads mandatory fields,
/// [`try_decode_field`](Decoder::try_decode_field) probes for trailing
/// optional ones, and [`next_raw_item`](Decoder::next_raw_item) hands a
/// field out undecoded — the shape the key/value tail of a node record
/// needs. [`finish`](Decoder::finish) asserts nothing was left unread.
///
/// # Examples
///
/// ```
/// # use kadmos_rlp::structs::Decoder;
/// let wire = [0xc8, 0x84, 127, 0, 0, 1, 0x82, 0x76, 0x5f];
/// let mut fields = Decoder::new(&wire).unwrap();
/// let ip: [u8; 4] = fields.decode_field("ip").unwrap();
/// let port: u16 = fields.decode_field("port").unwrap();
/// assert!(fields.finish().unwrap().is_empty());
/// assert_eq!((ip, port), ([127, 0, 0, 1], 30303));
/// ```
#[derive(Debug)]
pub struct Decoder<'a> {
    /// Unread part of the list payload.
    body: &'a [u8],
    /// Bytes following the whole list item.
    after: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, RLPDecodeError> {
        match next_item(buf)? {
            (RlpItem::List(body), after) => Ok(Self { body, after }),
            (RlpItem::Str(_), _) => Err(RLPDecodeError::UnexpectedString),
        }
    }

    /// Decodes the next field; `name` labels decode errors.
    pub fn decode_field<T: RLPDecode>(&mut self, name: &str) -> Result<T, RLPDecodeError> {
        let (value, tail) = T::decode_unfinished(self.body)
            .map_err(|err| RLPDecodeError::Custom(format!("field '{name}': {err}")))?;
        self.body = tail;
        Ok(value)
    }

    /// Decodes the next field if one is left and it parses as `T`; the
    /// walk does not advance otherwise.
    pub fn try_decode_field<T: RLPDecode>(&mut self) -> Option<T> {
        let (value, tail) = T::decode_unfinished(self.body).ok()?;
        self.body = tail;
        Some(value)
    }

    /// Hands out the next field raw, prefix included.
    pub fn next_raw_item(&mut self) -> Result<&'a [u8], RLPDecodeError> {
        let (item, tail) = split_item(self.body)?;
        self.body = tail;
        Ok(item)
    }

    /// Bytes of the list payload not consumed yet.
    pub fn payload_len(&self) -> usize {
        self.body.len()
    }

    /// Checks the payload was fully consumed and returns the bytes after
    /// the list.
    pub fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if self.body.is_empty() {
            Ok(self.after)
        } else {
            Err(RLPDecodeError::MalformedData)
        }
    }
}
