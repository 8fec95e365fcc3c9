use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a single bencode value from a byte slice.
///
/// The input must contain exactly one complete value with no trailing data.
///
/// # Errors
///
/// Returns an error if the input is empty or truncated, contains invalid
/// bencode syntax, nests deeper than 64 levels, or carries trailing bytes.
///
/// # Examples
///
/// ```
/// use keel::bencode::decode;
///
/// let v = decode(b"d1:ad2:id2:abe1:q4:ping1:t2:aa1:y1:qe").unwrap();
/// assert_eq!(v.get(b"q").and_then(|q| q.as_str()), Some("ping"));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor::new(data);
    let value = cursor.parse_value(MAX_DEPTH)?;
    if !cursor.at_end() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Byte reader over the input. All parsing goes through it, so every
/// bounds check lives in `take`/`read_until`.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consumes the next byte if it equals `byte`.
    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consumes exactly `n` bytes.
    fn take(&mut self, n: usize) -> Result<&'a [u8], BencodeError> {
        if self.data.len() - self.pos < n {
            return Err(BencodeError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consumes up to (and including) `terminator`, returning the bytes
    /// before it.
    fn read_until(&mut self, terminator: u8) -> Result<&'a [u8], BencodeError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn parse_value(&mut self, depth_left: usize) -> Result<Value, BencodeError> {
        if depth_left == 0 {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek() {
            None => Err(BencodeError::UnexpectedEof),
            Some(b'i') => {
                self.pos += 1;
                self.parse_integer()
            }
            Some(b'l') => {
                self.pos += 1;
                let mut list = Vec::new();
                while !self.eat(b'e') {
                    list.push(self.parse_value(depth_left - 1)?);
                }
                Ok(Value::List(list))
            }
            Some(b'd') => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while !self.eat(b'e') {
                    if !matches!(self.peek(), Some(b'0'..=b'9')) {
                        return Err(if self.at_end() {
                            BencodeError::UnexpectedEof
                        } else {
                            BencodeError::NonStringKey
                        });
                    }
                    let key = self.parse_bytes()?;
                    dict.insert(key, self.parse_value(depth_left - 1)?);
                }
                Ok(Value::Dict(dict))
            }
            Some(b'0'..=b'9') => self.parse_bytes().map(Value::Bytes),
            Some(c) => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    /// Body of an integer, after the leading `i`.
    fn parse_integer(&mut self) -> Result<Value, BencodeError> {
        let digits = self.read_until(b'e')?;

        // "i-0e", "i03e" and friends are not valid bencode
        match digits {
            [] => return Err(BencodeError::InvalidInteger("empty".into())),
            [b'0'] => return Ok(Value::Integer(0)),
            [b'0', ..] | [b'-', b'0', ..] => {
                return Err(BencodeError::InvalidInteger("leading zeros".into()));
            }
            _ => {}
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Value::Integer)
            .ok_or_else(|| {
                BencodeError::InvalidInteger(String::from_utf8_lossy(digits).into_owned())
            })
    }

    /// A length-prefixed byte string: `<len>:<bytes>`.
    fn parse_bytes(&mut self) -> Result<Bytes, BencodeError> {
        let prefix = self.read_until(b':')?;
        let len: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}
