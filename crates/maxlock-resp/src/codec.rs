//! RESP2 encoding for commands and incremental parsing for replies.

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{RespError, Result};

const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;
const MAX_ELEMENTS: usize = 1024 * 1024;
const MAX_NESTING_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(String),
    Error { kind: String, message: String },
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::SimpleString(_) => "simple string",
            Self::Error { .. } => "error",
            Self::Integer(_) => "integer",
            Self::BulkString(_) => "bulk string",
            Self::Array(_) => "array",
            Self::Null => "null",
        }
    }
}

/// Encodes a command as an array of bulk strings.
pub fn encode_command<I, T>(parts: I, buf: &mut BytesMut)
where
    I: IntoIterator<Item = T>,
    I::IntoIter: ExactSizeIterator,
    T: AsRef<[u8]>,
{
    let parts = parts.into_iter();
    buf.put_u8(b'*');
    buf.put_slice(parts.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for part in parts {
        let part = part.as_ref();
        buf.put_u8(b'$');
        buf.put_slice(part.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(part);
        buf.put_slice(b"\r\n");
    }
}

/// Parses one reply from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes it occupied.
pub fn parse_reply(data: &[u8]) -> Result<Option<(RespValue, usize)>> {
    parse_value(data, 0)
}

fn parse_value(data: &[u8], depth: usize) -> Result<Option<(RespValue, usize)>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(RespError::Protocol("maximum nesting depth exceeded".to_string()));
    }
    let Some((&type_byte, rest)) = data.split_first() else {
        return Ok(None);
    };
    let Some(line_end) = find_crlf(rest) else {
        return Ok(None);
    };
    let line = &rest[..line_end];
    let header_len = 1 + line_end + 2;

    match type_byte {
        b'+' => Ok(Some((
            RespValue::SimpleString(String::from_utf8_lossy(line).into_owned()),
            header_len,
        ))),
        b'-' => {
            let text = String::from_utf8_lossy(line);
            let (kind, message) = match text.split_once(' ') {
                Some((kind, message)) => (kind.to_string(), message.to_string()),
                None => (text.to_string(), String::new()),
            };
            Ok(Some((RespValue::Error { kind, message }, header_len)))
        }
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((RespValue::Null, header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| RespError::Protocol(format!("invalid bulk length {len}")))?;
            if len > MAX_BULK_SIZE {
                return Err(RespError::Protocol(format!("bulk string too large: {len}")));
            }

            let body_end = header_len + len;
            if data.len() < body_end + 2 {
                return Ok(None);
            }
            if &data[body_end..body_end + 2] != b"\r\n" {
                return Err(RespError::Protocol("missing CRLF after bulk string".to_string()));
            }
            Ok(Some((
                RespValue::BulkString(Bytes::copy_from_slice(&data[header_len..body_end])),
                body_end + 2,
            )))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((RespValue::Null, header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| RespError::Protocol(format!("invalid array length {len}")))?;
            if len > MAX_ELEMENTS {
                return Err(RespError::Protocol(format!("array too large: {len}")));
            }

            let mut elements = Vec::with_capacity(len.min(64));
            let mut offset = header_len;
            for _ in 0..len {
                match parse_value(&data[offset..], depth + 1)? {
                    Some((value, consumed)) => {
                        elements.push(value);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(elements), offset)))
        }
        other => Err(RespError::Protocol(format!(
            "unexpected reply type byte 0x{other:02x}"
        ))),
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| RespError::Protocol("invalid integer".to_string()))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{RespValue, encode_command, parse_reply};

    #[test]
    fn encodes_commands_as_bulk_arrays() {
        let mut buf = BytesMut::new();
        encode_command(["EVALSHA", "abc", "1", "key"], &mut buf);
        assert_eq!(
            &buf[..],
            b"*4\r\n$7\r\nEVALSHA\r\n$3\r\nabc\r\n$1\r\n1\r\n$3\r\nkey\r\n"
        );
    }

    #[test]
    fn parses_scalar_replies() {
        assert_eq!(parse_reply(b":2\r\n").unwrap(), Some((RespValue::Integer(2), 4)));
        assert_eq!(
            parse_reply(b"+OK\r\n").unwrap(),
            Some((RespValue::SimpleString("OK".to_string()), 5))
        );
        assert_eq!(parse_reply(b"$-1\r\n").unwrap(), Some((RespValue::Null, 5)));
        assert_eq!(
            parse_reply(b"$3\r\nabc\r\n").unwrap(),
            Some((RespValue::BulkString(Bytes::from_static(b"abc")), 9))
        );
    }

    #[test]
    fn splits_error_kind_from_message() {
        let (value, _) = parse_reply(b"-NOSCRIPT No matching script.\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            value,
            RespValue::Error {
                kind: "NOSCRIPT".to_string(),
                message: "No matching script.".to_string(),
            }
        );
    }

    #[test]
    fn incomplete_input_needs_more_bytes() {
        assert_eq!(parse_reply(b"").unwrap(), None);
        assert_eq!(parse_reply(b":12").unwrap(), None);
        assert_eq!(parse_reply(b"$5\r\nab").unwrap(), None);
        assert_eq!(parse_reply(b"*2\r\n:1\r\n").unwrap(), None);
    }

    #[test]
    fn parses_nested_arrays_and_reports_length() {
        let data = b"*2\r\n:1\r\n*1\r\n$1\r\nx\r\ntrailing";
        let (value, consumed) = parse_reply(data).unwrap().unwrap();
        assert_eq!(consumed, data.len() - "trailing".len());
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::BulkString(Bytes::from_static(b"x"))]),
            ])
        );
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(parse_reply(b":abc\r\n").is_err());
        assert!(parse_reply(b"?what\r\n").is_err());
        assert!(parse_reply(b"$3\r\nabcd\r\n").is_err());
    }
}
