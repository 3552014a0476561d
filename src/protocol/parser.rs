use bytes::{Buf, Bytes, BytesMut};

use super::types::RespValue;
use crate::error::{Error, Result};

/// Incremental RESP reply parser
pub struct Parser;

impl Parser {
    /// Parse one complete reply from the buffer.
    /// Returns None if the buffer doesn't hold a complete reply yet.
    /// Advances the buffer past the parsed data.
    #[inline]
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>> {
        match Self::parse_value(buf)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse value, returning (value, bytes_consumed) or None if incomplete
    fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            b'+' => Ok(Self::parse_line(buf).map(|(s, n)| (RespValue::SimpleString(s), n))),
            b'-' => Ok(Self::parse_line(buf).map(|(s, n)| (RespValue::Error(s), n))),
            b':' => Self::parse_integer(buf),
            b'$' => Self::parse_bulk_string(buf),
            b'*' => Self::parse_array(buf),
            other => Err(Error::Protocol(format!(
                "unexpected reply type byte '{}'",
                other as char
            ))),
        }
    }

    /// Find \r\n in buffer, return position of \r
    #[inline]
    fn find_crlf(buf: &[u8]) -> Option<usize> {
        memchr::memchr(b'\r', buf).and_then(|pos| {
            if pos + 1 < buf.len() && buf[pos + 1] == b'\n' {
                Some(pos)
            } else {
                None
            }
        })
    }

    fn parse_line(buf: &[u8]) -> Option<(Bytes, usize)> {
        let pos = Self::find_crlf(buf)?;
        Some((Bytes::copy_from_slice(&buf[1..pos]), pos + 2))
    }

    fn parse_length(buf: &[u8], crlf_pos: usize, what: &str) -> Result<i64> {
        std::str::from_utf8(&buf[1..crlf_pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid {}", what)))
    }

    fn parse_integer(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        match Self::find_crlf(buf) {
            Some(pos) => {
                let n = Self::parse_length(buf, pos, "integer")?;
                Ok(Some((RespValue::Integer(n), pos + 2)))
            }
            None => Ok(None),
        }
    }

    fn parse_bulk_string(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        let crlf_pos = match Self::find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = Self::parse_length(buf, crlf_pos, "bulk length")?;
        if len < 0 {
            return Ok(Some((RespValue::Null, crlf_pos + 2)));
        }

        let data_start = crlf_pos + 2;
        let data_end = data_start + len as usize;
        let total_len = data_end + 2;

        if buf.len() < total_len {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_end]);
        Ok(Some((RespValue::BulkString(data), total_len)))
    }

    fn parse_array(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
        let crlf_pos = match Self::find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let len = Self::parse_length(buf, crlf_pos, "array length")?;
        if len < 0 {
            return Ok(Some((RespValue::Null, crlf_pos + 2)));
        }

        let mut items = Vec::with_capacity(len as usize);
        let mut offset = crlf_pos + 2;

        for _ in 0..len {
            match Self::parse_value(&buf[offset..])? {
                Some((value, consumed)) => {
                    items.push(value);
                    offset += consumed;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(items), offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pmessage() {
        let mut buf = BytesMut::from(
            &b"*4\r\n$8\r\npmessage\r\n$1\r\n*\r\n$14\r\n+switch-master\r\n$36\r\nmymaster 10.0.0.1 6379 10.0.0.2 6379\r\n"[..],
        );
        let value = Parser::parse(&mut buf).unwrap().unwrap();
        let items = value.into_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[2].to_text().unwrap(), "+switch-master");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_incomplete_keeps_buffer() {
        let mut buf = BytesMut::from(&b"*2\r\n$4\r\nPON"[..]);
        assert!(Parser::parse(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 11);
    }

    #[test]
    fn test_parse_error_and_null() {
        let mut buf = BytesMut::from(&b"-ERR No such master\r\n$-1\r\n"[..]);
        assert_eq!(
            Parser::parse(&mut buf).unwrap(),
            Some(RespValue::Error(Bytes::from_static(b"ERR No such master")))
        );
        assert_eq!(Parser::parse(&mut buf).unwrap(), Some(RespValue::Null));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let mut buf = BytesMut::from(&b"hello\r\n"[..]);
        assert!(matches!(Parser::parse(&mut buf), Err(Error::Protocol(_))));
    }
}
