//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies out of a growing
//! read buffer, so the async transport can feed partial reads.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: An incomplete frame yields `None` and consumes nothing.
//! 2. **Buffer Reuse**: Commands are encoded into a caller-owned buffer.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use crate::error::{ClientError, ClientResult};

/// Largest bulk string accepted from a server (the Redis `proto-max-bulk-len` default).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array header accepted from a server.
const MAX_ARRAY_LEN: i64 = i32::MAX as i64;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Appends a RESP2 array command to the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Parses one RESP value from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn parse_response(buf: &[u8]) -> ClientResult<Option<(RespValue, usize)>> {
    parse_at(buf, 0)
}

fn parse_at(buf: &[u8], pos: usize) -> ClientResult<Option<(RespValue, usize)>> {
    let (line, next) = match read_line(buf, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            parse_bulk(buf, len, next)
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            parse_array(buf, len, next)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk(buf: &[u8], len: i64, start: usize) -> ClientResult<Option<(RespValue, usize)>> {
    if len < 0 {
        return Ok(Some((RespValue::Bulk(None), start)));
    }
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol);
    }
    let end = start + len as usize;
    if buf.len() < end + 2 {
        return Ok(None);
    }
    if &buf[end..end + 2] != b"\r\n" {
        return Err(ClientError::Protocol);
    }
    Ok(Some((RespValue::Bulk(Some(buf[start..end].to_vec())), end + 2)))
}

fn parse_array(buf: &[u8], len: i64, start: usize) -> ClientResult<Option<(RespValue, usize)>> {
    if len <= 0 {
        return Ok(Some((RespValue::Array(Vec::new()), start)));
    }

    if len > MAX_ARRAY_LEN {
        return Err(ClientError::Protocol);
    }
    // Every element takes at least three bytes; the header alone never sizes the allocation.
    let mut items = Vec::with_capacity((len as usize).min(buf.len().saturating_sub(start) / 3));
    let mut cursor = start;
    for _ in 0..len {
        match parse_at(buf, cursor)? {
            Some((item, next)) => {
                items.push(item);
                cursor = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), cursor)))
}

/// Finds the CRLF-terminated line starting at `pos`.
fn read_line(buf: &[u8], pos: usize) -> ClientResult<Option<(&[u8], usize)>> {
    let rest = &buf[pos..];
    match rest.iter().position(|&b| b == b'\n') {
        None => Ok(None),
        Some(idx) => {
            if idx == 0 || rest[idx - 1] != b'\r' {
                return Err(ClientError::Protocol);
            }
            Ok(Some((&rest[..idx - 1], pos + idx + 1)))
        }
    }
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Digits go through a stack buffer; no temporary String.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_complete(input: &[u8]) -> RespValue {
        let (value, used) = parse_response(input).unwrap().expect("complete frame");
        assert_eq!(used, input.len());
        value
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn encodes_pipelined_commands_back_to_back() {
        let mut buf = Vec::new();
        encode_command(&[b"PING"], &mut buf);
        encode_command(&[b"GET", b""], &mut buf);
        assert_eq!(&buf, b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$0\r\n\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(parse_complete(b"+OK\r\n"), RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_bulk_string() {
        assert_eq!(
            parse_complete(b"$5\r\nhello\r\n"),
            RespValue::Bulk(Some(b"hello".to_vec()))
        );
    }

    #[test]
    fn parses_null_bulk_string() {
        assert_eq!(parse_complete(b"$-1\r\n"), RespValue::Bulk(None));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(parse_complete(b":42\r\n"), RespValue::Integer(42));
        assert_eq!(parse_complete(b":-2\r\n"), RespValue::Integer(-2));
    }

    #[test]
    fn parses_error() {
        assert_eq!(
            parse_complete(b"-ERR bad\r\n"),
            RespValue::Error(b"ERR bad".to_vec())
        );
    }

    #[test]
    fn parses_nested_array() {
        let value = parse_complete(b"*2\r\n:1\r\n*1\r\n$1\r\na\r\n");
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Bulk(Some(b"a".to_vec()))]),
            ])
        );
    }

    #[test]
    fn incomplete_frames_wait_for_more_bytes() {
        assert!(parse_response(b"").unwrap().is_none());
        assert!(parse_response(b"+OK").unwrap().is_none());
        assert!(parse_response(b"$5\r\nhel").unwrap().is_none());
        assert!(parse_response(b"*2\r\n:1\r\n").unwrap().is_none());
    }

    #[test]
    fn leaves_trailing_frames_unconsumed() {
        let (value, used) = parse_response(b"+PONG\r\n:7\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Simple(b"PONG".to_vec()));
        assert_eq!(used, 7);
    }

    #[test]
    fn rejects_bad_framing() {
        assert!(matches!(parse_response(b"?x\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse_response(b"+OK\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse_response(b":12a\r\n"), Err(ClientError::Protocol)));
        assert!(matches!(parse_response(b"$2\r\nabXY"), Err(ClientError::Protocol)));
    }

    #[test]
    fn oversized_headers_are_protocol_errors() {
        assert!(matches!(
            parse_response(b"*4611686018427387904\r\n"),
            Err(ClientError::Protocol)
        ));
        assert!(matches!(
            parse_response(b"$9223372036854775807\r\n"),
            Err(ClientError::Protocol)
        ));
    }

    #[test]
    fn large_array_headers_are_bounded() {
        assert!(matches!(
            parse_response(b"*100000000000\r\n"),
            Err(ClientError::Protocol)
        ));
        // Within bounds but only one element buffered so far.
        assert!(parse_response(b"*2000000000\r\n:1\r\n").unwrap().is_none());
    }
}
