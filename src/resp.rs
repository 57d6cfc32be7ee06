// ABOUTME: Incremental RESP (Redis serialization protocol) decoder and encoder
// ABOUTME: Decoding never consumes bytes on an incomplete frame; encoding is a pure byte-builder

use crate::error::FrameError;
use bytes::{Bytes, BytesMut};

/// A single RESP protocol value.
///
/// Covers the RESP2 value space used by the command pipeline and pool:
/// simple strings, errors, integers, bulk strings (nullable), and arrays
/// (nullable, recursively nested). There is no artificial nesting depth
/// limit; callers that decode untrusted input from unbounded sources
/// should bound buffer growth themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<Value>>),
}

impl Value {
    /// Convenience constructor for a bulk string built from owned bytes.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Value::BulkString(Some(data.into()))
    }

    /// Convenience constructor for a command: an array of bulk strings.
    ///
    /// This is the conventional shape of a RESP request (`*N\r\n$len\r\narg\r\n...`),
    /// though the decoder and pipeline place no requirement on outbound
    /// values taking this shape.
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Bytes>,
    {
        Value::Array(Some(
            args.into_iter().map(|a| Value::bulk(a.into())).collect(),
        ))
    }

    /// True if this is a RESP `Error` value, i.e. a request should be
    /// considered a server-side failure rather than a successful response.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

/// Outcome of a single [`decode`] call.
#[derive(Debug)]
pub enum Decoded {
    /// A complete value was framed; `consumed` bytes should be advanced
    /// past in the caller's read buffer.
    Value { value: Value, consumed: usize },
    /// The buffer holds a valid but incomplete prefix of a frame. No bytes
    /// were consumed; the caller should read more data and retry.
    Incomplete,
}

/// Attempt to decode one RESP value from the front of `buf`.
///
/// On [`Decoded::Value`], exactly `consumed` bytes form the frame; the
/// caller is responsible for advancing its own cursor/buffer by that
/// amount (this function never mutates `buf`). On [`Decoded::Incomplete`],
/// `buf` held a valid but partial prefix and must be re-decoded in full
/// once more bytes arrive. On `Err`, the leading bytes cannot be part of
/// any valid RESP frame and the connection using this decoder must be
/// closed — the read position after a failure is unspecified.
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    match decode_one(buf)? {
        Some((value, consumed)) => Ok(Decoded::Value { value, consumed }),
        None => Ok(Decoded::Incomplete),
    }
}

/// Encode `value` onto the end of `buf`, RESP wire format, CRLF line endings.
pub fn encode(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::SimpleString(s) => {
            buf.extend_from_slice(b"+");
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Value::Error(s) => {
            buf.extend_from_slice(b"-");
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Value::Integer(n) => {
            buf.extend_from_slice(b":");
            buf.extend_from_slice(n.to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Value::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
        Value::BulkString(Some(data)) => {
            buf.extend_from_slice(b"$");
            buf.extend_from_slice(data.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        Value::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        Value::Array(Some(items)) => {
            buf.extend_from_slice(b"*");
            buf.extend_from_slice(items.len().to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in items {
                encode(item, buf);
            }
        }
    }
}

/// Recursive decode step. Operates on a borrowed slice so that an
/// incomplete nested array simply returns `Ok(None)` without having
/// touched any external cursor — the "snapshot and restore" invariant
/// from the specification falls out of this for free, rather than being
/// implemented as an explicit save/restore of a shared position.
fn decode_one(buf: &[u8]) -> Result<Option<(Value, usize)>, FrameError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    let rest = &buf[1..];

    match tag {
        b'+' => match read_line(rest) {
            Some((line, line_len)) => Ok(Some((
                Value::SimpleString(lossy_string(line)),
                1 + line_len,
            ))),
            None => Ok(None),
        },
        b'-' => match read_line(rest) {
            Some((line, line_len)) => Ok(Some((Value::Error(lossy_string(line)), 1 + line_len))),
            None => Ok(None),
        },
        b':' => match read_line(rest) {
            Some((line, line_len)) => Ok(Some((Value::Integer(parse_i64(line)?), 1 + line_len))),
            None => Ok(None),
        },
        b'$' => decode_bulk_string(rest),
        b'*' => decode_array(rest),
        other => Err(FrameError::InvalidTypeByte(other)),
    }
}

fn decode_bulk_string(rest: &[u8]) -> Result<Option<(Value, usize)>, FrameError> {
    let Some((line, line_len)) = read_line(rest) else {
        return Ok(None);
    };
    let len = parse_i64(line)?;
    if len == -1 {
        return Ok(Some((Value::BulkString(None), 1 + line_len)));
    }
    if len < -1 {
        return Err(FrameError::InvalidLength(len));
    }
    let len = len as usize;
    // +1 accounts for the leading `$` tag byte, which is not part of `rest`.
    let total = 1 + line_len + len + 2;
    if rest.len() + 1 < total {
        return Ok(None);
    }
    let body = &rest[line_len..line_len + len];
    let terminator = &rest[line_len + len..line_len + len + 2];
    if terminator != b"\r\n" {
        return Err(FrameError::InvalidNumber(
            "bulk string not terminated by CRLF".to_string(),
        ));
    }
    Ok(Some((Value::BulkString(Some(Bytes::copy_from_slice(body))), total)))
}

fn decode_array(rest: &[u8]) -> Result<Option<(Value, usize)>, FrameError> {
    let Some((line, line_len)) = read_line(rest) else {
        return Ok(None);
    };
    let count = parse_i64(line)?;
    if count == -1 {
        return Ok(Some((Value::Array(None), 1 + line_len)));
    }
    if count < -1 {
        return Err(FrameError::InvalidLength(count));
    }

    let mut pos = line_len;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match decode_one(&rest[pos..])? {
            Some((value, consumed)) => {
                items.push(value);
                pos += consumed;
            }
            // Incomplete nested value: the whole array call reports
            // incomplete. `rest`/`pos` are local, so nothing external was
            // ever advanced — equivalent to restoring the cursor.
            None => return Ok(None),
        }
    }
    Ok(Some((Value::Array(Some(items)), 1 + pos)))
}

fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let idx = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..idx], idx + 2))
}

fn parse_i64(bytes: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| FrameError::InvalidNumber(lossy_string(bytes)))
}

fn lossy_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_value(input: &[u8]) -> (Value, usize) {
        match decode(input).expect("decode should succeed") {
            Decoded::Value { value, consumed } => (value, consumed),
            Decoded::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn decodes_simple_string() {
        let (value, consumed) = decode_value(b"+OK\r\n");
        assert_eq!(value, Value::SimpleString("OK".to_string()));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn decodes_error() {
        let (value, consumed) = decode_value(b"-ERR test\r\n");
        assert_eq!(value, Value::Error("ERR test".to_string()));
        assert_eq!(consumed, 11);
    }

    #[test]
    fn decodes_integer() {
        let (value, consumed) = decode_value(b":2\r\n");
        assert_eq!(value, Value::Integer(2));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn decodes_negative_integer() {
        let (value, consumed) = decode_value(b":-42\r\n");
        assert_eq!(value, Value::Integer(-42));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn decodes_bulk_string() {
        let (value, consumed) = decode_value(b"$2\r\naa\r\n");
        assert_eq!(value, Value::BulkString(Some(Bytes::from_static(b"aa"))));
        assert_eq!(consumed, 8);
    }

    #[test]
    fn empty_bulk_string_is_distinct_from_null() {
        let (empty, _) = decode_value(b"$0\r\n\r\n");
        assert_eq!(empty, Value::BulkString(Some(Bytes::new())));

        let (null, _) = decode_value(b"$-1\r\n");
        assert_eq!(null, Value::BulkString(None));
    }

    #[test]
    fn decodes_flat_array() {
        let (value, consumed) = decode_value(b"*2\r\n:1\r\n:2\r\n");
        assert_eq!(
            value,
            Value::Array(Some(vec![Value::Integer(1), Value::Integer(2)]))
        );
        assert_eq!(consumed, 14);
    }

    #[test]
    fn decodes_nested_array() {
        let (value, consumed) = decode_value(b"*2\r\n*1\r\n:1\r\n:2\r\n");
        assert_eq!(
            value,
            Value::Array(Some(vec![
                Value::Array(Some(vec![Value::Integer(1)])),
                Value::Integer(2)
            ]))
        );
        assert_eq!(consumed, 16);
    }

    #[test]
    fn null_array() {
        let (value, consumed) = decode_value(b"*-1\r\n");
        assert_eq!(value, Value::Array(None));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn mixed_element_types_in_array() {
        let (value, _) = decode_value(b"*3\r\n+ok\r\n$-1\r\n:7\r\n");
        assert_eq!(
            value,
            Value::Array(Some(vec![
                Value::SimpleString("ok".to_string()),
                Value::BulkString(None),
                Value::Integer(7),
            ]))
        );
    }

    #[test]
    fn incomplete_prefix_reports_incomplete_and_consumes_nothing() {
        assert!(matches!(decode(b"+OK\r").unwrap(), Decoded::Incomplete));
        assert!(matches!(decode(b"$5\r\nhel").unwrap(), Decoded::Incomplete));
        assert!(matches!(decode(b"*2\r\n:1\r\n").unwrap(), Decoded::Incomplete));
        assert!(matches!(decode(b"").unwrap(), Decoded::Incomplete));
    }

    #[test]
    fn incomplete_inner_array_element_restores_whole_array() {
        // The outer array claims 2 elements but only one complete inner
        // value is present; decoding must report Incomplete for the whole
        // frame, not a partial array.
        assert!(matches!(
            decode(b"*2\r\n:1\r\n:2").unwrap(),
            Decoded::Incomplete
        ));
    }

    #[test]
    fn unknown_leading_byte_is_malformed() {
        let err = decode(b"&3\r\n").unwrap_err();
        assert!(matches!(err, FrameError::InvalidTypeByte(b'&')));
    }

    #[test]
    fn non_numeric_length_is_malformed() {
        let err = decode(b"$abc\r\nhello\r\n").unwrap_err();
        assert!(matches!(err, FrameError::InvalidNumber(_)));
    }

    #[test]
    fn negative_length_other_than_null_sentinel_is_malformed() {
        let err = decode(b"$-2\r\n").unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(-2)));

        let err = decode(b"*-5\r\n").unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength(-5)));
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let mut input = Vec::new();
        input.extend_from_slice(b"+OK\r\n");
        input.extend_from_slice(b":42\r\n");

        let (first, consumed_first) = decode_value(&input);
        assert_eq!(first, Value::SimpleString("OK".to_string()));
        assert_eq!(consumed_first, 5);

        let (second, consumed_second) = decode_value(&input[consumed_first..]);
        assert_eq!(second, Value::Integer(42));
        assert_eq!(consumed_second, 5);
        assert_eq!(consumed_first + consumed_second, input.len());
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let values = vec![
            Value::SimpleString("OK".to_string()),
            Value::Error("ERR boom".to_string()),
            Value::Integer(-17),
            Value::BulkString(Some(Bytes::from_static(b"payload"))),
            Value::BulkString(None),
            Value::Array(Some(vec![Value::Integer(1), Value::bulk("two")])),
            Value::Array(None),
        ];

        for value in values {
            let mut buf = BytesMut::new();
            encode(&value, &mut buf);
            let (decoded, consumed) = decode_value(&buf);
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn command_builds_array_of_bulk_strings() {
        let value = Value::command(["SET", "key", "value"]);
        assert_eq!(
            value,
            Value::Array(Some(vec![
                Value::bulk("SET"),
                Value::bulk("key"),
                Value::bulk("value"),
            ]))
        );
    }
}
