//! Wire framing of the compiler server's stdio mode.
//!
//! Request: each argument followed by `\n`, then optionally `0x01` and the
//! stdin content, prefixed by the payload length as little-endian u32.
//!
//! Response: little-endian u32 length and payload. Payload lines starting with
//! `0x01` are print messages, a line starting with `0x02` marks an error, all
//! other lines are the response body.

use super::ChannelError;
use serde::Serialize;

/// Upper bound on a single response payload.
pub const MAX_RESPONSE_LEN: usize = 64 * 1024 * 1024;

const STDIN_MARKER: u8 = 0x01;
const PRINT_MARKER: char = '\x01';
const ERROR_MARKER: char = '\x02';

/// One decoded response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Response {
    pub output: String,
    pub prints: Vec<String>,
    pub has_error: bool,
}

/// Encode one request frame. Fails if the payload does not fit the u32 length
/// prefix.
pub fn encode_request(
    arguments: &[String],
    stdin: Option<&str>,
) -> Result<Vec<u8>, ChannelError> {
    let mut payload = Vec::new();
    for arg in arguments {
        payload.extend_from_slice(arg.as_bytes());
        payload.push(b'\n');
    }
    if let Some(content) = stdin {
        payload.push(STDIN_MARKER);
        payload.extend_from_slice(content.as_bytes());
    }

    let len = frame_length(payload.len())?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn frame_length(len: usize) -> Result<u32, ChannelError> {
    u32::try_from(len).map_err(|_| {
        ChannelError::Protocol(format!(
            "request of {len} bytes exceeds the u32 length prefix"
        ))
    })
}

pub fn decode_response(payload: &[u8]) -> Response {
    let text = String::from_utf8_lossy(payload);
    let mut response = Response::default();

    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    for line in lines {
        if let Some(print) = line.strip_prefix(PRINT_MARKER) {
            response.prints.push(print.replace(PRINT_MARKER, "\n"));
        } else if line.starts_with(ERROR_MARKER) {
            response.has_error = true;
        } else {
            response.output.push_str(line);
            response.output.push('\n');
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_arguments_and_stdin() {
        let args = vec!["--display".to_string(), "Main.hx@0@type".to_string()];
        let frame = encode_request(&args, Some("class Main {}")).unwrap();
        let payload = b"--display\nMain.hx@0@type\n\x01class Main {}";
        assert_eq!(&frame[..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..], payload);
    }

    #[test]
    fn encode_without_stdin() {
        let frame = encode_request(&["-version".to_string()], None).unwrap();
        assert_eq!(frame, b"\x09\x00\x00\x00-version\n");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(frame_length(u32::MAX as usize), Ok(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            frame_length(u32::MAX as usize + 1),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn decode_splits_prints_and_errors() {
        let resp = decode_response(b"<type>Int</type>\n\x01hello\x01world\n");
        assert_eq!(resp.output, "<type>Int</type>\n");
        assert_eq!(resp.prints, vec!["hello\nworld".to_string()]);
        assert!(!resp.has_error);

        let failed = decode_response(b"Main.hx:1: characters 0-3 : Type not found\n\x02\n");
        assert!(failed.has_error);
        assert_eq!(failed.output, "Main.hx:1: characters 0-3 : Type not found\n");
    }

    #[test]
    fn decode_body_without_trailing_newline() {
        let resp = decode_response(b"4.0.0");
        assert_eq!(resp.output, "4.0.0\n");
        assert!(resp.prints.is_empty());
    }
}
