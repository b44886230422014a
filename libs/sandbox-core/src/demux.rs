/// Stream Demultiplexer
///
/// Non-TTY exec output from the container runtime is multiplexed: every chunk
/// is preceded by an 8-byte header
///
/// ```text
/// [stream type, 0, 0, 0, size (u32, big-endian)] [payload; size]
/// ```
///
/// where stream type 1 is stdout and 2 is stderr. Demultiplexing drops the
/// headers and concatenates the payloads in arrival order.
///
/// The declared size is honored, so payload bytes that happen to equal a
/// stream-type marker are kept. Bytes that do not look like a header at a frame
/// boundary (TTY output, garbage) and truncated trailing frames are passed
/// through as they are.

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn marker(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }

    fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

/// One decoded piece of the stream. `stream` is `None` for unframed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub stream: Option<StreamKind>,
    pub payload: &'a [u8],
}

/// Iterator over the chunks of a multiplexed buffer
pub struct Frames<'a> {
    rest: &'a [u8],
}

pub fn frames(raw: &[u8]) -> Frames<'_> {
    Frames { rest: raw }
}

impl<'a> Iterator for Frames<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.rest.is_empty() {
            return None;
        }

        let Some((stream, size)) = parse_header(self.rest) else {
            let payload = std::mem::take(&mut self.rest);
            return Some(Chunk {
                stream: None,
                payload,
            });
        };

        let body = &self.rest[HEADER_LEN..];
        let end = size.min(body.len());
        let (payload, rest) = body.split_at(end);
        self.rest = rest;

        Some(Chunk {
            stream: Some(stream),
            payload,
        })
    }
}

fn parse_header(buf: &[u8]) -> Option<(StreamKind, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let stream = StreamKind::from_marker(buf[0])?;
    if buf[1..4] != [0, 0, 0] {
        return None;
    }
    let size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    Some((stream, size))
}

/// Strip all frame headers, keeping stdout and stderr payloads interleaved
pub fn demultiplex(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for chunk in frames(raw) {
        out.extend_from_slice(chunk.payload);
    }
    out
}

/// Demultiplex and decode as text. Invalid UTF-8 becomes U+FFFD.
pub fn demultiplex_to_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(&demultiplex(raw)).into_owned()
}

/// Append one framed chunk to `buf`
pub fn encode_frame(buf: &mut Vec<u8>, stream: StreamKind, payload: &[u8]) {
    let size = payload.len().min(u32::MAX as usize);
    buf.push(stream.marker());
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&(size as u32).to_be_bytes());
    buf.extend_from_slice(&payload[..size]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(parts: &[(StreamKind, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for (stream, payload) in parts {
            encode_frame(&mut buf, *stream, payload.as_bytes());
        }
        buf
    }

    #[test]
    fn test_round_trip_any_chunking() {
        let payloads = [
            "",
            "hello world\n",
            "25",
            "multi\nline\n\noutput\n",
            "ünïcødé ✓\n",
            "\t tabs and spaces  \r\n",
        ];

        for payload in payloads {
            for chunk_size in [1, 2, 3, 7, 64] {
                let mut raw = Vec::new();
                for piece in payload.as_bytes().chunks(chunk_size) {
                    encode_frame(&mut raw, StreamKind::Stdout, piece);
                }
                assert_eq!(demultiplex_to_string(&raw), payload, "chunk size {}", chunk_size);
            }
        }
    }

    #[test]
    fn test_stdout_and_stderr_interleave_in_arrival_order() {
        let raw = framed(&[
            (StreamKind::Stdout, "out 1\n"),
            (StreamKind::Stderr, "err 1\n"),
            (StreamKind::Stdout, "out 2\n"),
        ]);

        assert_eq!(demultiplex_to_string(&raw), "out 1\nerr 1\nout 2\n");

        let kinds: Vec<_> = frames(&raw).map(|c| c.stream).collect();
        assert_eq!(
            kinds,
            vec![
                Some(StreamKind::Stdout),
                Some(StreamKind::Stderr),
                Some(StreamKind::Stdout)
            ]
        );
    }

    #[test]
    fn test_marker_bytes_inside_payload_survive() {
        // A scan for 0x01/0x02 would eat 8 bytes here; the declared length keeps them.
        let payload = b"a\x01bcdefghij\x02k";
        let mut raw = Vec::new();
        encode_frame(&mut raw, StreamKind::Stdout, payload);

        assert_eq!(demultiplex(&raw), payload.to_vec());
    }

    #[test]
    fn test_unframed_input_passes_through() {
        assert_eq!(demultiplex_to_string(b"plain tty output\n"), "plain tty output\n");
        assert_eq!(demultiplex_to_string(b""), "");
    }

    #[test]
    fn test_truncated_header_passes_through() {
        let mut raw = framed(&[(StreamKind::Stdout, "ok")]);
        raw.extend_from_slice(&[1, 0, 0]);

        assert_eq!(demultiplex(&raw), b"ok\x01\x00\x00".to_vec());
    }

    #[test]
    fn test_truncated_payload_keeps_remaining_bytes() {
        let mut raw = vec![1, 0, 0, 0, 0, 0, 0, 10];
        raw.extend_from_slice(b"abc");

        assert_eq!(demultiplex_to_string(&raw), "abc");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut raw = Vec::new();
        encode_frame(&mut raw, StreamKind::Stderr, &[b'o', 0xff, b'k']);

        assert_eq!(demultiplex_to_string(&raw), "o\u{fffd}k");
    }
}
