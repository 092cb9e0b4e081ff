use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::stream::StreamError;

/// Splits the incoming byte stream into text lines, and appends a
/// terminator to each line it encodes.
///
/// Yielded lines do not include the delimiter; a trailing carriage
/// return is stripped too, since the device terminates with CRLF.
/// Bad utf8 is replaced lossily rather than treated as an error- a
/// garbled line must reach the dispatcher so it can be logged, not
/// kill the read loop.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a delimiter into the buffer.
    cursor: usize,

    /// How to delimit incoming byte streams.
    read_delimiter: u8,

    /// Appended to each encoded line.
    write_terminator: &'static [u8],
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_terminator: &'static [u8]) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_terminator,
        }
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', b"\r\n")
    }
}

impl Decoder for LinesCodec {
    type Item = String;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let look_at = &src[self.cursor..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) {
            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;

            // Next time we need to start over.
            self.cursor = 0;

            // Split at the delimiter, getting the bytes before it.
            let mut line = src.split_to(actual_position);

            // Discard the delimiter by advancing the source buffer beyond it.
            src.advance(1);

            if line.ends_with(b"\r") {
                line.truncate(line.len() - 1);
            }

            Ok(Some(String::from_utf8_lossy(&line).to_string()))
        } else {
            // We did not find a full frame.
            // The next time we are called the same buffer `src` will be
            // provided to us (same starting point), but possibly with more
            // data. Since our job is to find the delimiter, we don't need
            // to re-read the bytes we have already looked at.
            self.cursor = read_to;

            Ok(None)
        }
    }
}

impl Encoder<String> for LinesCodec {
    type Error = StreamError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(self.write_terminator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode_all(codec: &mut LinesCodec, src: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(src).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn lines_split_and_crlf_stripped() {
        let mut codec = LinesCodec::default();
        let mut src = BytesMut::from(&b">>> #00001:ok\r\n@button:0:1\npartial"[..]);

        assert_eq!(
            decode_all(&mut codec, &mut src),
            vec![">>> #00001:ok".to_string(), "@button:0:1".to_string()]
        );

        // The partial line stays buffered until its delimiter arrives.
        src.extend_from_slice(b" line\r\n");
        assert_eq!(
            decode_all(&mut codec, &mut src),
            vec!["partial line".to_string()]
        );
    }

    #[test]
    fn encode_appends_terminator() {
        let mut codec = LinesCodec::default();
        let mut dst = BytesMut::new();

        codec.encode("km.move(1,2)#00000".into(), &mut dst).unwrap();

        assert_eq!(&dst[..], b"km.move(1,2)#00000\r\n");
    }

    #[test]
    fn bad_utf8_is_lossy_not_fatal() {
        let mut codec = LinesCodec::default();
        let mut src = BytesMut::from(&[0xff, 0xfe, b'\n'][..]);

        let line = codec.decode(&mut src).unwrap().unwrap();
        assert!(!line.is_empty());
    }
}
