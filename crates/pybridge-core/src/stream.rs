use crate::process::OutputEncoding;
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

/// Splits a byte stream into lines, decoding each as lossy UTF-8.
///
/// `\r\n` and `\n` both terminate a line; a trailing partial line is flushed at EOF.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8LineCodec;

impl Decoder for Utf8LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let line = src.split_to(newline + 1);
        let line = &line[..newline];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.chunk();
        let rest = rest.strip_suffix(b"\r").unwrap_or(rest);
        let line = String::from_utf8_lossy(rest).into_owned();
        src.clear();
        Ok(Some(line))
    }
}

/// Feed every line of `io` to `sink` until EOF.
pub async fn stream_lines<R, F>(io: R, mut sink: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut frames = FramedRead::with_capacity(io, Utf8LineCodec, 1024);
    while let Some(frame) = frames.next().await {
        sink(frame?);
    }
    Ok(())
}

/// Decode captured bytes with an explicitly chosen encoding. Invalid sequences
/// are replaced, a leading BOM is dropped.
pub fn decode_output(bytes: &[u8], encoding: OutputEncoding) -> String {
    let text = match encoding {
        OutputEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        OutputEncoding::Utf16Le => {
            let units = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
            char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect()
        }
    };
    match text.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn test_codec_splits_lines() {
        let mut codec = Utf8LineCodec;
        let mut buf = BytesMut::from(&b"first\r\nsecond\npart"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("second"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("part"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_replaces_invalid_utf8() {
        let mut codec = Utf8LineCodec;
        let mut buf = BytesMut::from(&b"ok \xff\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("ok \u{fffd}")
        );
    }

    #[tokio::test]
    async fn test_stream_lines() {
        let input: &[u8] = b"one\ntwo\r\nthree";
        let mut lines = Vec::new();
        stream_lines(input, |line| lines.push(line)).await.unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_decode_utf16le_output() {
        let mut bytes = vec![0xff, 0xfe];
        bytes.extend(utf16le("  NAME   STATE\r\n* Ubuntu Running\r\n"));
        let text = decode_output(&bytes, OutputEncoding::Utf16Le);
        assert!(text.starts_with("  NAME"));
        assert!(text.contains("* Ubuntu Running"));
    }

    #[test]
    fn test_decode_utf8_output() {
        assert_eq!(decode_output(b"hello\n", OutputEncoding::Utf8), "hello\n");
        assert_eq!(
            decode_output("\u{feff}x".as_bytes(), OutputEncoding::Utf8),
            "x"
        );
    }
}
