//! Content-Length framing for the query-server RPC channel.
//!
//! Every message in either direction is `Content-Length: N\r\n\r\n`
//! followed by exactly N bytes of JSON. Framing is all this module
//! knows; message meaning lives in [`protocol`](crate::protocol).

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame. Evaluation results for large
/// databases run to megabytes; anything past this is a protocol
/// failure, not data.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Decodes incoming frames from the server's stdout.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    /// Reused across frames to avoid a fresh allocation per message.
    body: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            body: Vec::new(),
        }
    }

    /// Read one frame, or `Ok(None)` on a clean EOF between frames.
    ///
    /// EOF inside a frame (headers started, or body short) is an
    /// error: the server died mid-message.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(content_length) = self.read_content_length().await? else {
            return Ok(None);
        };
        if content_length > MAX_FRAME_BYTES {
            bail!("frame of {content_length} bytes exceeds the {MAX_FRAME_BYTES}-byte limit");
        }

        self.body.resize(content_length, 0);
        self.reader
            .read_exact(&mut self.body)
            .await
            .context("frame body ended early")?;
        let message = serde_json::from_slice(&self.body).context("frame body is not JSON")?;
        Ok(Some(message))
    }

    /// Parse the header block; `Ok(None)` only when EOF arrives before
    /// any header byte.
    async fn read_content_length(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut line = String::new();
        let mut in_headers = false;
        loop {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                if in_headers {
                    bail!("connection closed inside a frame header block");
                }
                return Ok(None);
            }
            in_headers = true;

            let header = line.trim();
            if header.is_empty() {
                break;
            }
            // Headers other than Content-Length (e.g. Content-Type)
            // are permitted and ignored.
            if let Some((name, value)) = header.split_once(':')
                && name.trim().eq_ignore_ascii_case("Content-Length")
            {
                content_length = Some(
                    value
                        .trim()
                        .parse::<usize>()
                        .with_context(|| format!("bad Content-Length value '{}'", value.trim()))?,
                );
            }
        }
        match content_length {
            Some(len) => Ok(Some(len)),
            None => bail!("frame header block has no Content-Length"),
        }
    }
}

/// Encodes outgoing frames onto the server's stdin.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding frame body")?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(bytes: &[u8]) -> Vec<serde_json::Value> {
        let mut reader = FrameReader::new(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let messages = [
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "evaluation/runQueries"}),
            serde_json::json!({"jsonrpc": "2.0", "method": "ql/progressUpdated", "params": {"id": 3}}),
        ];
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        for msg in &messages {
            writer.write_frame(msg).await.unwrap();
        }
        assert_eq!(read_all(&buf).await, messages);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_headers_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 10\r\n"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_short_body_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: 50\r\n\r\n{}"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_content_length_is_error() {
        let mut reader = FrameReader::new(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_extra_headers_ignored() {
        let body = br#"{"id":9}"#;
        let mut framed = format!(
            "Content-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        framed.extend_from_slice(body);
        let frames = read_all(&framed).await;
        assert_eq!(frames[0]["id"], 9);
    }

    #[tokio::test]
    async fn test_header_name_case_insensitive() {
        let body = br#"{"id":1}"#;
        let mut framed = format!("content-length: {}\r\n\r\n", body.len()).into_bytes();
        framed.extend_from_slice(body);
        assert_eq!(read_all(&framed).await.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_content_length_counts_bytes_not_chars() {
        // Multi-byte payload: the header must carry the byte length.
        let msg = serde_json::json!({"name": "sécurité"});
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&msg).await.unwrap();
        let frames = read_all(&buf).await;
        assert_eq!(frames[0]["name"], "sécurité");
    }

    #[tokio::test]
    async fn test_garbage_content_length_is_error() {
        let mut reader = FrameReader::new(&b"Content-Length: lots\r\n\r\n"[..]);
        assert!(reader.read_frame().await.is_err());
    }
}
