//! `Content-Length` framed JSON-RPC over async byte streams.
//!
//! Analyzers speak LSP's base protocol on stdio: an ASCII header block
//! terminated by an empty line, then exactly `Content-Length` bytes of JSON.
//! [`FrameReader`] and [`FrameWriter`] handle the framing; [`Incoming`]
//! sorts a decoded frame into response, server request or notification.

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on one frame body. Workspace-wide diagnostic batches from
/// large TypeScript projects run to several MiB.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub struct FrameReader<R> {
    reader: BufReader<R>,
    header: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            header: String::new(),
        }
    }

    /// Next decoded frame; `Ok(None)` when the stream ends between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        let Some(length) = self.content_length().await? else {
            return Ok(None);
        };
        if length > MAX_FRAME_BYTES {
            bail!("frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }
        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        let value = serde_json::from_slice(&body).context("decoding frame body as JSON")?;
        Ok(Some(value))
    }

    async fn content_length(&mut self) -> Result<Option<usize>> {
        let mut length = None;
        let mut started = false;
        loop {
            self.header.clear();
            let read = self
                .reader
                .read_line(&mut self.header)
                .await
                .context("reading frame header")?;
            if read == 0 {
                if started {
                    bail!("stream ended inside a header block");
                }
                return Ok(None);
            }
            started = true;

            let line = self.header.trim();
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value
                    .trim()
                    .parse::<usize>()
                    .with_context(|| format!("bad Content-Length {:?}", value.trim()))?;
                length = Some(parsed);
            }
        }
        match length {
            Some(length) => Ok(Some(length)),
            None => bail!("header block without Content-Length"),
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, message: &Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding frame body")?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}

/// A frame from the analyzer, classified by JSON-RPC shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests. Ids we issue are always integers.
    Response { id: u64, body: Value },
    /// The analyzer asking us something; it may block until answered.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// `None` for frames that are none of the three shapes.
    #[must_use]
    pub fn classify(frame: &Value) -> Option<Self> {
        let method = frame.get("method").and_then(Value::as_str);
        let params = frame.get("params").cloned();
        match (frame.get("id"), method) {
            (Some(id), Some(method)) => Some(Self::Request {
                id: id.clone(),
                method: method.to_string(),
                params,
            }),
            (None, Some(method)) => Some(Self::Notification {
                method: method.to_string(),
                params,
            }),
            (Some(id), None) if frame.get("result").is_some() || frame.get("error").is_some() => {
                Some(Self::Response {
                    id: id.as_u64()?,
                    body: frame.clone(),
                })
            }
            _ => None,
        }
    }
}
