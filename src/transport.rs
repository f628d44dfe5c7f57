//! Framed transport over one connected socket.
//!
//! Every message travels as `MAGIC | KIND | LEN` followed by `LEN` payload
//! bytes. A peer closing the connection between frames is a state
//! transition (`Ok(None)`), not an error; closing in the middle of a frame
//! is an error.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::protocol::{frame, timeouts::write_deadline_ms, HEADER_LEN};
use crate::protocol_core::{build_frame_header, content_text, parse_frame_header, validate_frame_size};

/// Connection state of one end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Reply,
    Block,
    Done,
}

impl FrameKind {
    fn id(self) -> u8 {
        match self {
            FrameKind::Request => frame::REQUEST,
            FrameKind::Reply => frame::REPLY,
            FrameKind::Block => frame::BLOCK,
            FrameKind::Done => frame::DONE,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            frame::REQUEST => FrameKind::Request,
            frame::REPLY => FrameKind::Reply,
            frame::BLOCK => FrameKind::Block,
            frame::DONE => FrameKind::Done,
            other => bail!("unknown frame type {}", other),
        })
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Request => "REQUEST",
            FrameKind::Reply => "REPLY",
            FrameKind::Block => "BLOCK",
            FrameKind::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(line: &str) -> Self {
        Self {
            kind: FrameKind::Request,
            payload: line.as_bytes().to_vec(),
        }
    }

    pub fn reply(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: FrameKind::Reply,
            payload: payload.into(),
        }
    }

    pub fn block(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Block,
            payload,
        }
    }

    pub fn done() -> Self {
        Self {
            kind: FrameKind::Done,
            payload: Vec::new(),
        }
    }

    /// Payload up to the first zero byte, as text.
    pub fn text(&self) -> String {
        content_text(&self.payload)
    }
}

/// Receiving half of a session.
pub struct FrameReader<R> {
    inner: R,
    state: SessionState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read the next frame. `Ok(None)` means the peer closed the connection.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.state == SessionState::Closed {
            return Ok(None);
        }
        let mut hdr = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut hdr).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.state = SessionState::Closed;
                return Ok(None);
            }
            Err(e) => {
                self.state = SessionState::Closed;
                return Err(e).context("receive failed");
            }
        }
        let (typ, len) = parse_frame_header(&hdr)?;
        let kind = FrameKind::try_from(typ)?;
        let len = len as usize;
        validate_frame_size(len)?;
        let mut payload = vec![0u8; len];
        if len > 0 {
            if let Err(e) = self.inner.read_exact(&mut payload).await {
                self.state = SessionState::Closed;
                return Err(e).with_context(|| format!("connection lost inside {} frame", kind));
            }
        }
        Ok(Some(Frame { kind, payload }))
    }

    /// `read_frame` bounded by a deadline.
    pub async fn read_frame_timed(&mut self, ms: u64) -> Result<Option<Frame>> {
        match timeout(Duration::from_millis(ms), self.read_frame()).await {
            Ok(res) => res,
            Err(_) => bail!("frame read timeout ({} ms)", ms),
        }
    }
}

/// Sending half of a session.
pub struct FrameWriter<W> {
    inner: W,
    state: SessionState,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.state == SessionState::Closed {
            bail!("send on closed session");
        }
        validate_frame_size(frame.payload.len())?;
        let ms = write_deadline_ms(frame.payload.len());
        let hdr = build_frame_header(frame.kind.id(), frame.payload.len() as u32);
        let res = match timeout(Duration::from_millis(ms), async {
            self.inner.write_all(&hdr).await?;
            if !frame.payload.is_empty() {
                self.inner.write_all(&frame.payload).await?;
            }
            self.inner.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("send failed")),
            Err(_) => Err(anyhow::anyhow!("frame write timeout ({} ms)", ms)),
        };
        if res.is_err() {
            self.state = SessionState::Closed;
        }
        res
    }

    /// Close the sending direction. Errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        if self.state == SessionState::Open {
            let _ = self.inner.shutdown().await;
            self.state = SessionState::Closed;
        }
    }
}
