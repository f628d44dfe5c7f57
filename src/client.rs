//! Client side of a remexec session.
//!
//! One TCP connection carries every request of the interactive loop. A reader
//! task routes incoming frames to whoever is waiting: the daemon answers in
//! request order and closes each answer with DONE, so the waiter at the front
//! of a FIFO always owns the next reply.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::block::FileBlock;
use crate::build_cache::RunRequest;
use crate::command::Command;
use crate::config::ClientConfig;
use crate::progress::UploadProgress;
use crate::protocol::timeouts::CONNECT_MS;
use crate::protocol_core::content_end;
use crate::transfer::TransferRequest;
use crate::transport::{Frame, FrameKind, FrameReader, FrameWriter};

#[derive(Default)]
struct Pending {
    waiters: VecDeque<mpsc::UnboundedSender<Frame>>,
    closed: bool,
}

/// FIFO of requests still waiting for their DONE.
#[derive(Default)]
struct ReplyRouter {
    inner: Mutex<Pending>,
}

impl ReplyRouter {
    fn register(&self) -> Result<ReplyStream> {
        let mut pending = self.inner.lock();
        if pending.closed {
            bail!("connection to server is closed");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        pending.waiters.push_back(tx);
        Ok(ReplyStream { rx, finished: false })
    }

    fn route(&self, frame: Frame) {
        let mut pending = self.inner.lock();
        let waiter = match frame.kind {
            FrameKind::Done => pending.waiters.pop_front(),
            _ => pending.waiters.front().cloned(),
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => warn!(kind = %frame.kind, "frame with no pending request"),
        }
    }

    fn close(&self) {
        let mut pending = self.inner.lock();
        pending.closed = true;
        pending.waiters.clear();
    }
}

/// The replies to one request, ending at its DONE.
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<Frame>,
    finished: bool,
}

impl ReplyStream {
    /// Next reply payload, `None` once the request is complete.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(frame) if frame.kind == FrameKind::Done => {
                self.finished = true;
                Ok(None)
            }
            Some(frame) => Ok(Some(frame.payload)),
            None => bail!("connection closed before the reply was complete"),
        }
    }

    /// Next reply as text; a missing reply is an error.
    pub async fn next_text(&mut self) -> Result<String> {
        match self.next().await? {
            Some(payload) => Ok(String::from_utf8_lossy(&payload[..content_end(&payload)]).into_owned()),
            None => bail!("server ended the reply early"),
        }
    }

    /// All remaining replies, each cut at its first zero byte.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(payload) = self.next().await? {
            out.extend_from_slice(&payload[..content_end(&payload)]);
        }
        Ok(out)
    }
}

/// How a `put` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Refused locally; nothing was sent.
    NotSent(String),
    /// The daemon refused before any block was exchanged.
    Refused { info: String, verdict: String },
    /// Blocks were sent; `status` is the daemon's final word.
    Sent {
        info: String,
        status: String,
        /// Local files cut at the block capacity.
        truncated: Vec<String>,
    },
}

/// How a `run` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReply {
    Output(Vec<u8>),
    Saved(PathBuf),
    /// `-f` named a local file that already exists; nothing was sent.
    FileExists(PathBuf),
}

pub struct Client {
    writer: tokio::sync::Mutex<FrameWriter<OwnedWriteHalf>>,
    router: Arc<ReplyRouter>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
    peer: SocketAddr,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let stream = match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr)).await {
            Ok(res) => res.context("connect failed")?,
            Err(_) => bail!("connect timeout ({} ms)", CONNECT_MS),
        };
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().context("peer address")?;
        info!(%peer, "connected");

        let (read_half, write_half) = stream.into_split();
        let router = Arc::new(ReplyRouter::default());
        let reader = tokio::spawn(route_replies(FrameReader::new(read_half), Arc::clone(&router)));
        Ok(Self {
            writer: tokio::sync::Mutex::new(FrameWriter::new(write_half)),
            router,
            reader: Mutex::new(Some(reader)),
            config,
            peer,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send one request line; its replies arrive on the returned stream.
    pub async fn request(&self, line: &str) -> Result<ReplyStream> {
        let mut writer = self.writer.lock().await;
        // Register before sending so the reply can never outrun its waiter
        let stream = self.router.register()?;
        writer.write_frame(&Frame::request(line)).await?;
        Ok(stream)
    }

    /// Send a request and gather its whole reply.
    pub async fn call(&self, line: &str) -> Result<Vec<u8>> {
        self.request(line).await?.collect().await
    }

    /// Upload local files. Every source is read before the daemon is contacted.
    pub async fn put(&self, command: &Command) -> Result<PutOutcome> {
        let request = match TransferRequest::parse(command) {
            Ok(r) => r,
            Err(message) => return Ok(PutOutcome::NotSent(message)),
        };

        let capacity = self.config.settings.file_block_size;
        let mut blocks = Vec::with_capacity(request.files.len());
        let mut missing = Vec::new();
        for name in &request.files {
            let path = self.config.local_root.join(name);
            if !path.is_file() {
                missing.push(name.as_str());
                continue;
            }
            match FileBlock::read_file(&path, capacity).await {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    debug!(error = %format!("{err:#}"), "local read failed");
                    missing.push(name.as_str());
                }
            }
        }
        if !missing.is_empty() {
            return Ok(PutOutcome::NotSent(format!(
                "Can't read local file/s: {}\n",
                missing.join(" ")
            )));
        }

        // Blocks must follow the request with nothing interleaved
        let mut writer = self.writer.lock().await;
        let mut replies = self.router.register()?;
        writer.write_frame(&Frame::request(&command.line)).await?;
        let info = replies.next_text().await?;
        let verdict = replies.next_text().await?;
        if !verdict.starts_with('o') {
            drop(writer);
            replies.collect().await?;
            return Ok(PutOutcome::Refused { info, verdict });
        }

        let mut progress = UploadProgress::new(blocks.len() as u64);
        let mut truncated = Vec::new();
        for (name, block) in request.files.iter().zip(blocks) {
            progress.sending(name);
            if block.is_truncated() {
                warn!(file = %name, len = block.original_len(), capacity, "file cut at block capacity");
                progress.note(&format!(
                    "{} is {} bytes; only the first {} are sent",
                    name,
                    block.original_len(),
                    capacity
                ));
                truncated.push(name.clone());
            }
            let bytes = block.content().len() as u64;
            if let Err(err) = writer.write_frame(&Frame::block(block.into_wire())).await {
                progress.abandon("upload failed");
                return Err(err);
            }
            progress.sent(bytes);
        }
        progress.finish();
        drop(writer);

        let status = replies.next_text().await?;
        replies.collect().await?;
        Ok(PutOutcome::Sent {
            info,
            status,
            truncated,
        })
    }

    /// `run`, saving the output locally when `-f <name>` is present.
    pub async fn run(&self, command: &Command) -> Result<RunReply> {
        let local = match RunRequest::parse(command) {
            Ok(request) => request.local_path(&self.config.local_root),
            Err(message) => return Ok(RunReply::Output(message.into_bytes())),
        };
        if let Some(path) = &local {
            if path.exists() {
                return Ok(RunReply::FileExists(path.clone()));
            }
        }
        let output = self.call(&command.line).await?;
        match local {
            Some(path) => {
                tokio::fs::write(&path, &output)
                    .await
                    .with_context(|| format!("write {}", path.display()))?;
                Ok(RunReply::Saved(path))
            }
            None => Ok(RunReply::Output(output)),
        }
    }

    /// End the session: wait for the daemon to acknowledge, then close.
    pub async fn quit(&self) -> Result<()> {
        let replies = self.request("quit").await?;
        replies.collect().await?;
        self.writer.lock().await.shutdown().await;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        info!(peer = %self.peer, "session closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn route_replies(mut reader: FrameReader<OwnedReadHalf>, router: Arc<ReplyRouter>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => match frame.kind {
                FrameKind::Reply | FrameKind::Done => router.route(frame),
                other => {
                    warn!(kind = %other, "unexpected frame from server");
                    break;
                }
            },
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "connection lost");
                break;
            }
        }
    }
    router.close();
}
