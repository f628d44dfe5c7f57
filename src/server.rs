//! The remexec daemon: accept loop, per-connection sessions, command dispatch.

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::build_cache::{Builder, RunRequest};
use crate::command::{Command, Verb};
use crate::config::ServerConfig;
use crate::exec;
use crate::logger::{AuditLog, NoopLog, TextLog};
use crate::outbox::{Outbox, ReplySlot};
use crate::transfer::{self, TransferContext, TransferRequest};
use crate::transport::{FrameKind, FrameReader, FrameWriter};

/// State shared by every connection of one daemon.
pub struct ServerContext {
    pub config: ServerConfig,
    builder: Builder,
    audit: Arc<dyn AuditLog>,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let audit: Arc<dyn AuditLog> = match &config.log_file {
            Some(path) => Arc::new(TextLog::new(path)?),
            None => Arc::new(NoopLog),
        };
        Ok(Self::with_audit(config, audit))
    }

    pub fn with_audit(config: ServerConfig, audit: Arc<dyn AuditLog>) -> Self {
        let builder = Builder::new(&config.root, &config.settings);
        Self {
            config,
            builder,
            audit,
        }
    }

    fn transfer(&self) -> TransferContext<'_> {
        TransferContext {
            root: &self.config.root,
            block_size: self.config.settings.file_block_size,
            audit: self.audit.as_ref(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    pub fn new(listener: TcpListener, ctx: ServerContext) -> Self {
        Self {
            listener,
            ctx: Arc::new(ctx),
        }
    }

    /// Bind `config.bind` and prepare the shared context.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        Ok(Self::new(listener, ServerContext::new(config)?))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then abort every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, ctx } = self;
        let mut sessions: JoinSet<()> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(active = sessions.len(), "daemon shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        sessions.spawn(async move {
                            if let Err(err) = handle_connection(stream, peer, ctx).await {
                                warn!(%peer, error = %format!("{err:#}"), "connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = done {
                        if err.is_panic() {
                            warn!(error = %err, "connection task panicked");
                        }
                    }
                }
            }
        }

        sessions.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Serve one client until it quits or disconnects.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<()> {
    let session = Uuid::new_v4();
    let span = info_span!("session", %peer, id = %session);
    async move {
        let _ = stream.set_nodelay(true);
        let peer_name = peer.to_string();
        info!("connection opened");
        ctx.audit.session_opened(&peer_name);

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let (outbox, writer) = Outbox::spawn(FrameWriter::new(write_half));
        let mut workers: JoinSet<()> = JoinSet::new();

        let result = serve_requests(&ctx, &peer_name, &mut reader, &outbox, &mut workers).await;

        // Running commands are never cancelled; their replies still go out
        while let Some(done) = workers.join_next().await {
            log_worker_exit(done);
        }
        drop(outbox);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %format!("{err:#}"), "reply writer stopped"),
            Err(err) => warn!(error = %err, "reply writer task failed"),
        }

        ctx.audit.session_closed(&peer_name);
        info!("connection closed");
        result
    }
    .instrument(span)
    .await
}

async fn serve_requests(
    ctx: &Arc<ServerContext>,
    peer: &str,
    reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
    outbox: &Outbox,
    workers: &mut JoinSet<()>,
) -> Result<()> {
    loop {
        while let Some(done) = workers.try_join_next() {
            log_worker_exit(done);
        }

        let Some(frame) = reader.read_frame().await? else {
            debug!("peer closed the connection");
            return Ok(());
        };
        if frame.kind != FrameKind::Request {
            bail!("expected REQUEST frame, got {}", frame.kind);
        }

        // Every request owns a reply slot, even one that yields no text
        let slot = outbox.slot();
        let line = frame.text();
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        ctx.audit.command(peer, &command.line);
        debug!(line = %command.line, "request");

        if let Err(message) = command.validate() {
            slot.reply(message);
            continue;
        }

        match command.verb {
            Verb::Quit => {
                info!("client quit");
                return Ok(());
            }
            Verb::Put => match TransferRequest::parse(&command) {
                Ok(request) => {
                    transfer::receive_put(&ctx.transfer(), &request, reader, &slot).await?;
                }
                Err(message) => slot.reply(message),
            },
            _ => {
                let ctx = Arc::clone(ctx);
                workers.spawn(
                    async move {
                        dispatch(&ctx, command, slot).await;
                    }
                    .in_current_span(),
                );
            }
        }
    }
}

/// Run one fire-and-forget command and deliver its reply.
async fn dispatch(ctx: &ServerContext, command: Command, slot: ReplySlot) {
    let start = Instant::now();
    let reply = match command.verb {
        Verb::Get => match TransferRequest::parse(&command) {
            Ok(request) => transfer::serve_get(&ctx.transfer(), &request).await,
            Err(message) => message.into_bytes(),
        },
        Verb::List => exec::list(&ctx.config.root, &command, ctx.config.settings.reply_limit).await,
        Verb::Sys => exec::sys().await,
        Verb::Run => match RunRequest::parse(&command) {
            Ok(request) => {
                let outcome = ctx.builder.run(&request).await;
                ctx.audit
                    .build(&outcome.dir, outcome.rebuilt, start.elapsed().as_millis());
                outcome.reply
            }
            Err(message) => message.into_bytes(),
        },
        // Sequential and unknown verbs never reach a worker
        Verb::Quit | Verb::Put | Verb::Unknown(_) => return,
    };
    debug!(verb = %command.verb, bytes = reply.len(), millis = start.elapsed().as_millis() as u64, "command finished");
    slot.reply(reply);
}

fn log_worker_exit(done: Result<(), tokio::task::JoinError>) {
    if let Err(err) = done {
        warn!(error = %err, "command task failed");
    }
}
