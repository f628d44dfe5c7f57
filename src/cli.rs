//! Shared CLI helpers and small reusable Clap fragments

use anyhow::Result;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig, Settings};
use crate::protocol::DEFAULT_PORT;

/// Options of the remexecd daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "remexec daemon: file transfer, listing and build-and-run over TCP")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Root directory holding the program directories
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// TOML file with block size, reply limit, compiler and paging settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append an audit line per session event to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// FileBlock capacity in bytes (overrides the config file)
    #[arg(long = "file-block-size")]
    pub file_block_size: Option<usize>,

    /// Cap on captured command output per reply (overrides the config file)
    #[arg(long = "reply-limit")]
    pub reply_limit: Option<usize>,

    /// Compiler command used by `run` (overrides the config file)
    #[arg(long)]
    pub compiler: Option<String>,

    /// Source file extension, without the dot (overrides the config file)
    #[arg(long = "source-ext")]
    pub source_ext: Option<String>,

    /// Debug-level diagnostics (RUST_LOG still wins)
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl DaemonOpts {
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(size) = self.file_block_size {
            settings.file_block_size = size;
        }
        if let Some(limit) = self.reply_limit {
            settings.reply_limit = limit;
        }
        if let Some(compiler) = &self.compiler {
            settings.compiler = compiler.clone();
        }
        if let Some(ext) = &self.source_ext {
            settings.source_ext = ext.clone();
        }
        let mut config = ServerConfig::new(self.bind.clone(), &self.root, settings)?;
        config.log_file = self.log_file.clone();
        Ok(config)
    }
}

/// Options of the interactive remexec client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Interactive client for a remexec daemon")]
pub struct ClientOpts {
    /// Server host name or address
    pub server: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory `put` reads from and `run -f` saves into
    #[arg(long = "local-root", default_value = ".")]
    pub local_root: PathBuf,

    /// TOML file with block size and paging settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// FileBlock capacity in bytes; must match the daemon's (overrides the config file)
    #[arg(long = "file-block-size")]
    pub file_block_size: Option<usize>,

    /// Lines shown by the `get` pager before it pauses (overrides the config file)
    #[arg(long = "page-lines")]
    pub page_lines: Option<usize>,

    /// Debug-level diagnostics (RUST_LOG still wins)
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl ClientOpts {
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut settings = Settings::load(self.config.as_deref())?;
        if let Some(size) = self.file_block_size {
            settings.file_block_size = size;
        }
        if let Some(lines) = self.page_lines {
            settings.page_lines = lines;
        }
        settings.validate()?;
        Ok(ClientConfig {
            local_root: self.local_root.clone(),
            settings,
        })
    }
}

/// Install the fmt subscriber once per process.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
