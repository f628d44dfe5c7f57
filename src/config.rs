//! Tunables shared by daemon and client, loadable from a TOML file.
//!
//! Precedence: command-line flag, then config file, then built-in default.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::protocol::{FILE_BLOCK_SIZE, MAX_FRAME_SIZE, PAGE_LINES, REPLY_LIMIT};

// Room left in a frame for the elapsed-time footer
const FOOTER_SLACK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Capacity of one FileBlock; longer files are cut at this size.
    pub file_block_size: usize,
    /// Cap on captured command output per reply.
    pub reply_limit: usize,
    /// Compiler invoked by `run` when a program is stale.
    pub compiler: String,
    /// Extension (without dot) of the files that make up a program.
    pub source_ext: String,
    /// Lines shown by the client's `get` pager before it pauses.
    pub page_lines: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            file_block_size: FILE_BLOCK_SIZE,
            reply_limit: REPLY_LIMIT,
            compiler: "cc".to_string(),
            source_ext: "c".to_string(),
            page_lines: PAGE_LINES,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let settings: Settings =
            toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_block_size == 0 || self.file_block_size + FOOTER_SLACK > MAX_FRAME_SIZE {
            bail!(
                "file_block_size must be between 1 and {} bytes",
                MAX_FRAME_SIZE - FOOTER_SLACK
            );
        }
        if self.reply_limit == 0 || self.reply_limit + FOOTER_SLACK > MAX_FRAME_SIZE {
            bail!(
                "reply_limit must be between 1 and {} bytes",
                MAX_FRAME_SIZE - FOOTER_SLACK
            );
        }
        if self.page_lines == 0 {
            bail!("page_lines must be at least 1");
        }
        if self.compiler.trim().is_empty() {
            bail!("compiler must not be empty");
        }
        if self.source_ext.is_empty() || self.source_ext.contains(['.', '/']) {
            bail!("source_ext must be a bare extension such as \"c\"");
        }
        Ok(())
    }
}

/// Everything the daemon needs to serve connections.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Canonical directory under which all program directories live.
    pub root: PathBuf,
    pub settings: Settings,
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(bind: impl Into<String>, root: &Path, settings: Settings) -> Result<Self> {
        if !root.exists() {
            bail!("Root directory does not exist: {}", root.display());
        }
        if !root.is_dir() {
            bail!("Root path is not a directory: {}", root.display());
        }
        settings.validate()?;
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Failed to canonicalize root path: {}", root.display()))?;
        Ok(Self {
            bind: bind.into(),
            root,
            settings,
            log_file: None,
        })
    }
}

/// Everything the client needs besides the server address.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory `put` reads from and `run -f` writes into.
    pub local_root: PathBuf,
    pub settings: Settings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("."),
            settings: Settings::default(),
        }
    }
}
