use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Audit trail of what the daemon did on behalf of its peers.
pub trait AuditLog: Send + Sync {
    fn session_opened(&self, _peer: &str) {}
    fn command(&self, _peer: &str, _line: &str) {}
    fn file_written(&self, _path: &Path, _bytes: u64) {}
    fn file_sent(&self, _path: &Path, _bytes: u64) {}
    fn build(&self, _dir: &Path, _rebuilt: bool, _millis: u128) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn session_closed(&self, _peer: &str) {}
}

pub struct NoopLog;
impl AuditLog for NoopLog {}

pub struct TextLog {
    file: Mutex<File>,
}

impl TextLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl AuditLog for TextLog {
    fn session_opened(&self, peer: &str) {
        self.line(&format!("OPEN peer={peer}"));
    }
    fn command(&self, peer: &str, line: &str) {
        self.line(&format!("CMD peer={peer} line={line:?}"));
    }
    fn file_written(&self, path: &Path, bytes: u64) {
        self.line(&format!("WRITE path={} bytes={}", path.display(), bytes));
    }
    fn file_sent(&self, path: &Path, bytes: u64) {
        self.line(&format!("SEND path={} bytes={}", path.display(), bytes));
    }
    fn build(&self, dir: &Path, rebuilt: bool, millis: u128) {
        self.line(&format!(
            "RUN dir={} rebuilt={} millis={}",
            dir.display(),
            rebuilt,
            millis
        ));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn session_closed(&self, peer: &str) {
        self.line(&format!("CLOSE peer={peer}"));
    }
}
