//! File transfer engine: `put` and `get`, daemon side.
//!
//! `put` is a multi-message exchange driven by the client:
//!
//! ```text
//! client                                   daemon
//!   REQUEST "put dir a b [-f]"   ------>
//!                                <------   REPLY "ok. should get 2 files ..."
//!                                <------   REPLY "ok" | "File/s ... exist ..."
//!   BLOCK a, BLOCK b (only on ok) ----->
//!                                <------   REPLY final status
//!                                <------   DONE
//! ```
//!
//! `get` is a single reply carrying at most one FileBlock worth of content.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::block::FileBlock;
use crate::command::{Command, Verb};
use crate::logger::AuditLog;
use crate::outbox::ReplySlot;
use crate::protocol::timeouts::block_deadline_ms;
use crate::protocol_core::{ensure_program_dir, normalize_under_root, with_elapsed};
use crate::transport::{FrameKind, FrameReader};

pub const OVERRIDE_FLAG: &str = "-f";
pub const NOT_FOUND: &str = "File does not exist\n";
pub const IS_DIRECTORY: &str = "Can't send directories\n";
pub const READ_FAILED: &str = "Error reading file!\n";
pub const WRITE_FAILED: &str = "unable to write one or more of the files!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerb {
    Put,
    Get,
}

/// A parsed `put` or `get` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub verb: TransferVerb,
    pub dir: String,
    pub files: Vec<String>,
    pub overwrite: bool,
}

impl TransferRequest {
    /// Derive the file list from the tokens: everything after the directory,
    /// minus a trailing override flag.
    pub fn parse(command: &Command) -> Result<Self, String> {
        let verb = match command.verb {
            Verb::Put => TransferVerb::Put,
            Verb::Get => TransferVerb::Get,
            _ => return Err(format!("{} is not a transfer\n", command.verb)),
        };
        let Some((dir, rest)) = command.args.split_first() else {
            return Err(format!("{}: missing directory name\n", command.verb));
        };
        if dir == OVERRIDE_FLAG {
            return Err(format!("{}: missing directory name\n", command.verb));
        }
        let (files, overwrite) = match rest.split_last() {
            Some((last, files)) if last == OVERRIDE_FLAG && verb == TransferVerb::Put => (files, true),
            _ => (rest, false),
        };
        if verb == TransferVerb::Put && files.iter().any(|f| f == OVERRIDE_FLAG) {
            return Err("put: -f must be the last argument\n".to_string());
        }
        if verb == TransferVerb::Get && files.len() != 1 {
            return Err("get takes 3 arguments\n".to_string());
        }
        Ok(Self {
            verb,
            dir: dir.clone(),
            files: files.to_vec(),
            overwrite,
        })
    }

    pub fn expected_files(&self) -> usize {
        self.files.len()
    }
}

/// Parameters the daemon side of a transfer needs.
pub struct TransferContext<'a> {
    pub root: &'a Path,
    pub block_size: usize,
    pub audit: &'a dyn AuditLog,
}

/// Daemon side of `put`. Validation failures are replies; only transport
/// failures are errors, and they end the connection.
pub async fn receive_put<R>(
    ctx: &TransferContext<'_>,
    request: &TransferRequest,
    reader: &mut FrameReader<R>,
    slot: &ReplySlot,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let start = Instant::now();
    let expected = request.expected_files();
    slot.reply(format!(
        "ok. should get {} files and put them in {}, -f:{}\n",
        expected,
        request.dir,
        u8::from(request.overwrite)
    ));

    let targets = match prepare_destination(ctx.root, request) {
        Ok(targets) => targets,
        Err(message) => {
            slot.reply(message);
            return Ok(());
        }
    };

    let conflicts: Vec<&str> = request
        .files
        .iter()
        .zip(&targets)
        .filter(|(_, target)| target.exists())
        .map(|(name, _)| name.as_str())
        .collect();
    if !conflicts.is_empty() && !request.overwrite {
        info!(dir = %request.dir, ?conflicts, "put refused, files exist");
        let mut message = String::from("File/s ");
        for name in &conflicts {
            message.push_str(name);
            message.push(' ');
        }
        message.push_str(&format!(
            "exist in {} on server. Use -f to override.",
            request.dir
        ));
        slot.reply(message);
        return Ok(());
    }
    // The client sends blocks only after it sees the verdict, and the verdict
    // may wait behind replies to earlier, still running commands.
    if slot.reply_flushed("ok").await.is_err() {
        bail!("connection writer stopped before the put verdict went out");
    }

    // Every expected block is drained even after a failed write, so the
    // stream stays aligned on frame boundaries.
    let mut failed = false;
    for (name, target) in request.files.iter().zip(&targets) {
        let frame = match reader.read_frame_timed(block_deadline_ms(ctx.block_size)).await? {
            Some(frame) => frame,
            None => bail!("connection closed during put of {}", name),
        };
        if frame.kind != FrameKind::Block {
            bail!("expected BLOCK frame for {}, got {}", name, frame.kind);
        }
        let block = FileBlock::from_wire(frame.payload, ctx.block_size);
        debug!(file = %name, bytes = block.content().len(), "writing");
        match tokio::fs::write(target, block.content()).await {
            Ok(()) => ctx.audit.file_written(target, block.content().len() as u64),
            Err(e) => {
                warn!(path = %target.display(), error = %e, "put write failed");
                ctx.audit.error("put", target, &e.to_string());
                failed = true;
            }
        }
    }

    if failed {
        slot.reply(WRITE_FAILED);
    } else {
        slot.reply(with_elapsed(
            b"File/s sent successfully!".to_vec(),
            start.elapsed(),
        ));
    }
    Ok(())
}

/// Resolve (and create) the destination directory and every target path.
fn prepare_destination(root: &Path, request: &TransferRequest) -> Result<Vec<PathBuf>, String> {
    let dir = normalize_under_root(root, Path::new(&request.dir))
        .map_err(|e| format!("Invalid directory {}: {:#}\n", request.dir, e))?;
    ensure_program_dir(&dir).map_err(|e| format!("{:#}\n", e))?;
    request
        .files
        .iter()
        .map(|name| {
            normalize_under_root(&dir, Path::new(name))
                .map_err(|e| format!("Invalid file name {}: {:#}\n", name, e))
        })
        .collect()
}

/// Daemon side of `get`: the reply payload.
pub async fn serve_get(ctx: &TransferContext<'_>, request: &TransferRequest) -> Vec<u8> {
    let start = Instant::now();
    let Some(name) = request.files.first() else {
        return b"get takes 3 arguments\n".to_vec();
    };
    let relative = Path::new(&request.dir).join(name);
    let path = match normalize_under_root(ctx.root, &relative) {
        Ok(path) => path,
        Err(e) => {
            debug!(path = %relative.display(), error = %e, "get outside root");
            return NOT_FOUND.as_bytes().to_vec();
        }
    };
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(md) => md,
        Err(_) => return NOT_FOUND.as_bytes().to_vec(),
    };
    if metadata.is_dir() {
        return IS_DIRECTORY.as_bytes().to_vec();
    }
    if !metadata.is_file() {
        return NOT_FOUND.as_bytes().to_vec();
    }

    let mut content = Vec::with_capacity(ctx.block_size.min(metadata.len() as usize));
    let read = async {
        let file = tokio::fs::File::open(&path).await?;
        file.take(ctx.block_size as u64).read_to_end(&mut content).await
    };
    if let Err(e) = read.await {
        ctx.audit.error("get", &path, &e.to_string());
        return READ_FAILED.as_bytes().to_vec();
    }
    if metadata.len() > ctx.block_size as u64 {
        warn!(
            path = %path.display(),
            len = metadata.len(),
            limit = ctx.block_size,
            "get content cut at file block size"
        );
    }
    ctx.audit.file_sent(&path, content.len() as u64);
    with_elapsed(content, start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLog;
    use crate::transport::{Frame, FrameWriter};
    use std::fs;

    fn put(line: &str) -> Result<TransferRequest, String> {
        TransferRequest::parse(&Command::parse(line).unwrap())
    }

    #[test]
    fn file_count_excludes_verb_dir_and_flag() {
        let req = put("put prog a.c b.c").unwrap();
        assert_eq!(req.expected_files(), 2);
        assert!(!req.overwrite);

        let req = put("put prog a.c b.c -f").unwrap();
        assert_eq!(req.files, vec!["a.c", "b.c"]);
        assert!(req.overwrite);

        let req = put("put prog").unwrap();
        assert_eq!(req.expected_files(), 0);

        let req = put("put prog -f").unwrap();
        assert_eq!(req.expected_files(), 0);
        assert!(req.overwrite);
    }

    #[test]
    fn malformed_transfers_are_rejected() {
        assert!(put("put").is_err());
        assert!(put("put -f").is_err());
        assert!(put("put prog a.c -f b.c").is_err());
        assert!(put("get prog").is_err());
        assert!(put("get prog a b").is_err());
        // -f is only an override flag for put
        assert!(put("get prog -f").is_ok());
    }

    struct Harness {
        root: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
            }
        }

        fn root(&self) -> PathBuf {
            self.root.path().canonicalize().unwrap()
        }

        async fn put(&self, line: &str, blocks: Vec<Vec<u8>>, block_size: usize) -> Vec<String> {
            let root = self.root();
            let ctx = TransferContext {
                root: &root,
                block_size,
                audit: &NoopLog,
            };
            let request = put(line).unwrap();
            let (a, b) = tokio::io::duplex(1024 * 1024);
            let mut writer = FrameWriter::new(a);
            for block in blocks {
                writer.write_frame(&Frame::block(block)).await.unwrap();
            }
            let mut reader = FrameReader::new(b);
            let (slot, mut rx) = ReplySlot::detached();
            let collector = tokio::spawn(async move {
                let mut replies = Vec::new();
                while let Some(frame) = rx.recv().await {
                    replies.push(frame.text());
                }
                replies
            });
            receive_put(&ctx, &request, &mut reader, &slot).await.unwrap();
            drop(slot);
            collector.await.unwrap()
        }
    }

    #[tokio::test]
    async fn put_writes_content_up_to_first_zero() {
        let h = Harness::new();
        let replies = h
            .put(
                "put prog a.c b.c",
                vec![FileBlock::encode(b"alpha", 16).into_wire(), FileBlock::encode(b"beta", 16).into_wire()],
                16,
            )
            .await;

        assert_eq!(replies[0], "ok. should get 2 files and put them in prog, -f:0\n");
        assert_eq!(replies[1], "ok");
        assert!(replies[2].starts_with("File/s sent successfully!"));
        assert_eq!(fs::read(h.root().join("prog/a.c")).unwrap(), b"alpha");
        assert_eq!(fs::read(h.root().join("prog/b.c")).unwrap(), b"beta");
    }

    #[tokio::test]
    async fn put_conflict_without_override_changes_nothing() {
        let h = Harness::new();
        fs::create_dir(h.root().join("prog")).unwrap();
        fs::write(h.root().join("prog/a.c"), "original").unwrap();

        // A block is queued but must never be consumed
        let replies = h
            .put("put prog a.c b.c", vec![FileBlock::encode(b"new", 16).into_wire()], 16)
            .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1], "File/s a.c exist in prog on server. Use -f to override.");
        assert_eq!(fs::read(h.root().join("prog/a.c")).unwrap(), b"original");
        assert!(!h.root().join("prog/b.c").exists());
    }

    #[tokio::test]
    async fn put_override_replaces_existing() {
        let h = Harness::new();
        fs::create_dir(h.root().join("prog")).unwrap();
        fs::write(h.root().join("prog/a.c"), "original").unwrap();

        let replies = h
            .put("put prog a.c -f", vec![FileBlock::encode(b"new", 16).into_wire()], 16)
            .await;

        assert_eq!(replies[0], "ok. should get 1 files and put them in prog, -f:1\n");
        assert_eq!(replies[1], "ok");
        assert_eq!(fs::read(h.root().join("prog/a.c")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn put_of_zero_files_is_a_no_op_success() {
        let h = Harness::new();
        let replies = h.put("put prog", Vec::new(), 16).await;
        assert_eq!(replies[1], "ok");
        assert!(replies[2].starts_with("File/s sent successfully!"));
        assert!(h.root().join("prog").is_dir());
    }

    #[tokio::test]
    async fn put_keeps_draining_after_a_failed_write() {
        let h = Harness::new();
        // The subdirectory does not exist, so the first write fails
        let replies = h
            .put(
                "put prog missing/a.c b.c",
                vec![FileBlock::encode(b"one", 16).into_wire(), FileBlock::encode(b"two", 16).into_wire()],
                16,
            )
            .await;

        assert_eq!(replies.last().unwrap(), WRITE_FAILED);
        assert_eq!(fs::read(h.root().join("prog/b.c")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn put_refuses_traversal_before_any_block() {
        let h = Harness::new();
        let replies = h.put("put prog ../evil.c", Vec::new(), 16).await;
        assert_eq!(replies.len(), 2);
        assert!(replies[1].starts_with("Invalid file name ../evil.c"));
    }

    async fn get(h: &Harness, line: &str, block_size: usize) -> Vec<u8> {
        let root = h.root();
        let ctx = TransferContext {
            root: &root,
            block_size,
            audit: &NoopLog,
        };
        serve_get(&ctx, &put(line).unwrap()).await
    }

    #[tokio::test]
    async fn get_distinguishes_missing_and_directories() {
        let h = Harness::new();
        fs::create_dir_all(h.root().join("prog/sub")).unwrap();

        assert_eq!(get(&h, "get prog nope.c", 64).await, NOT_FOUND.as_bytes());
        assert_eq!(get(&h, "get prog sub", 64).await, IS_DIRECTORY.as_bytes());
        assert_eq!(get(&h, "get .. x", 64).await, NOT_FOUND.as_bytes());
    }

    #[tokio::test]
    async fn get_caps_content_and_appends_footer() {
        let h = Harness::new();
        fs::create_dir(h.root().join("prog")).unwrap();
        fs::write(h.root().join("prog/big.txt"), vec![b'x'; 100]).unwrap();

        let reply = get(&h, "get prog big.txt", 64).await;
        assert_eq!(&reply[..64], &[b'x'; 64][..]);
        assert!(String::from_utf8_lossy(&reply[64..]).starts_with("\n\nTook: "));
    }
}
