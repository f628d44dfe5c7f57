//! Shared protocol logic for both the daemon and the client
//!
//! Frame header encoding, payload bounds, path confinement under the
//! daemon root and the small text conventions (elapsed-time footer, content
//! ending at the first zero byte) that every reply follows.

use anyhow::{anyhow, bail, Result};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE};

/// Normalize a path to be safely under a root directory.
/// This prevents path traversal by:
/// 1. Rejecting absolute paths, parent directory components, and root/prefix components
/// 2. Rejecting NUL bytes in path
/// 3. Canonicalizing the final path to resolve symlinks
/// 4. Ensuring the result is under the (canonical) root
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let path_str = p.to_string_lossy();
    if path_str.contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let root = root
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize root {:?}: {}", root, e))?;
    let joined = root.join(&safe);

    // Existing paths resolve symlinks; new files resolve their parent
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else if let Some(parent) = joined.parent() {
        if parent.exists() {
            let canonical_parent = parent
                .canonicalize()
                .map_err(|e| anyhow!("failed to canonicalize parent {:?}: {}", parent, e))?;
            match joined.file_name() {
                Some(filename) => canonical_parent.join(filename),
                None => canonical_parent,
            }
        } else {
            joined
        }
    } else {
        joined
    };

    if !final_path.starts_with(&root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }

    Ok(final_path)
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build frame header (9 bytes)
/// Format: MAGIC (4) | KIND (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4] = frame_type;
    header[5..9].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }
    let frame_type = header[4];
    let payload_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
    Ok((frame_type, payload_len))
}

/// Length of the content carried by a zero-terminated buffer: the lesser of
/// the buffer length and the position of the first zero byte.
pub fn content_end(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == 0).unwrap_or(buf.len())
}

/// Content of a zero-terminated buffer as (lossy) text.
pub fn content_text(buf: &[u8]) -> String {
    String::from_utf8_lossy(&buf[..content_end(buf)]).into_owned()
}

/// Append the elapsed-time footer every command reply ends with.
pub fn with_elapsed(mut body: Vec<u8>, elapsed: Duration) -> Vec<u8> {
    body.extend_from_slice(format!("\n\nTook: {}ms\n", elapsed.as_millis()).as_bytes());
    body
}

/// Create a program directory if it is missing. On unix the mode is 0755.
pub fn ensure_program_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder
        .create(path)
        .map_err(|e| anyhow!("failed to create directory {:?}: {}", path, e))
}
