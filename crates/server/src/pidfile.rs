//! PID file maintenance.
//!
//! The file always names the generation currently serving, so it is
//! rewritten whenever a generation becomes ready and restored by the
//! predecessor when an upgrade fails.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

/// Atomically write `pid` to `path`
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut file = NamedTempFile::new_in(&dir)?;
    writeln!(file, "{}", pid)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), pid = pid, "Wrote PID file");
    Ok(())
}

/// Read a PID file; `None` if missing or unparsable
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
