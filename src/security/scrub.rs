//! Overwrite-then-delete for files that held secret material.
//!
//! [`scrub_file`] replaces every byte of a file with output from the
//! thread-local CSPRNG and syncs it to disk. [`scrub_and_remove`] is the
//! best-effort teardown wrapper: it logs failures and always attempts the
//! removal, because a stuck cleanup path is worse than an unscrubbed file.

use rand::RngExt;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Overwrite buffer size; large files are scrubbed in chunks of this many bytes.
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ScrubError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to scrub {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ScrubError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ScrubError::NotFound(path.to_path_buf())
        } else {
            ScrubError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Overwrite `path` in place with random bytes of the same length.
///
/// Zero-length files succeed without being opened for writing. The file is
/// left in place; see [`scrub_and_remove`].
pub fn scrub_file(path: &Path) -> Result<(), ScrubError> {
    let metadata = fs::metadata(path).map_err(|e| ScrubError::from_io(path, e))?;
    let size = metadata.len();
    if size == 0 {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| ScrubError::from_io(path, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ScrubError::from_io(path, e))?;

    let mut rng = rand::rng();
    let mut buf = vec![0u8; CHUNK_SIZE.min(size as usize)];
    let mut remaining = size;
    while remaining > 0 {
        let n = buf.len().min(remaining as usize);
        rng.fill(&mut buf[..n]);
        file.write_all(&buf[..n])
            .map_err(|e| ScrubError::from_io(path, e))?;
        remaining -= n as u64;
    }

    file.sync_all().map_err(|e| ScrubError::from_io(path, e))?;
    Ok(())
}

/// Scrub then remove `path`. Never fails; problems are logged.
pub fn scrub_and_remove(path: &Path) {
    if let Err(e) = scrub_file(path) {
        tracing::warn!("Failed to scrub file before removal: {}", e);
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("Scrubbed file already absent: {}", path.display());
        }
        Err(e) => {
            tracing::warn!(
                "Failed to remove file after scrubbing: {}: {}",
                path.display(),
                e
            );
        }
    }
}
