//! File audit device.
//!
//! Writes entries as JSON lines (one JSON object per line). Each line is
//! written with a single `write_all` while holding the file lock, so
//! concurrent writers never interleave.

use std::fs::{File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::{Arc, Mutex};

use nix::unistd::{getegid, geteuid};
use tracing::{debug, info, warn};

use crate::error::DeviceErrorKind;
use crate::mount::{FileOptions, FileTarget};

/// Append-only file sink.
#[derive(Debug)]
pub struct FileDevice {
    target: FileTarget,
    mode: Option<u32>,
    fsync: bool,
    /// `None` for stdout and discard targets.
    file: Arc<Mutex<Option<File>>>,
}

impl FileDevice {
    /// Open the sink, creating the file and its parent directory if needed.
    pub fn open(options: &FileOptions) -> std::io::Result<Self> {
        let file = match &options.target {
            FileTarget::Path(path) => Some(open_log(path, options.mode)?),
            FileTarget::Stdout | FileTarget::Discard => None,
        };

        Ok(Self {
            target: options.target.clone(),
            mode: options.mode,
            fsync: options.fsync,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path of the log file, if writing to one.
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            FileTarget::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Append one line.
    ///
    /// The write runs on the blocking pool and always completes once
    /// started, even if the caller stops waiting for it.
    pub async fn log(&self, payload: Vec<u8>) -> Result<(), DeviceErrorKind> {
        if self.target == FileTarget::Discard {
            return Ok(());
        }

        let file = Arc::clone(&self.file);
        let stdout = self.target == FileTarget::Stdout;
        let fsync = self.fsync;

        tokio::task::spawn_blocking(move || {
            let mut line = payload;
            line.push(b'\n');

            if stdout {
                let mut out = std::io::stdout().lock();
                out.write_all(&line)?;
                return out.flush();
            }

            let mut guard = file.lock().unwrap_or_else(|e| e.into_inner());
            let file = guard
                .as_mut()
                .ok_or_else(|| std::io::Error::other("audit log file is not open"))?;
            file.write_all(&line)?;
            if fsync {
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| DeviceErrorKind::Io {
            message: format!("write task failed: {}", e),
        })?
        .map_err(DeviceErrorKind::from)
    }

    /// Close and reopen the file, picking up a rotated path.
    pub fn reopen(&self) -> std::io::Result<()> {
        let FileTarget::Path(path) = &self.target else {
            return Ok(());
        };

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        // Drop the old handle before opening so a failed reopen leaves the
        // device closed rather than writing into a rotated-away file.
        *guard = None;
        *guard = Some(open_log(path, self.mode)?);

        info!(path = %path.display(), "Audit log reopened");
        Ok(())
    }
}

fn open_log(path: &Path, mode: Option<u32>) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!(path = %parent.display(), "Creating audit log directory");
            std::fs::create_dir_all(parent)?;
        }
    }

    if let Ok(meta) = std::fs::metadata(path) {
        warn_foreign_owner(path, &meta);
    }

    let mut open = OpenOptions::new();
    open.create(true).append(true);
    if let Some(mode) = mode {
        open.mode(mode);
    }
    let file = open.open(path)?;

    if let Some(mode) = mode {
        std::fs::set_permissions(path, Permissions::from_mode(mode))?;
    }

    debug!(path = %path.display(), "Audit log opened");
    Ok(file)
}

fn warn_foreign_owner(path: &Path, meta: &std::fs::Metadata) {
    let uid = geteuid().as_raw();
    let gid = getegid().as_raw();
    if meta.uid() != uid || meta.gid() != gid {
        warn!(
            path = %path.display(),
            file_uid = meta.uid(),
            file_gid = meta.gid(),
            process_uid = uid,
            process_gid = gid,
            "Audit log file is owned by a different user or group"
        );
    }
}
