//! Crash-safe file replacement
//!
//! Bytes are first written and fsynced to a uniquely named temp file next to
//! the target, then renamed over it. Readers only ever see the old file or the
//! new one. Temp files carry a leading dot and a `.tmp` suffix so they can be
//! told apart from records and swept after a crash.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TEMP_SUFFIX: &str = ".tmp";

/// Bytes staged next to their destination, not yet visible to readers
#[derive(Debug)]
pub struct StagedFile {
    tmp: PathBuf,
    target: PathBuf,
    installed: bool,
}

impl StagedFile {
    /// Write `bytes` to a fresh temp file beside `target` and flush it to disk
    pub fn stage(target: &Path, bytes: &[u8]) -> io::Result<Self> {
        let tmp = temp_path_for(target);
        let mut file = File::create(&tmp)?;
        let staged = Self {
            tmp,
            target: target.to_path_buf(),
            installed: false,
        };

        file.write_all(bytes)?;
        file.sync_all()?;

        Ok(staged)
    }

    /// Atomically move the staged bytes into place
    pub fn install(mut self) -> io::Result<()> {
        fs::rename(&self.tmp, &self.target)?;
        self.installed = true;
        sync_parent(&self.target);
        Ok(())
    }

    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.installed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Stage and install in one step
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    StagedFile::stage(target, bytes)?.install()
}

/// Remove temp files left behind by an interrupted write; returns how many
pub fn sweep_temp_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_temp_name(&name) && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

pub(crate) fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{name}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4().simple());
    target.with_file_name(tmp_name)
}

#[cfg(unix)]
fn sync_parent(target: &Path) {
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) {}
