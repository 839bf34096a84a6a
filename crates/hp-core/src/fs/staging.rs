use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempPath};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Staging directory does not exist: {0}")]
    NoStagingDir(PathBuf),
}

/// A rendered file waiting to be copied into place by a privileged command.
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `content` to a fresh file in `dir`.
///
/// Process: create temp file -> write -> fsync -> chmod. The live file is
/// never touched here, so an interrupted render leaves it intact.
pub fn stage(dir: &Path, name_hint: &str, content: &[u8], mode: u32) -> Result<StagedFile, StageError> {
    if !dir.is_dir() {
        return Err(StageError::NoStagingDir(dir.to_path_buf()));
    }

    let mut temp = Builder::new()
        .prefix(&format!(".hp-{}-", name_hint))
        .suffix(".tmp")
        .tempfile_in(dir)?;

    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;

    debug!(path = %temp.path().display(), bytes = content.len(), "Staged file");

    Ok(StagedFile {
        path: temp.into_temp_path(),
    })
}
