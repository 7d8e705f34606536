use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use common::api::AppliedIntent;
use tempfile::NamedTempFile;
use thiserror::Error;

pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const ROUTING_FILE: &str = "caddy.json";
pub const APPLIED_FILE: &str = "applied-intent.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to promote staged file to {}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
    #[error("applied-intent record at {} is corrupt", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode applied-intent record")]
    Encode(#[source] serde_json::Error),
}

/// Files under the data directory. Every write goes to a temp file in the same
/// directory and is renamed over the target, so readers see old or new, never partial.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

/// A written temp file waiting to be promoted over its target.
#[derive(Debug)]
pub struct StagedFile {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    pub fn promote(self) -> Result<(), StoreError> {
        self.tmp
            .persist(&self.target)
            .map(|_| ())
            .map_err(|source| StoreError::Persist {
                path: self.target,
                source,
            })
    }

    /// Removes the temp file; the target is left as it was.
    pub fn discard(self) -> io::Result<()> {
        self.tmp.close()
    }
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn compose_path(&self) -> PathBuf {
        self.dir.join(COMPOSE_FILE)
    }

    pub fn routing_path(&self) -> PathBuf {
        self.dir.join(ROUTING_FILE)
    }

    pub fn applied_path(&self) -> PathBuf {
        self.dir.join(APPLIED_FILE)
    }

    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Write {
            path: self.dir.clone(),
            source,
        })
    }

    pub fn read_compose(&self) -> Result<Option<String>, StoreError> {
        read_optional(&self.compose_path())
    }

    pub fn read_routing(&self) -> Result<Option<String>, StoreError> {
        read_optional(&self.routing_path())
    }

    pub fn load_applied(&self) -> Result<Option<AppliedIntent>, StoreError> {
        let path = self.applied_path();
        let Some(raw) = read_optional(&path)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Decode { path, source })
    }

    /// Writes the compose manifest next to its final location without replacing it.
    pub fn stage_compose(&self, contents: &str) -> Result<StagedFile, StoreError> {
        self.stage(&self.compose_path(), contents, ".yml")
    }

    pub fn write_routing(&self, contents: &str) -> Result<(), StoreError> {
        self.stage(&self.routing_path(), contents, ".json")?
            .promote()
    }

    pub fn save_applied(&self, applied: &AppliedIntent) -> Result<(), StoreError> {
        let rendered = serde_json::to_string_pretty(applied).map_err(StoreError::Encode)?;
        self.stage(&self.applied_path(), &rendered, ".json")?
            .promote()
    }

    fn stage(&self, target: &Path, contents: &str, suffix: &str) -> Result<StagedFile, StoreError> {
        self.ensure_dir()?;
        let write_err = |source| StoreError::Write {
            path: target.to_path_buf(),
            source,
        };
        let prefix = format!(
            ".{}.",
            target
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("staged")
        );
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(suffix)
            .tempfile_in(&self.dir)
            .map_err(write_err)?;
        set_private_file_perms(tmp.path()).map_err(write_err)?;
        tmp.write_all(contents.as_bytes()).map_err(write_err)?;
        tmp.flush().map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        Ok(StagedFile {
            tmp,
            target: target.to_path_buf(),
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn set_private_file_perms(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
