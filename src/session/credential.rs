//! Persisted device credential.
//!
//! One opaque blob in `~/.wabridge/credential`, owner read/write only.
//! Writes go through a sibling temp file and a rename so a crash never
//! leaves a truncated credential behind.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::network::Credential;

/// Errors from credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Filesystem operation failed.
    #[error("credential file {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is readable by group or others.
    #[error("credential file {} must be 0600, found {mode:o}", path.display())]
    Permissions {
        /// File involved.
        path: PathBuf,
        /// Observed permission bits.
        mode: u32,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CredentialError + '_ {
    move |source| CredentialError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Owner of the credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if a credential file is present.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the credential. A missing or empty file means "not paired".
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its permissions are
    /// broader than owner read/write.
    pub fn load(&self) -> Result<Option<Credential>, CredentialError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&self.path)(e)),
        };
        validate_private_permissions(&self.path)?;
        if bytes.is_empty() {
            debug!(path = %self.path.display(), "credential file is empty");
            return Ok(None);
        }
        Ok(Some(Credential::new(bytes)))
    }

    /// Atomically replace the stored credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = open_private(&tmp).map_err(io_err(&tmp))?;
            file.write_all(credential.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(io_err(&tmp))?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err(&self.path))?;
        info!(path = %self.path.display(), "credential saved");
        Ok(())
    }

    /// Delete the credential. Returns `true` if a file was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn wipe(&self) -> Result<bool, CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "credential wiped");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&self.path)(e)),
        }
    }

    /// [`load`](Self::load) on the blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub async fn load_async(&self) -> Result<Option<Credential>, CredentialError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| io_err(&self.path)(std::io::Error::other(e)))?
    }

    /// [`save`](Self::save) on the blocking pool, so a slow disk does not
    /// stall the calling task.
    ///
    /// # Errors
    ///
    /// Same as [`save`](Self::save).
    pub async fn save_async(&self, credential: Credential) -> Result<(), CredentialError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&credential))
            .await
            .map_err(|e| io_err(&self.path)(std::io::Error::other(e)))?
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its bits.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> Result<(), CredentialError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(io_err(path))?;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CredentialError::Permissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> Result<(), CredentialError> {
    Ok(())
}
