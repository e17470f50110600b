//! Durable storage for the credential bundle.
//!
//! Invariant: the bundle on disk is parseable or absent, never corrupt.
//! Saves go through a sibling temp file + fsync + rename, so a reader
//! racing a writer observes either the pre- or post-write bundle.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::{error::Error, models::TokenBundle};

/// Owner read/write only.
#[cfg(unix)]
const TOKEN_FILE_MODE: u32 = 0o600;
/// Owner-only state directory.
#[cfg(unix)]
const STATE_DIR_MODE: u32 = 0o700;

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the bundle. `Ok(None)` means "not registered yet"; a present
    /// but unparseable file is a [`Error::Parse`], never silently dropped.
    pub fn load(&self) -> Result<Option<TokenBundle>, Error> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound =>
                return Ok(None),
            Err(e) => {
                let ctx = format!("reading {}", self.path.display());
                return Err(Error::io(ctx, e));
            }
        };

        let bundle = serde_json::from_slice(&bytes).map_err(|e| {
            Error::parse(format!("token bundle {}", self.path.display()), e)
        })?;
        Ok(Some(bundle))
    }

    /// Atomically replace the bundle on disk.
    pub fn save(&self, bundle: &TokenBundle) -> Result<(), Error> {
        let parent = self.path.parent().ok_or_else(|| {
            Error::InvalidInput(format!(
                "token path {} has no parent directory",
                self.path.display()
            ))
        })?;
        create_private_dir(parent)?;

        let json = serde_json::to_vec_pretty(bundle)
            .expect("TokenBundle serialization is infallible");

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io("creating token temp file", e))?;
        temp.write_all(&json)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| Error::io("writing token temp file", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(TOKEN_FILE_MODE);
            temp.as_file()
                .set_permissions(perms)
                .map_err(|e| Error::io("chmod token temp file", e))?;
        }

        temp.persist(&self.path).map_err(|e| {
            Error::io(format!("renaming over {}", self.path.display()), e.error)
        })?;
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> Result<(), Error> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(STATE_DIR_MODE)
            .create(dir)
            .map_err(|e| {
                Error::io(format!("creating {}", dir.display()), e)
            })?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("creating {}", dir.display()), e))?;

    Ok(())
}
