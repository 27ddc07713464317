//! Durable database image
//!
//! The executor's database lives in memory. After every successful write the
//! whole image is copied to one file per origin; on boot that file is restored
//! verbatim.

use std::path::{Path, PathBuf};

use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};

use crate::error::Result;

/// Fixed file name of the image inside an origin's storage area.
pub const IMAGE_FILE_NAME: &str = "tally-pos.sqlite3";

/// Location of one origin's durable database image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    /// Storage area for `origin` under `data_dir`.
    pub fn for_origin(data_dir: impl AsRef<Path>, origin: &str) -> Self {
        Self {
            dir: data_dir.as_ref().join(origin_dir_name(origin)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE_NAME)
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Restore the stored image into `conn`. Returns false when none exists.
    pub fn load_into(&self, conn: &mut Connection) -> Result<bool> {
        let path = self.path();
        if !path.is_file() {
            return Ok(false);
        }
        conn.restore(DatabaseName::Main, &path, None::<fn(Progress)>)?;
        tracing::debug!("Restored database image from {}", path.display());
        Ok(true)
    }

    /// Write the full image of `conn`, replacing the previous one atomically.
    pub fn save_from(&self, conn: &Connection) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let staging = self.dir.join(format!("{IMAGE_FILE_NAME}.tmp"));
        if staging.exists() {
            std::fs::remove_file(&staging)?;
        }
        conn.backup(DatabaseName::Main, &staging, None)?;
        std::fs::rename(&staging, self.path())?;
        Ok(())
    }
}

/// Filesystem-safe directory name for an origin string.
fn origin_dir_name(origin: &str) -> String {
    let trimmed = origin.trim();
    if trimmed.is_empty() {
        return "local".to_string();
    }
    let name: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    // "." and ".." would resolve outside the origin's own directory
    if name.chars().all(|c| c == '.') {
        return name.replace('.', "_");
    }
    name
}
