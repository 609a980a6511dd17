//! Advisory file lock preventing concurrent updaters on one keyspace pair.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::updater::UpdateError;

/// Held for the lifetime of one run; the file is removed on drop.
pub struct UpdateLock {
    path: PathBuf,
}

impl UpdateLock {
    /// Creates `<dir>/<raw>_<transformed>.lock` exclusively. An existing
    /// file means another updater is (or was, after a hard kill) running.
    pub fn acquire(
        dir: &Path,
        raw_keyspace: &str,
        transformed_keyspace: &str,
    ) -> Result<Self, UpdateError> {
        let path = dir.join(format!("{raw_keyspace}_{transformed_keyspace}.lock"));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                info!(path = %path.display(), "Acquired update lock");
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(UpdateError::LockHeld(path.display().to_string()))
            }
            Err(err) => Err(UpdateError::Setup(format!(
                "cannot create lockfile {}: {err}",
                path.display()
            ))),
        }
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "Failed to remove lockfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_released() {
        let dir = std::env::temp_dir().join(format!("chaingraph-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let lock = UpdateLock::acquire(&dir, "raw", "transformed").unwrap();
        assert!(matches!(
            UpdateLock::acquire(&dir, "raw", "transformed"),
            Err(UpdateError::LockHeld(_))
        ));
        drop(lock);
        let relock = UpdateLock::acquire(&dir, "raw", "transformed");
        assert!(relock.is_ok());
        drop(relock);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
