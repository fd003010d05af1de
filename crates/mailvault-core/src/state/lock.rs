use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{debug, info};

use super::StateError;

pub const LOCK_FILE: &str = ".lock";

/// Exclusive hold on a state directory for the duration of one run.
///
/// Acquisition never waits: a second process pointed at the same directory
/// gets [`StateError::LockHeld`] immediately. The lock is released when the
/// guard is dropped, and the OS releases it if the process dies.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(state_dir: &Path) -> Result<Self, StateError> {
        fs::create_dir_all(state_dir).map_err(|source| StateError::Io {
            path: state_dir.to_path_buf(),
            source,
        })?;

        let path = state_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StateError::Io {
                path: path.clone(),
                source,
            })?;

        // Fully qualified so newer toolchains don't pick std's File::try_lock.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                info!(path = %path.display(), "acquired run lock");
                Ok(Self { file, path })
            }
            Err(err) if is_contended(&err) => Err(StateError::LockHeld(path)),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_fast_while_held() {
        let dir = TempDir::new().expect("temp dir");
        let first = RunLock::acquire(dir.path()).expect("first lock");

        match RunLock::acquire(dir.path()) {
            Err(StateError::LockHeld(path)) => assert_eq!(path, first.path()),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("lock should be held"),
        }
    }

    #[test]
    fn dropping_guard_releases_lock() {
        let dir = TempDir::new().expect("temp dir");
        let first = RunLock::acquire(dir.path()).expect("first lock");
        drop(first);

        RunLock::acquire(dir.path()).expect("lock is free again");
    }

    #[test]
    fn creates_missing_state_directory() {
        let dir = TempDir::new().expect("temp dir");
        let nested = dir.path().join("a").join("b");

        let lock = RunLock::acquire(&nested).expect("lock");
        assert!(lock.path().exists());
    }
}
