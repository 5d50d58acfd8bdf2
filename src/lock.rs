//! Single-writer lock: a `medea.lock` file created exclusively and holding the
//! owner's pid. A lock whose owner is no longer running is reclaimed.

use crate::error::{DbError, DbResult};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = "medea.lock";

pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE_NAME)
}

#[derive(Debug)]
pub struct ExclusiveLock {
    path: PathBuf,
    released: bool,
}

impl ExclusiveLock {
    /// Takes the lock for `dir`, failing with `AlreadyOpen` while a live
    /// process holds it.
    pub fn acquire(dir: &Path) -> DbResult<Self> {
        let path = lock_path(dir);
        // Second attempt only happens after removing a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!("Acquired lock {:?}", path);
                    return Ok(ExclusiveLock {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if holder_alive(&path)? {
                        return Err(DbError::AlreadyOpen {
                            path: dir.to_path_buf(),
                        });
                    }
                    warn!("Removing stale lock file {:?}", path);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DbError::AlreadyOpen {
            path: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) -> DbResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("Released lock {:?}", self.path);
        Ok(())
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Whether `dir` is locked by a running process.
pub fn is_locked(dir: &Path) -> DbResult<bool> {
    let path = lock_path(dir);
    if !path.exists() {
        return Ok(false);
    }
    holder_alive(&path)
}

fn holder_alive(path: &Path) -> DbResult<bool> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    // An empty or garbled lock file is left by a crash between create and write.
    match contents.split_whitespace().next().and_then(|s| s.parse::<i32>().ok()) {
        Some(pid) => Ok(process_alive(pid)),
        None => Ok(false),
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: the process exists but belongs to someone else.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let mut lock = ExclusiveLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
        assert!(is_locked(dir.path()).unwrap());

        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock_path(dir.path()).exists());
        assert!(!is_locked(dir.path()).unwrap());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let _lock = ExclusiveLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            ExclusiveLock::acquire(dir.path()),
            Err(DbError::AlreadyOpen { .. })
        ));
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempdir().unwrap();
        {
            let _lock = ExclusiveLock::acquire(dir.path()).unwrap();
        }
        assert!(ExclusiveLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_garbled_lock_is_reclaimed() {
        let dir = tempdir().unwrap();
        fs::write(lock_path(dir.path()), b"").unwrap();
        assert!(!is_locked(dir.path()).unwrap());
        let lock = ExclusiveLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = tempdir().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        fs::write(lock_path(dir.path()), format!("{}\n", pid)).unwrap();

        assert!(!is_locked(dir.path()).unwrap());
        assert!(ExclusiveLock::acquire(dir.path()).is_ok());
    }
}
