use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Name of the lock file placed inside every store directory.
pub const LOCK_FILE: &str = "LOCK";

/// Exclusive advisory lock on a store directory.
///
/// Held for the lifetime of the store. A second lock on the same directory,
/// from this process or another one, fails with `Error::LocationInUse`. The
/// lock is released when the value is dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks `dir` by creating and locking `dir/LOCK`.
    /// The lock file contains the process ID for debugging purposes.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = Self::try_lock(&file) {
            return Err(match e.kind() {
                io::ErrorKind::WouldBlock => Error::LocationInUse(dir.to_path_buf()),
                _ if e.raw_os_error() == Some(LOCK_VIOLATION) => {
                    Error::LocationInUse(dir.to_path_buf())
                }
                _ => Error::Io(e),
            });
        }

        // Only the holder may rewrite the contents.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// ERROR_LOCK_VIOLATION, returned by LockFileEx when the range is held.
#[cfg(windows)]
const LOCK_VIOLATION: i32 = 33;
#[cfg(not(windows))]
const LOCK_VIOLATION: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::acquire(dir.path()).expect("Failed to acquire lock");

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().unwrap();
        let _lock1 = FileLock::acquire(dir.path()).expect("Failed to acquire first lock");

        match FileLock::acquire(dir.path()) {
            Err(Error::LocationInUse(path)) => assert_eq!(path, dir.path()),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second lock on the same directory must fail"),
        }
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _lock = FileLock::acquire(dir.path()).expect("Failed to acquire lock");
        }
        let _lock2 =
            FileLock::acquire(dir.path()).expect("Should be able to acquire lock after drop");
    }
}
