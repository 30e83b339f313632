pub mod tempfs;

use crate::sync::mutex::Mutex;
use alloc::sync::Arc;
pub use tempfs::TempFs;

pub type INodeNum = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// directory entry not found
    NotFound,
    /// Target destination already exists
    Exists,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Exists => write!(f, "destination already exists"),
        }
    }
}

impl core::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Shared handle to a mounted filesystem. Clones alias the same filesystem;
/// the inner mutex is the coarse lock every file operation takes.
#[derive(Clone, Debug)]
pub struct FileSysRef {
    fs: Arc<Mutex<TempFs>>,
}

impl FileSysRef {
    pub fn new(fs: TempFs) -> Self {
        Self {
            fs: Arc::new(Mutex::new(fs)),
        }
    }

    /// Creates an empty file at `path` and opens it.
    pub fn create(&self, path: &str) -> Result<File> {
        let inode = self.fs.lock().create(path)?;
        Ok(File {
            fs: self.clone(),
            inode,
        })
    }

    /// Opens the existing file at `path`.
    pub fn open(&self, path: &str) -> Result<File> {
        let inode = self.fs.lock().open(path)?;
        Ok(File {
            fs: self.clone(),
            inode,
        })
    }

    /// Removes the directory entry for `path`. The file's data stays around
    /// until its last open handle is closed.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.fs.lock().unlink(path)
    }

    /// Number of `write_at` calls the filesystem has served.
    pub fn write_count(&self) -> u64 {
        self.fs.lock().write_count()
    }

    #[cfg(test)]
    pub(crate) fn reset_write_count(&self) {
        self.fs.lock().reset_write_count();
    }
}

/// An open file.
///
/// Handles are duplicated and closed explicitly: every `duplicate` must be
/// balanced by exactly one `close`. Every operation serializes on the
/// filesystem lock.
#[derive(Debug)]
pub struct File {
    fs: FileSysRef,
    inode: INodeNum,
}

impl File {
    /// Size of the file in bytes.
    pub fn length(&self) -> usize {
        self.fs.fs.lock().length(self.inode)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (less than requested at end of file).
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.fs.fs.lock().read_at(self.inode, buf, offset)
    }

    /// Writes up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually written. Writes past end of file do not
    /// extend it.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.fs.fs.lock().write_at(self.inode, buf, offset)
    }

    /// Grows or shrinks the file to `size` bytes, zero-filling any
    /// extension.
    pub fn truncate(&self, size: usize) {
        self.fs.fs.lock().truncate(self.inode, size);
    }

    /// Opens a new independent handle to the same file.
    pub fn duplicate(&self) -> File {
        self.fs.fs.lock().duplicate(self.inode);
        File {
            fs: self.fs.clone(),
            inode: self.inode,
        }
    }

    /// Closes the handle. An unlinked file's data is released with its last
    /// open handle.
    pub fn close(self) {
        self.fs.fs.lock().close(self.inode);
    }
}
