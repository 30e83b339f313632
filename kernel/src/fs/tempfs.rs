//! An in-memory filesystem with a flat root directory. Enough surface for
//! program loading and memory-mapped files: named create/open/unlink plus
//! positioned reads and writes on open inodes.

use super::{Error, INodeNum, Result};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug)]
struct Inode {
    data: Vec<u8>,
    open_count: usize,
    unlinked: bool,
}

#[derive(Default, Debug)]
pub struct TempFs {
    root: BTreeMap<String, INodeNum>,
    inodes: BTreeMap<INodeNum, Inode>,
    next_inode: INodeNum,
    write_count: u64,
}

impl TempFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, path: &str) -> Result<INodeNum> {
        if self.root.contains_key(path) {
            return Err(Error::Exists);
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(
            inode,
            Inode {
                data: Vec::new(),
                open_count: 1,
                unlinked: false,
            },
        );
        self.root.insert(String::from(path), inode);
        Ok(inode)
    }

    pub fn open(&mut self, path: &str) -> Result<INodeNum> {
        let inode = *self.root.get(path).ok_or(Error::NotFound)?;
        self.inodes
            .get_mut(&inode)
            .expect("directory entry for missing inode")
            .open_count += 1;
        Ok(inode)
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let inode = self.root.remove(path).ok_or(Error::NotFound)?;
        let entry = self
            .inodes
            .get_mut(&inode)
            .expect("directory entry for missing inode");
        if entry.open_count == 0 {
            self.inodes.remove(&inode);
        } else {
            entry.unlinked = true;
        }
        Ok(())
    }

    pub fn duplicate(&mut self, inode: INodeNum) {
        self.inode_mut(inode).open_count += 1;
    }

    pub fn close(&mut self, inode: INodeNum) {
        let entry = self.inode_mut(inode);
        assert!(entry.open_count > 0, "closing a file with no open handles");
        entry.open_count -= 1;
        if entry.open_count == 0 && entry.unlinked {
            self.inodes.remove(&inode);
        }
    }

    pub fn length(&self, inode: INodeNum) -> usize {
        self.inode(inode).data.len()
    }

    pub fn read_at(&self, inode: INodeNum, buf: &mut [u8], offset: usize) -> usize {
        let data = &self.inode(inode).data;
        let n = buf.len().min(data.len().saturating_sub(offset));
        if n > 0 {
            buf[..n].copy_from_slice(&data[offset..offset + n]);
        }
        n
    }

    pub fn write_at(&mut self, inode: INodeNum, buf: &[u8], offset: usize) -> usize {
        self.write_count += 1;
        let data = &mut self.inode_mut(inode).data;
        let n = buf.len().min(data.len().saturating_sub(offset));
        if n > 0 {
            data[offset..offset + n].copy_from_slice(&buf[..n]);
        }
        n
    }

    /// Grows or shrinks the file to `size` bytes, zero-filling any extension.
    pub fn truncate(&mut self, inode: INodeNum, size: usize) {
        self.inode_mut(inode).data.resize(size, 0);
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    #[cfg(test)]
    pub(crate) fn reset_write_count(&mut self) {
        self.write_count = 0;
    }

    fn inode(&self, inode: INodeNum) -> &Inode {
        self.inodes.get(&inode).expect("operation on closed inode")
    }

    fn inode_mut(&mut self, inode: INodeNum) -> &mut Inode {
        self.inodes
            .get_mut(&inode)
            .expect("operation on closed inode")
    }
}
