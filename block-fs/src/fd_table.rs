use crate::bitmap::Bitmap;
use crate::{FsError, InodeId, Result, FD_MAX};

/// A file descriptor handed out by `FileSystem::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub usize);

#[derive(Debug, Clone, Copy, Default)]
struct OpenFile {
    position: u64,
    inode: InodeId,
}

pub struct FdTable {
    live: Bitmap,
    files: Vec<OpenFile>,
}

impl FdTable {
    pub fn new() -> Self {
        Self { live: Bitmap::new(FD_MAX), files: vec![OpenFile::default(); FD_MAX] }
    }

    /// Takes the lowest free descriptor for `inode`, positioned at 0.
    pub fn open(&mut self, inode: InodeId) -> Result<Fd> {
        let fd = self.live.first_zero().ok_or(FsError::TooManyOpenFiles)?;
        self.live.set(fd);
        self.files[fd] = OpenFile { position: 0, inode };
        Ok(Fd(fd))
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.check(fd)?;
        self.live.reset(fd.0);
        Ok(())
    }

    fn check(&self, fd: Fd) -> Result<()> {
        if fd.0 >= FD_MAX || !self.live.test(fd.0) {
            return Err(FsError::BadDescriptor);
        }
        Ok(())
    }

    pub fn inode(&self, fd: Fd) -> Result<InodeId> {
        self.check(fd)?;
        Ok(self.files[fd.0].inode)
    }

    pub fn position(&self, fd: Fd) -> Result<u64> {
        self.check(fd)?;
        Ok(self.files[fd.0].position)
    }

    pub fn set_position(&mut self, fd: Fd, position: u64) -> Result<()> {
        self.check(fd)?;
        self.files[fd.0].position = position;
        Ok(())
    }

    /// Closes every descriptor open on `inode`, returning how many there were.
    pub fn close_all(&mut self, inode: InodeId) -> usize {
        let mut closed = 0;
        for fd in 0..FD_MAX {
            if self.live.test(fd) && self.files[fd].inode == inode {
                self.live.reset(fd);
                closed += 1;
            }
        }
        closed
    }

    pub fn open_count(&self) -> usize {
        self.live.count_ones()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
