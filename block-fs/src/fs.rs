use std::io::SeekFrom;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::back_store::BackStore;
use crate::block_dev::{BlockDevice, FileDevice};
use crate::block_map::{block_span, release_all, resolve, Mode};
use crate::directory::{init_directory_block, read_dir_block, write_dir_block};
use crate::fd_table::{Fd, FdTable};
use crate::inode_table::InodeTable;
use crate::layout::{encode_name, FileKind, Inode, Permissions};
use crate::path::{locate, split_parent, walk, Location};
use crate::{BlockId, FsError, InodeId, Result, BLOCK_SIZE, INODE_COUNT, ROOT_INODE};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub name: String,
    pub kind: FileKind,
    pub inode: InodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub inode: InodeId,
    pub parent: InodeId,
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u16,
    pub created: u64,
    pub modified: u64,
    pub permissions: Permissions,
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Turns a failure after the first persistent write of a multi-step
/// mutation into `Inconsistent`. Nothing is rolled back.
fn inconsistent(what: &'static str) -> impl FnOnce(FsError) -> FsError {
    move |e| {
        warn!("{what}: {e}; filesystem left inconsistent");
        FsError::Inconsistent(what)
    }
}

/// A mounted filesystem. Owns the back store, the resident inode table and
/// the descriptor table until `unmount`.
///
/// Every method takes `&mut self`; share an instance across threads only
/// behind a lock.
pub struct FileSystem<D: BlockDevice = FileDevice> {
    store: BackStore<D>,
    inodes: InodeTable,
    fds: FdTable,
}

impl FileSystem<FileDevice> {
    /// Creates a new image file and formats it.
    pub fn format<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::format_store(BackStore::create(path)?)
    }

    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::mount_store(BackStore::open(path)?)
    }
}

impl<D: BlockDevice> FileSystem<D> {
    pub fn format_on(device: D) -> Result<Self> {
        Self::format_store(BackStore::create_on(device)?)
    }

    pub fn mount_on(device: D) -> Result<Self> {
        Self::mount_store(BackStore::open_on(device)?)
    }

    fn format_store(mut store: BackStore<D>) -> Result<Self> {
        let mut inodes = InodeTable::new();
        inodes.reserve(&mut store)?;

        let root = Inode::new("root", FileKind::Directory, ROOT_INODE, ROOT_INODE, now())?;
        inodes.write_inode(&store, ROOT_INODE, root)?;
        let root_block = init_directory_block(&mut store, &mut inodes, ROOT_INODE)?;

        info!("formatted filesystem, root directory in block {root_block}, {} blocks free", store.free_blocks());
        Ok(Self { store, inodes, fds: FdTable::new() })
    }

    fn mount_store(store: BackStore<D>) -> Result<Self> {
        let inodes = InodeTable::load(&store)?;
        let root = inodes.read_inode(ROOT_INODE);
        if root.kind != Some(FileKind::Directory) || root.ptr(0).is_none() {
            return Err(FsError::Corrupt("root inode is not a directory"));
        }

        info!("mounted filesystem, {} inodes in use, {} blocks free", inodes.used(), store.free_blocks());
        Ok(Self { store, inodes, fds: FdTable::new() })
    }

    /// Persists the inode table and the free-block bitmap, then closes the store.
    pub fn unmount(self) -> Result<()> {
        let Self { store, inodes, fds } = self;
        if fds.open_count() > 0 {
            debug!("unmounting with {} descriptors still open", fds.open_count());
        }
        inodes.flush(&store)?;
        store.close()?;
        info!("unmounted filesystem");
        Ok(())
    }

    pub fn free_blocks(&self) -> usize {
        self.store.free_blocks()
    }

    /// Resolves `path`; `Ok(None)` if it does not exist.
    pub fn locate(&self, path: &str) -> Result<Option<Location>> {
        locate(&self.store, &self.inodes, path)
    }

    fn dir_block_of(&self, dir: InodeId) -> Result<BlockId> {
        self.inodes
            .read_inode(dir)
            .ptr(0)
            .ok_or(FsError::Corrupt("directory without a block"))
    }

    fn touch(&mut self, ino: InodeId) -> Result<()> {
        let mut inode = self.inodes.read_inode(ino).clone();
        inode.modified = now();
        self.inodes.write_inode(&self.store, ino, inode)
    }

    /// Creates a regular file or an empty directory. Missing parents are not created.
    pub fn create(&mut self, path: &str, kind: FileKind) -> Result<()> {
        let (parent_names, name) = split_parent(path)?;
        let parent = walk(&self.store, &self.inodes, &parent_names)?.ok_or(FsError::NotFound)?;
        if parent.kind != FileKind::Directory {
            return Err(FsError::NotDirectory);
        }
        let dir_block = parent.data_block.ok_or(FsError::Corrupt("directory without a block"))?;
        let mut dir = read_dir_block(&self.store, dir_block)?;
        if dir.lookup(&name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        if dir.is_full() {
            return Err(FsError::DirectoryFull);
        }
        let ino = self.inodes.find_free().ok_or(FsError::NoFreeInode)?;
        if kind == FileKind::Directory && self.store.free_blocks() == 0 {
            return Err(FsError::Full);
        }

        let inode = Inode::new(&name, kind, ino, parent.inode, now())?;
        self.inodes.write_inode(&self.store, ino, inode)?;
        if kind == FileKind::Directory {
            init_directory_block(&mut self.store, &mut self.inodes, ino)
                .map_err(inconsistent("new directory has no block"))?;
        }
        dir.insert(&name, ino)?;
        write_dir_block(&self.store, dir_block, &dir).map_err(inconsistent("new inode is not linked"))?;
        self.touch(parent.inode)?;

        debug!("created {path} as inode {ino} ({kind:?})");
        Ok(())
    }

    /// Opens a regular file with its position at the beginning.
    pub fn open(&mut self, path: &str) -> Result<Fd> {
        let loc = self.locate(path)?.ok_or(FsError::NotFound)?;
        if loc.kind == FileKind::Directory {
            return Err(FsError::IsDirectory);
        }
        let fd = self.fds.open(loc.inode)?;
        debug!("opened {path} (inode {}) as {fd:?}", loc.inode);
        Ok(fd)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.fds.close(fd)?;
        debug!("closed {fd:?}");
        Ok(())
    }

    /// Moves the position of `fd`, clamped to `[0, size]`. Returns the new position.
    pub fn seek(&mut self, fd: Fd, pos: SeekFrom) -> Result<u64> {
        let size = self.inodes.read_inode(self.fds.inode(fd)?).size as i64;
        let current = self.fds.position(fd)? as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset.min(i64::MAX as u64) as i64,
            SeekFrom::Current(offset) => current.saturating_add(offset),
            SeekFrom::End(offset) => size.saturating_add(offset),
        };
        let position = target.clamp(0, size) as u64;
        self.fds.set_position(fd, position)?;
        Ok(position)
    }

    /// Writes `data` at the position of `fd`, extending the file as needed.
    /// Returns fewer bytes than `data.len()` if the store runs out of blocks.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let ino = self.fds.inode(fd)?;
        let position = self.fds.position(fd)? as usize;
        let mut inode = self.inodes.read_inode(ino).clone();

        let (first, count) = block_span(position, data.len());
        let blocks = resolve(&mut self.store, &mut inode, first, count, Mode::Allocate)?;
        let copied = self.write_blocks(&blocks, position % BLOCK_SIZE, data);

        // the inode has to be persisted even if the copy failed, it may own new blocks
        let written = *copied.as_ref().unwrap_or(&0);
        let end = (position + written) as u32;
        if end > inode.size {
            inode.size = end;
        }
        inode.modified = now();
        self.inodes
            .write_inode(&self.store, ino, inode)
            .map_err(inconsistent("new blocks not recorded in the inode"))?;
        let written = copied?;

        self.fds.set_position(fd, (position + written) as u64)?;
        if written < data.len() {
            warn!("short write on inode {ino}: {written} of {} bytes", data.len());
        }
        Ok(written)
    }

    fn write_blocks(&self, blocks: &[BlockId], mut offset: usize, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        let mut buf = [0; BLOCK_SIZE];
        for &id in blocks {
            let n = (BLOCK_SIZE - offset).min(data.len() - written);
            if n < BLOCK_SIZE {
                self.store.read(id, &mut buf)?;
            }
            buf[offset..offset + n].copy_from_slice(&data[written..written + n]);
            self.store.write(id, &buf)?;
            written += n;
            offset = 0;
        }
        Ok(written)
    }

    /// Reads up to `buf.len()` bytes from the position of `fd`, never past
    /// the end of the file. Returns 0 at end of file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let ino = self.fds.inode(fd)?;
        let position = self.fds.position(fd)? as usize;
        let mut inode = self.inodes.read_inode(ino).clone();
        let size = inode.size as usize;
        if position >= size {
            return Ok(0);
        }
        let want = buf.len().min(size - position);

        let (first, count) = block_span(position, want);
        let blocks = resolve(&mut self.store, &mut inode, first, count, Mode::Lookup)?;
        if blocks.len() < count {
            return Err(FsError::Corrupt("file has fewer blocks than its size"));
        }

        let mut done = 0;
        let mut offset = position % BLOCK_SIZE;
        let mut block = [0; BLOCK_SIZE];
        for id in blocks {
            let n = (BLOCK_SIZE - offset).min(want - done);
            self.store.read(id, &mut block)?;
            buf[done..done + n].copy_from_slice(&block[offset..offset + n]);
            done += n;
            offset = 0;
        }

        self.fds.set_position(fd, (position + done) as u64)?;
        Ok(done)
    }

    /// Deletes a file, closing every descriptor open on it, or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let loc = self.locate(path)?.ok_or(FsError::NotFound)?;
        if loc.inode == ROOT_INODE {
            return Err(FsError::InvalidArgument);
        }
        let (_, name) = split_parent(path)?;

        if let Some(block) = loc.data_block {
            if !read_dir_block(&self.store, block)?.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        let parent_block = self.dir_block_of(loc.parent)?;
        let mut parent_dir = read_dir_block(&self.store, parent_block)?;
        parent_dir
            .remove(&name)?
            .ok_or(FsError::Corrupt("entry missing from its directory"))?;

        let mut inode = self.inodes.read_inode(loc.inode).clone();
        let released = release_all(&mut self.store, &mut inode)?;
        if loc.kind == FileKind::Regular {
            let closed = self.fds.close_all(loc.inode);
            if closed > 0 {
                debug!("closed {closed} descriptors of {path}");
            }
        }
        self.inodes
            .write_inode(&self.store, loc.inode, Inode::empty())
            .map_err(inconsistent("removed inode not cleared"))?;
        write_dir_block(&self.store, parent_block, &parent_dir)
            .map_err(inconsistent("removed inode still linked"))?;
        self.touch(loc.parent)?;

        debug!("removed {path} (inode {}), released {released} blocks", loc.inode);
        Ok(())
    }

    /// Relinks `src` as `dst`. Open descriptors keep working on the moved file.
    pub fn move_entry(&mut self, src: &str, dst: &str) -> Result<()> {
        let from = self.locate(src)?.ok_or(FsError::NotFound)?;
        if from.inode == ROOT_INODE {
            return Err(FsError::InvalidArgument);
        }
        let (_, src_name) = split_parent(src)?;
        let (dst_parent_names, dst_name) = split_parent(dst)?;
        let new_name = encode_name(&dst_name)?;

        let to = walk(&self.store, &self.inodes, &dst_parent_names)?.ok_or(FsError::NotFound)?;
        if to.kind != FileKind::Directory {
            return Err(FsError::NotDirectory);
        }
        if from.kind == FileKind::Directory && self.is_ancestor(from.inode, to.inode) {
            return Err(FsError::InvalidArgument);
        }
        let dst_block = to.data_block.ok_or(FsError::Corrupt("directory without a block"))?;

        if from.parent == to.inode {
            if src_name == dst_name {
                return Ok(());
            }
            let mut dir = read_dir_block(&self.store, dst_block)?;
            if dir.lookup(&dst_name).is_some() {
                return Err(FsError::AlreadyExists);
            }
            dir.remove(&src_name)?
                .ok_or(FsError::Corrupt("entry missing from its directory"))?;
            dir.insert(&dst_name, from.inode)?;
            write_dir_block(&self.store, dst_block, &dir)?;
        } else {
            let mut dst_dir = read_dir_block(&self.store, dst_block)?;
            if dst_dir.lookup(&dst_name).is_some() {
                return Err(FsError::AlreadyExists);
            }
            if dst_dir.is_full() {
                return Err(FsError::DirectoryFull);
            }
            let src_block = self.dir_block_of(from.parent)?;
            let mut src_dir = read_dir_block(&self.store, src_block)?;
            src_dir
                .remove(&src_name)?
                .ok_or(FsError::Corrupt("entry missing from its directory"))?;

            dst_dir.insert(&dst_name, from.inode)?;
            write_dir_block(&self.store, dst_block, &dst_dir)?;
            write_dir_block(&self.store, src_block, &src_dir)
                .map_err(inconsistent("moved entry linked twice"))?;
            self.touch(from.parent)?;
        }

        let mut inode = self.inodes.read_inode(from.inode).clone();
        inode.name = new_name;
        inode.parent = to.inode;
        self.inodes
            .write_inode(&self.store, from.inode, inode)
            .map_err(inconsistent("moved inode keeps its old name"))?;
        if let Some(block) = from.data_block {
            let mut dir = read_dir_block(&self.store, block)?;
            dir.parent = to.inode;
            write_dir_block(&self.store, block, &dir)
                .map_err(inconsistent("moved directory keeps its old parent"))?;
        }
        self.touch(to.inode)?;

        debug!("moved {src} to {dst} (inode {})", from.inode);
        Ok(())
    }

    /// Whether `dir` is `node` or one of its ancestors.
    fn is_ancestor(&self, dir: InodeId, node: InodeId) -> bool {
        let mut cur = node;
        for _ in 0..INODE_COUNT {
            if cur == dir {
                return true;
            }
            if cur == ROOT_INODE {
                return false;
            }
            cur = self.inodes.read_inode(cur).parent;
        }
        false
    }

    /// Entries of a directory in slot order.
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirRecord>> {
        let loc = self.locate(path)?.ok_or(FsError::NotFound)?;
        let block = match (loc.kind, loc.data_block) {
            (FileKind::Directory, Some(block)) => block,
            (FileKind::Directory, None) => return Err(FsError::Corrupt("directory without a block")),
            (FileKind::Regular, _) => return Err(FsError::NotDirectory),
        };
        read_dir_block(&self.store, block)?
            .present()
            .map(|entry| {
                let kind = self
                    .inodes
                    .read_inode(entry.inode)
                    .kind
                    .ok_or(FsError::Corrupt("entry points at a free inode"))?;
                Ok(DirRecord { name: entry.name(), kind, inode: entry.inode })
            })
            .collect()
    }

    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let loc = self.locate(path)?.ok_or(FsError::NotFound)?;
        let inode = self.inodes.read_inode(loc.inode);
        Ok(Metadata {
            inode: loc.inode,
            parent: inode.parent,
            kind: loc.kind,
            size: inode.size as u64,
            blocks: inode.blocks,
            created: inode.created,
            modified: inode.modified,
            permissions: inode.perms,
        })
    }
}
