//! On-disk records: inodes, directory blocks and indirection blocks.
//! Everything is little-endian.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::{
    Block, BlockId, FsError, InodeId, Result, BLOCK_SIZE, DIRECT_PTRS, DIR_ENTRIES_MAX,
    DIR_ENTRY_SIZE, FNAME_MAX, INODE_SIZE, PTRS_PER_BLOCK,
};

pub const INDIRECT_SLOT: usize = DIRECT_PTRS;
pub const DOUBLE_INDIRECT_SLOT: usize = DIRECT_PTRS + 1;
pub const BLOCK_PTRS: usize = DIRECT_PTRS + 2;

// inode record
const NAME_OFF: usize = 0;
const KIND_OFF: usize = 64;
const SIZE_OFF: usize = 68;
const CTIME_OFF: usize = 72;
const MTIME_OFF: usize = 80;
const BLOCKS_OFF: usize = 88;
const INO_OFF: usize = 90;
const PARENT_OFF: usize = 91;
const PERMS_OFF: usize = 92;
const PTRS_OFF: usize = 112;

const_assert_eq!(KIND_OFF, NAME_OFF + FNAME_MAX);
const_assert_eq!(PTRS_OFF + BLOCK_PTRS * 2, INODE_SIZE);

// directory block
const DIR_OWNER_OFF: usize = 0;
const DIR_PARENT_OFF: usize = 1;
const DIR_ENTRIES_OFF: usize = 44;
const DIR_COUNT_OFF: usize = DIR_ENTRIES_OFF + DIR_ENTRIES_MAX * DIR_ENTRY_SIZE;

const_assert_eq!(DIR_COUNT_OFF, 1019);
const_assert!(DIR_COUNT_OFF < BLOCK_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
}

impl FileKind {
    fn to_raw(kind: Option<FileKind>) -> u32 {
        match kind {
            None => 0,
            Some(FileKind::Regular) => 1,
            Some(FileKind::Directory) => 2,
        }
    }

    fn from_raw(raw: u32) -> Result<Option<FileKind>> {
        match raw {
            0 => Ok(None),
            1 => Ok(Some(FileKind::Regular)),
            2 => Ok(Some(FileKind::Directory)),
            _ => Err(FsError::Corrupt("unknown inode kind")),
        }
    }
}

bitflags! {
    /// Unix-style permission bits. Recorded, never enforced.
    pub struct Permissions: u16 {
        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC = 0o100;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC = 0o010;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC = 0o001;
    }
}

impl Permissions {
    pub fn default_for(kind: FileKind) -> Self {
        match kind {
            FileKind::Regular => Self::from_bits_truncate(0o644),
            FileKind::Directory => Self::from_bits_truncate(0o755),
        }
    }
}

/// Copies `name` into a NUL-padded name field.
pub fn encode_name(name: &str) -> Result<[u8; FNAME_MAX]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= FNAME_MAX || bytes.contains(&0) {
        return Err(FsError::InvalidPath);
    }
    let mut field = [0; FNAME_MAX];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

pub fn trim_name(field: &[u8]) -> &[u8] {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

fn decode_name(field: &[u8]) -> String {
    String::from_utf8_lossy(trim_name(field)).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub name: [u8; FNAME_MAX],
    /// `None` marks a free inode.
    pub kind: Option<FileKind>,
    pub size: u32,
    pub created: u64,
    pub modified: u64,
    /// Data blocks held by the file, indirection blocks excluded.
    pub blocks: u16,
    pub ino: InodeId,
    pub parent: InodeId,
    pub perms: Permissions,
    pub ptrs: [BlockId; BLOCK_PTRS],
}

impl Inode {
    pub fn empty() -> Self {
        Self {
            name: [0; FNAME_MAX],
            kind: None,
            size: 0,
            created: 0,
            modified: 0,
            blocks: 0,
            ino: 0,
            parent: 0,
            perms: Permissions::empty(),
            ptrs: [0; BLOCK_PTRS],
        }
    }

    pub fn new(name: &str, kind: FileKind, ino: InodeId, parent: InodeId, now: u64) -> Result<Self> {
        Ok(Self {
            name: encode_name(name)?,
            kind: Some(kind),
            created: now,
            modified: now,
            ino,
            parent,
            perms: Permissions::default_for(kind),
            ..Self::empty()
        })
    }

    pub fn is_free(&self) -> bool {
        self.kind.is_none()
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    /// Block pointer in `slot`, `None` when empty.
    pub fn ptr(&self, slot: usize) -> Option<BlockId> {
        match self.ptrs[slot] {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_ptr(&mut self, slot: usize, id: Option<BlockId>) {
        self.ptrs[slot] = id.unwrap_or(0);
    }

    pub fn encode(&self, buf: &mut [u8]) {
        let buf = &mut buf[..INODE_SIZE];
        buf.fill(0);
        buf[NAME_OFF..NAME_OFF + FNAME_MAX].copy_from_slice(&self.name);
        LittleEndian::write_u32(&mut buf[KIND_OFF..], FileKind::to_raw(self.kind));
        LittleEndian::write_u32(&mut buf[SIZE_OFF..], self.size);
        LittleEndian::write_u64(&mut buf[CTIME_OFF..], self.created);
        LittleEndian::write_u64(&mut buf[MTIME_OFF..], self.modified);
        LittleEndian::write_u16(&mut buf[BLOCKS_OFF..], self.blocks);
        buf[INO_OFF] = self.ino;
        buf[PARENT_OFF] = self.parent;
        LittleEndian::write_u16(&mut buf[PERMS_OFF..], self.perms.bits());
        LittleEndian::write_u16_into(&self.ptrs, &mut buf[PTRS_OFF..INODE_SIZE]);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let buf = &buf[..INODE_SIZE];
        let mut name = [0; FNAME_MAX];
        name.copy_from_slice(&buf[NAME_OFF..NAME_OFF + FNAME_MAX]);
        let mut ptrs = [0; BLOCK_PTRS];
        LittleEndian::read_u16_into(&buf[PTRS_OFF..INODE_SIZE], &mut ptrs);
        Ok(Self {
            name,
            kind: FileKind::from_raw(LittleEndian::read_u32(&buf[KIND_OFF..]))?,
            size: LittleEndian::read_u32(&buf[SIZE_OFF..]),
            created: LittleEndian::read_u64(&buf[CTIME_OFF..]),
            modified: LittleEndian::read_u64(&buf[MTIME_OFF..]),
            blocks: LittleEndian::read_u16(&buf[BLOCKS_OFF..]),
            ino: buf[INO_OFF],
            parent: buf[PARENT_OFF],
            perms: Permissions::from_bits_truncate(LittleEndian::read_u16(&buf[PERMS_OFF..])),
            ptrs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; FNAME_MAX],
    pub inode: InodeId,
}

impl DirEntry {
    pub const EMPTY: Self = Self { name: [0; FNAME_MAX], inode: 0 };

    /// A slot is in use iff its name is non-empty; inode 0 alone means nothing.
    pub fn is_present(&self) -> bool {
        self.name[0] != 0
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }
}

/// The single block backing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBlock {
    pub owner: InodeId,
    pub parent: InodeId,
    pub entries: [DirEntry; DIR_ENTRIES_MAX],
    pub count: u8,
}

impl DirBlock {
    pub fn new(owner: InodeId, parent: InodeId) -> Self {
        Self { owner, parent, entries: [DirEntry::EMPTY; DIR_ENTRIES_MAX], count: 0 }
    }

    pub fn encode(&self) -> Block {
        let mut buf = [0; BLOCK_SIZE];
        buf[DIR_OWNER_OFF] = self.owner;
        buf[DIR_PARENT_OFF] = self.parent;
        for (i, entry) in self.entries.iter().enumerate() {
            let off = DIR_ENTRIES_OFF + i * DIR_ENTRY_SIZE;
            buf[off..off + FNAME_MAX].copy_from_slice(&entry.name);
            buf[off + FNAME_MAX] = entry.inode;
        }
        buf[DIR_COUNT_OFF] = self.count;
        buf
    }

    pub fn decode(buf: &Block) -> Result<Self> {
        let mut dir = Self::new(buf[DIR_OWNER_OFF], buf[DIR_PARENT_OFF]);
        for (i, entry) in dir.entries.iter_mut().enumerate() {
            let off = DIR_ENTRIES_OFF + i * DIR_ENTRY_SIZE;
            entry.name.copy_from_slice(&buf[off..off + FNAME_MAX]);
            entry.inode = buf[off + FNAME_MAX];
        }
        dir.count = buf[DIR_COUNT_OFF];
        if dir.count as usize > DIR_ENTRIES_MAX {
            return Err(FsError::Corrupt("directory entry count out of range"));
        }
        Ok(dir)
    }
}

/// Contents of an indirection block: block ids, 0 for an empty slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrBlock(pub [BlockId; PTRS_PER_BLOCK]);

impl PtrBlock {
    pub fn zeroed() -> Self {
        Self([0; PTRS_PER_BLOCK])
    }

    pub fn get(&self, idx: usize) -> Option<BlockId> {
        match self.0[idx] {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set(&mut self, idx: usize, id: Option<BlockId>) {
        self.0[idx] = id.unwrap_or(0);
    }

    pub fn encode(&self) -> Block {
        let mut buf = [0; BLOCK_SIZE];
        LittleEndian::write_u16_into(&self.0, &mut buf);
        buf
    }

    pub fn decode(buf: &Block) -> Self {
        let mut ptrs = [0; PTRS_PER_BLOCK];
        LittleEndian::read_u16_into(buf, &mut ptrs);
        Self(ptrs)
    }
}
