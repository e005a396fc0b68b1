use static_assertions::const_assert_eq;

pub const BLOCK_SIZE: usize = 1024;
pub const BLOCK_COUNT: usize = 1 << 16;
pub const STORE_BYTES: u64 = (BLOCK_COUNT * BLOCK_SIZE) as u64;

/// Blocks holding the free-block bitmap, one bit per block.
pub const FBM_BLOCKS: usize = BLOCK_COUNT / (8 * BLOCK_SIZE);
pub const FBM_BYTES: usize = FBM_BLOCKS * BLOCK_SIZE;

pub const INODE_COUNT: usize = 256;
pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
pub const INODE_TABLE_BLOCKS: usize = INODE_COUNT / INODES_PER_BLOCK;
pub const INODE_TABLE_START: usize = FBM_BLOCKS;

pub const ROOT_INODE: InodeId = 0;

/// Width of a name field. Names are NUL-terminated, so at most `FNAME_MAX - 1` bytes.
pub const FNAME_MAX: usize = 64;
pub const DIR_ENTRIES_MAX: usize = 15;
pub const DIR_ENTRY_SIZE: usize = FNAME_MAX + 1;

pub const FD_MAX: usize = 256;

pub const DIRECT_PTRS: usize = 6;
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / core::mem::size_of::<BlockId>();
pub const MAX_FILE_BLOCKS: usize = DIRECT_PTRS + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK;

pub type BlockId = u16;
pub type InodeId = u8;
pub type Block = [u8; BLOCK_SIZE];

const_assert_eq!(FBM_BLOCKS, 8);
const_assert_eq!(FBM_BYTES * 8, BLOCK_COUNT);
const_assert_eq!(INODE_TABLE_BLOCKS, 32);
const_assert_eq!(PTRS_PER_BLOCK, 512);
// Every block id and inode index must fit its on-disk width.
const_assert_eq!(BLOCK_COUNT - 1, BlockId::MAX as usize);
const_assert_eq!(INODE_COUNT - 1, InodeId::MAX as usize);
