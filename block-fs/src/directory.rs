use crate::back_store::BackStore;
use crate::block_dev::BlockDevice;
use crate::inode_table::InodeTable;
use crate::layout::{encode_name, trim_name, DirBlock, DirEntry};
use crate::{BlockId, FsError, InodeId, Result, BLOCK_SIZE, DIR_ENTRIES_MAX};

impl DirBlock {
    /// Slot and inode of the first entry named `name`.
    pub fn lookup(&self, name: &str) -> Option<(usize, InodeId)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.is_present() && trim_name(&e.name) == name.as_bytes())
            .map(|(slot, e)| (slot, e.inode))
    }

    pub fn is_full(&self) -> bool {
        self.count as usize >= DIR_ENTRIES_MAX
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Puts `name` in the first empty slot and returns that slot.
    pub fn insert(&mut self, name: &str, inode: InodeId) -> Result<usize> {
        if self.is_full() {
            return Err(FsError::DirectoryFull);
        }
        let name = encode_name(name)?;
        let slot = self
            .entries
            .iter()
            .position(|e| !e.is_present())
            .ok_or(FsError::DirectoryFull)?;
        self.entries[slot] = DirEntry { name, inode };
        self.count += 1;
        Ok(slot)
    }

    /// Blanks the slot holding `name`, returning the inode it pointed to.
    pub fn remove(&mut self, name: &str) -> Result<Option<InodeId>> {
        let Some((slot, inode)) = self.lookup(name) else {
            return Ok(None);
        };
        self.count = self
            .count
            .checked_sub(1)
            .ok_or(FsError::Corrupt("directory entry count out of range"))?;
        self.entries[slot] = DirEntry::EMPTY;
        Ok(Some(inode))
    }

    /// Present entries in slot order.
    pub fn present(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.is_present())
    }
}

pub fn read_dir_block<D: BlockDevice>(store: &BackStore<D>, id: BlockId) -> Result<DirBlock> {
    let mut buf = [0; BLOCK_SIZE];
    store.read(id, &mut buf)?;
    DirBlock::decode(&buf)
}

pub fn write_dir_block<D: BlockDevice>(store: &BackStore<D>, id: BlockId, dir: &DirBlock) -> Result<()> {
    store.write(id, &dir.encode())
}

/// Allocates the directory block of inode `dir`, writes it empty and links it
/// into the inode's first direct pointer.
pub fn init_directory_block<D: BlockDevice>(
    store: &mut BackStore<D>,
    table: &mut InodeTable,
    dir: InodeId,
) -> Result<BlockId> {
    let mut inode = table.read_inode(dir).clone();
    let id = store.allocate()?;
    if let Err(e) = write_dir_block(store, id, &DirBlock::new(dir, inode.parent)) {
        store.release(id);
        return Err(e);
    }
    inode.set_ptr(0, Some(id));
    inode.blocks = 1;
    inode.size = BLOCK_SIZE as u32;
    table.write_inode(store, dir, inode)?;
    Ok(id)
}
