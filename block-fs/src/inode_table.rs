use crate::back_store::BackStore;
use crate::block_dev::BlockDevice;
use crate::layout::Inode;
use crate::{
    BlockId, FsError, InodeId, Result, BLOCK_SIZE, INODES_PER_BLOCK, INODE_COUNT, INODE_SIZE,
    INODE_TABLE_BLOCKS, INODE_TABLE_START, ROOT_INODE,
};

pub struct InodeTable {
    inodes: Vec<Inode>,
}

fn table_block(i_block: usize) -> BlockId {
    (INODE_TABLE_START + i_block) as BlockId
}

impl InodeTable {
    /// A table with every inode free.
    pub fn new() -> Self {
        Self { inodes: vec![Inode::empty(); INODE_COUNT] }
    }

    /// Claims the table blocks in a freshly created store and writes them zeroed.
    pub fn reserve<D: BlockDevice>(&self, store: &mut BackStore<D>) -> Result<()> {
        for i_block in 0..INODE_TABLE_BLOCKS {
            if !store.request(table_block(i_block)) {
                return Err(FsError::Corrupt("inode table block already in use"));
            }
        }
        self.flush(store)
    }

    pub fn load<D: BlockDevice>(store: &BackStore<D>) -> Result<Self> {
        let mut inodes = Vec::with_capacity(INODE_COUNT);
        let mut buf = [0; BLOCK_SIZE];
        for i_block in 0..INODE_TABLE_BLOCKS {
            let id = table_block(i_block);
            if !store.is_allocated(id) {
                return Err(FsError::Corrupt("inode table block not allocated"));
            }
            store.read(id, &mut buf)?;
            for record in buf.chunks(INODE_SIZE) {
                inodes.push(Inode::decode(record)?);
            }
        }
        Ok(Self { inodes })
    }

    /// Persists the whole table.
    pub fn flush<D: BlockDevice>(&self, store: &BackStore<D>) -> Result<()> {
        (0..INODE_TABLE_BLOCKS).try_for_each(|i_block| self.write_block(store, i_block))
    }

    fn write_block<D: BlockDevice>(&self, store: &BackStore<D>, i_block: usize) -> Result<()> {
        let mut buf = [0; BLOCK_SIZE];
        let first = i_block * INODES_PER_BLOCK;
        for (inode, record) in self.inodes[first..first + INODES_PER_BLOCK]
            .iter()
            .zip(buf.chunks_mut(INODE_SIZE))
        {
            inode.encode(record);
        }
        store.write(table_block(i_block), &buf)
    }

    pub fn read_inode(&self, index: InodeId) -> &Inode {
        &self.inodes[index as usize]
    }

    /// Replaces inode `index` in the mirror and persists its containing block.
    pub fn write_inode<D: BlockDevice>(
        &mut self,
        store: &BackStore<D>,
        index: InodeId,
        inode: Inode,
    ) -> Result<()> {
        self.inodes[index as usize] = inode;
        self.write_block(store, index as usize / INODES_PER_BLOCK)
    }

    /// First free inode, never the root.
    pub fn find_free(&self) -> Option<InodeId> {
        self.inodes
            .iter()
            .enumerate()
            .skip(ROOT_INODE as usize + 1)
            .find(|(_, inode)| inode.is_free())
            .map(|(i, _)| i as InodeId)
    }

    pub fn used(&self) -> usize {
        self.inodes.iter().filter(|inode| !inode.is_free()).count()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
