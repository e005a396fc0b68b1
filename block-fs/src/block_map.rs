//! Maps a file's logical blocks to physical block ids through the direct,
//! single-indirect and double-indirect tiers of its inode.

use crate::back_store::BackStore;
use crate::block_dev::BlockDevice;
use crate::layout::{Inode, PtrBlock, BLOCK_PTRS, DOUBLE_INDIRECT_SLOT, INDIRECT_SLOT};
use crate::{BlockId, FsError, Result, BLOCK_SIZE, DIRECT_PTRS, MAX_FILE_BLOCKS, PTRS_PER_BLOCK};

const SINGLE_END: usize = DIRECT_PTRS + PTRS_PER_BLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fill empty slots with freshly allocated blocks.
    Allocate,
    /// Report existing pointers only.
    Lookup,
}

#[derive(Debug, PartialEq, Eq)]
enum InnerId {
    Direct(usize),
    Indirect1(usize),
    Indirect2(usize, usize),
}

impl InnerId {
    fn new(inner_id: usize) -> Option<Self> {
        if inner_id < DIRECT_PTRS {
            Some(Self::Direct(inner_id))
        } else if inner_id < SINGLE_END {
            Some(Self::Indirect1(inner_id - DIRECT_PTRS))
        } else if inner_id < MAX_FILE_BLOCKS {
            let idx = inner_id - SINGLE_END;
            Some(Self::Indirect2(idx / PTRS_PER_BLOCK, idx % PTRS_PER_BLOCK))
        } else {
            None
        }
    }
}

/// First logical block and number of logical blocks covering `len` bytes at `position`.
pub fn block_span(position: usize, len: usize) -> (usize, usize) {
    if len == 0 {
        return (position / BLOCK_SIZE, 0);
    }
    let first = position / BLOCK_SIZE;
    let last = (position + len - 1) / BLOCK_SIZE;
    (first, last - first + 1)
}

/// An indirection block held in memory while its subtree is processed.
struct PtrTable {
    id: BlockId,
    ptrs: PtrBlock,
    /// On-disk contents when loaded, `None` for a fresh table.
    original: Option<PtrBlock>,
    dirty: bool,
}

/// What one `resolve` call changed in the store.
#[derive(Default)]
struct Undo {
    fresh: Vec<BlockId>,
    rewritten: Vec<(BlockId, PtrBlock)>,
}

impl Undo {
    /// Puts rewritten tables back, then frees every fresh block. Fresh blocks
    /// stay allocated if a table cannot be restored.
    fn rollback<D: BlockDevice>(self, store: &mut BackStore<D>) -> Result<()> {
        for (id, ptrs) in self.rewritten.iter().rev() {
            if let Err(e) = store.write(*id, &ptrs.encode()) {
                log::warn!("indirection block {id} not restored: {e}");
                return Err(FsError::Inconsistent("indirection block not restored"));
            }
        }
        for id in self.fresh {
            store.release(id);
        }
        Ok(())
    }
}

impl PtrTable {
    /// Reads the indirection block at `existing`, or allocates a zeroed one in
    /// `Allocate` mode. `None` means resolution has to stop here.
    fn load<D: BlockDevice>(
        store: &mut BackStore<D>,
        existing: Option<BlockId>,
        mode: Mode,
        undo: &mut Undo,
    ) -> Result<Option<Self>> {
        if let Some(id) = existing {
            let ptrs = read_ptrs(store, id)?;
            return Ok(Some(Self { id, original: Some(ptrs.clone()), ptrs, dirty: false }));
        }
        Ok(obtain(store, None, mode, undo)?
            .map(|id| Self { id, ptrs: PtrBlock::zeroed(), original: None, dirty: true }))
    }

    fn store_if_dirty<D: BlockDevice>(&mut self, store: &BackStore<D>, undo: &mut Undo) -> Result<()> {
        if self.dirty {
            if let Some(original) = self.original.take() {
                undo.rewritten.push((self.id, original));
            }
            store.write(self.id, &self.ptrs.encode())?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Resolves slots `[from, to)` of this table, appending to `out`.
    /// Returns true if resolution stopped early.
    fn fill<D: BlockDevice>(
        &mut self,
        store: &mut BackStore<D>,
        inode: &mut Inode,
        from: usize,
        to: usize,
        mode: Mode,
        out: &mut Vec<BlockId>,
        undo: &mut Undo,
    ) -> Result<bool> {
        for idx in from..to {
            let existing = self.ptrs.get(idx);
            let Some(id) = obtain(store, existing, mode, undo)? else {
                return Ok(true);
            };
            if existing.is_none() {
                self.ptrs.set(idx, Some(id));
                self.dirty = true;
                inode.blocks += 1;
            }
            out.push(id);
        }
        Ok(false)
    }
}

fn read_ptrs<D: BlockDevice>(store: &BackStore<D>, id: BlockId) -> Result<PtrBlock> {
    let mut buf = [0; BLOCK_SIZE];
    store.read(id, &mut buf)?;
    Ok(PtrBlock::decode(&buf))
}

/// The block behind a slot: the existing one, a new one in `Allocate` mode,
/// or `None` when the slot is empty in `Lookup` mode or the store is full.
fn obtain<D: BlockDevice>(
    store: &mut BackStore<D>,
    existing: Option<BlockId>,
    mode: Mode,
    undo: &mut Undo,
) -> Result<Option<BlockId>> {
    match (existing, mode) {
        (Some(id), _) => Ok(Some(id)),
        (None, Mode::Lookup) => Ok(None),
        (None, Mode::Allocate) => match store.allocate() {
            Ok(id) => {
                log::debug!("allocated block {id}");
                undo.fresh.push(id);
                Ok(Some(id))
            }
            Err(FsError::Full) => {
                log::warn!("back store exhausted while mapping file blocks");
                Ok(None)
            }
            Err(e) => Err(e),
        },
    }
}

/// Physical ids of logical blocks `[first, first + count)` of `inode`.
///
/// The result is the resolved prefix of the range: it is shorter than
/// `count` when `Lookup` meets an empty slot, when the store runs out of
/// blocks, or past the largest addressable file. Every touched indirection
/// block is written back; the caller persists the inode.
///
/// On error the inode, the bitmap and any rewritten indirection block are
/// put back as they were.
pub fn resolve<D: BlockDevice>(
    store: &mut BackStore<D>,
    inode: &mut Inode,
    first: usize,
    count: usize,
    mode: Mode,
) -> Result<Vec<BlockId>> {
    let before = inode.clone();
    let mut out = Vec::new();
    let mut undo = Undo::default();
    match map_range(store, inode, first, count, mode, &mut out, &mut undo) {
        Ok(()) => Ok(out),
        Err(e) => {
            *inode = before;
            undo.rollback(store)?;
            Err(e)
        }
    }
}

fn map_range<D: BlockDevice>(
    store: &mut BackStore<D>,
    inode: &mut Inode,
    first: usize,
    count: usize,
    mode: Mode,
    out: &mut Vec<BlockId>,
    undo: &mut Undo,
) -> Result<()> {
    let end = first.saturating_add(count).min(MAX_FILE_BLOCKS);
    out.reserve(end.saturating_sub(first));
    let mut l = first;

    while l < end.min(DIRECT_PTRS) {
        let existing = inode.ptr(l);
        let Some(id) = obtain(store, existing, mode, undo)? else {
            return Ok(());
        };
        if existing.is_none() {
            inode.set_ptr(l, Some(id));
            inode.blocks += 1;
        }
        out.push(id);
        l += 1;
    }
    if l >= end {
        return Ok(());
    }

    if let Some(InnerId::Indirect1(from)) = InnerId::new(l) {
        let Some(mut table) = PtrTable::load(store, inode.ptr(INDIRECT_SLOT), mode, undo)? else {
            return Ok(());
        };
        let to = end.min(SINGLE_END) - DIRECT_PTRS;
        let stopped = table.fill(store, inode, from, to, mode, out, undo)?;
        table.store_if_dirty(store, undo)?;
        inode.set_ptr(INDIRECT_SLOT, Some(table.id));
        if stopped || end <= SINGLE_END {
            return Ok(());
        }
        l = SINGLE_END;
    }

    let Some(mut top) = PtrTable::load(store, inode.ptr(DOUBLE_INDIRECT_SLOT), mode, undo)? else {
        return Ok(());
    };

    while l < end {
        let Some(InnerId::Indirect2(outer, inner)) = InnerId::new(l) else {
            break;
        };
        let existing = top.ptrs.get(outer);
        let Some(mut second) = PtrTable::load(store, existing, mode, undo)? else {
            break;
        };
        let chunk_start = l - inner;
        let to = (end - chunk_start).min(PTRS_PER_BLOCK);
        let stopped = second.fill(store, inode, inner, to, mode, out, undo)?;
        second.store_if_dirty(store, undo)?;
        if existing.is_none() {
            top.ptrs.set(outer, Some(second.id));
            top.dirty = true;
        }
        if stopped {
            break;
        }
        l = chunk_start + PTRS_PER_BLOCK;
    }
    top.store_if_dirty(store, undo)?;
    inode.set_ptr(DOUBLE_INDIRECT_SLOT, Some(top.id));

    Ok(())
}

/// Frees every data and indirection block of `inode` and clears its pointers.
/// Returns the number of blocks released.
///
/// All indirection blocks are read before anything is freed, so a failed
/// read leaves the store and the inode untouched.
pub fn release_all<D: BlockDevice>(store: &mut BackStore<D>, inode: &mut Inode) -> Result<usize> {
    let mut doomed: Vec<BlockId> = (0..DIRECT_PTRS).filter_map(|slot| inode.ptr(slot)).collect();

    if let Some(indirect) = inode.ptr(INDIRECT_SLOT) {
        collect_table(store, indirect, &mut doomed)?;
    }
    if let Some(top) = inode.ptr(DOUBLE_INDIRECT_SLOT) {
        let ptrs = read_ptrs(store, top)?;
        for second in ptrs.0.iter().copied().filter(|&id| id != 0) {
            collect_table(store, second, &mut doomed)?;
        }
        doomed.push(top);
    }

    for &id in &doomed {
        store.release(id);
    }
    inode.ptrs = [0; BLOCK_PTRS];
    inode.blocks = 0;
    Ok(doomed.len())
}

/// Adds an indirection block and the data blocks it points to.
fn collect_table<D: BlockDevice>(store: &BackStore<D>, id: BlockId, doomed: &mut Vec<BlockId>) -> Result<()> {
    let ptrs = read_ptrs(store, id)?;
    doomed.extend(ptrs.0.iter().copied().filter(|&id| id != 0));
    doomed.push(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::back_store::tests::setup;
    use crate::block_dev::tests::FlakyDevice;
    use crate::layout::FileKind;
    use crate::FBM_BLOCKS;

    fn file() -> Inode {
        Inode::new("f", FileKind::Regular, 1, 0, 1).unwrap()
    }

    #[test]
    fn inner_id_tiers() {
        assert_eq!(InnerId::new(0), Some(InnerId::Direct(0)));
        assert_eq!(InnerId::new(5), Some(InnerId::Direct(5)));
        assert_eq!(InnerId::new(6), Some(InnerId::Indirect1(0)));
        assert_eq!(InnerId::new(517), Some(InnerId::Indirect1(511)));
        assert_eq!(InnerId::new(518), Some(InnerId::Indirect2(0, 0)));
        assert_eq!(InnerId::new(518 + 512 + 3), Some(InnerId::Indirect2(1, 3)));
        assert_eq!(InnerId::new(MAX_FILE_BLOCKS), None);
    }

    #[test]
    fn span() {
        assert_eq!(block_span(0, 1), (0, 1));
        assert_eq!(block_span(0, 1024), (0, 1));
        assert_eq!(block_span(0, 1025), (0, 2));
        assert_eq!(block_span(1023, 2), (0, 2));
        assert_eq!(block_span(1000, 2048), (0, 3));
        assert_eq!(block_span(5000, 0), (4, 0));
    }

    #[test]
    fn direct_allocation() {
        let mut store = setup();
        let mut inode = file();
        let free = store.free_blocks();

        let ids = resolve(&mut store, &mut inode, 0, 3, Mode::Allocate).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(inode.blocks, 3);
        assert_eq!(inode.ptr(2), Some(ids[2]));
        assert_eq!(store.free_blocks(), free - 3);

        // existing pointers are reported, never reallocated
        let again = resolve(&mut store, &mut inode, 0, 3, Mode::Allocate).unwrap();
        assert_eq!(again, ids);
        assert_eq!(store.free_blocks(), free - 3);
    }

    #[test]
    fn lookup_stops_at_empty_slot() {
        let mut store = setup();
        let mut inode = file();
        resolve(&mut store, &mut inode, 0, 2, Mode::Allocate).unwrap();
        let free = store.free_blocks();

        let ids = resolve(&mut store, &mut inode, 0, 5, Mode::Lookup).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(resolve(&mut store, &mut inode, 600, 4, Mode::Lookup).unwrap().is_empty());
        assert_eq!(store.free_blocks(), free);
    }

    #[test]
    fn single_indirect_tier() {
        let mut store = setup();
        let mut inode = file();
        let free = store.free_blocks();

        let ids = resolve(&mut store, &mut inode, 0, 10, Mode::Allocate).unwrap();
        assert_eq!(ids.len(), 10);
        assert_eq!(inode.blocks, 10);
        // ten data blocks and one indirection block
        assert_eq!(store.free_blocks(), free - 11);

        let indirect = inode.ptr(INDIRECT_SLOT).unwrap();
        let ptrs = read_ptrs(&store, indirect).unwrap();
        assert_eq!(ptrs.get(0), Some(ids[6]));
        assert_eq!(ptrs.get(3), Some(ids[9]));
        assert_eq!(ptrs.get(4), None);

        let tail = resolve(&mut store, &mut inode, 6, 4, Mode::Lookup).unwrap();
        assert_eq!(tail, &ids[6..]);
    }

    #[test]
    fn double_indirect_tier() {
        let mut store = setup();
        let mut inode = file();
        let free = store.free_blocks();

        // straddles the first and second second-level blocks
        let first = SINGLE_END + PTRS_PER_BLOCK - 1;
        let ids = resolve(&mut store, &mut inode, first, 2, Mode::Allocate).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(inode.blocks, 2);
        assert!(inode.ptr(0).is_none());
        assert!(inode.ptr(INDIRECT_SLOT).is_none());
        // top block, two second-level blocks, two data blocks
        assert_eq!(store.free_blocks(), free - 5);

        let top = read_ptrs(&store, inode.ptr(DOUBLE_INDIRECT_SLOT).unwrap()).unwrap();
        let second = read_ptrs(&store, top.get(1).unwrap()).unwrap();
        assert_eq!(second.get(0), Some(ids[1]));

        assert_eq!(resolve(&mut store, &mut inode, first, 2, Mode::Lookup).unwrap(), ids);
    }

    #[test]
    fn spans_all_tiers() {
        let mut store = setup();
        let mut inode = file();
        let count = SINGLE_END + 10;
        let ids = resolve(&mut store, &mut inode, 0, count, Mode::Allocate).unwrap();
        assert_eq!(ids.len(), count);
        assert_eq!(resolve(&mut store, &mut inode, 0, count, Mode::Lookup).unwrap(), ids);
    }

    #[test]
    fn stops_when_store_is_full() {
        let mut store = setup();
        let mut inode = file();
        while store.free_blocks() > 2 {
            store.allocate().unwrap();
        }
        let ids = resolve(&mut store, &mut inode, 0, 5, Mode::Allocate).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(inode.blocks, 2);
        assert!(inode.ptr(2).is_none());
    }

    #[test]
    fn past_largest_file() {
        let mut store = setup();
        let mut inode = file();
        let ids = resolve(&mut store, &mut inode, MAX_FILE_BLOCKS - 1, 3, Mode::Allocate).unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn release_everything() {
        let mut store = setup();
        let mut inode = file();
        let free = store.free_blocks();

        resolve(&mut store, &mut inode, 0, SINGLE_END + 3, Mode::Allocate).unwrap();
        let used = free - store.free_blocks();
        // data blocks plus indirect, double-indirect top and one second-level block
        assert_eq!(used, SINGLE_END + 3 + 3);

        let released = release_all(&mut store, &mut inode).unwrap();
        assert_eq!(released, used);
        assert_eq!(store.free_blocks(), free);
        assert_eq!(inode.blocks, 0);
        assert!((0..8).all(|slot| inode.ptr(slot).is_none()));
    }

    #[test]
    fn failed_table_write_is_undone() {
        let dev = Arc::new(FlakyDevice::new());
        let mut store = BackStore::create_on(Arc::clone(&dev)).unwrap();
        let mut inode = file();
        let free = store.free_blocks();

        // six direct blocks go first, the indirection block is the seventh
        dev.break_block(FBM_BLOCKS + DIRECT_PTRS);
        assert!(matches!(
            resolve(&mut store, &mut inode, 0, 8, Mode::Allocate),
            Err(FsError::ShortIo)
        ));
        assert_eq!(store.free_blocks(), free);
        assert_eq!(inode, file());

        dev.heal();
        assert_eq!(resolve(&mut store, &mut inode, 0, 8, Mode::Allocate).unwrap().len(), 8);
        assert_eq!(store.free_blocks(), free - 9);
    }

    #[test]
    fn rewritten_table_is_restored() {
        let dev = Arc::new(FlakyDevice::new());
        let mut store = BackStore::create_on(Arc::clone(&dev)).unwrap();
        let mut inode = file();
        resolve(&mut store, &mut inode, 0, 8, Mode::Allocate).unwrap();
        let saved = inode.clone();
        let free = store.free_blocks();

        // the double-indirect top block comes right after the rest of the single tier
        dev.break_block(FBM_BLOCKS + SINGLE_END + 1);
        assert!(resolve(&mut store, &mut inode, 0, SINGLE_END + 1, Mode::Allocate).is_err());
        assert_eq!(store.free_blocks(), free);
        assert_eq!(inode, saved);

        let ptrs = read_ptrs(&store, inode.ptr(INDIRECT_SLOT).unwrap()).unwrap();
        assert!(ptrs.get(1).is_some());
        assert_eq!(ptrs.get(2), None);
    }

    #[test]
    fn failed_release_frees_nothing() {
        let dev = Arc::new(FlakyDevice::new());
        let mut store = BackStore::create_on(Arc::clone(&dev)).unwrap();
        let mut inode = file();
        resolve(&mut store, &mut inode, 0, 8, Mode::Allocate).unwrap();
        let saved = inode.clone();
        let free = store.free_blocks();

        dev.break_block(inode.ptr(INDIRECT_SLOT).unwrap() as usize);
        assert!(matches!(release_all(&mut store, &mut inode), Err(FsError::ShortIo)));
        assert_eq!(store.free_blocks(), free);
        assert_eq!(inode, saved);

        dev.heal();
        assert_eq!(release_all(&mut store, &mut inode).unwrap(), 9);
    }
}
