use std::collections::VecDeque;

use spin::Mutex;

use crate::block_dev::BlockDevice;
use crate::{Block, Result};

const BLOCK_CACHE_SIZE: usize = 1 << 4;

struct CachedBlock {
    data: Box<Block>,
    block_id: usize,

    modified: bool,
}

// FIFO write-back cache
pub struct BlockCache<D: BlockDevice> {
    caches: Mutex<VecDeque<CachedBlock>>,
    block_dev: D,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(dev: D) -> Self {
        BlockCache { caches: Mutex::new(VecDeque::new()), block_dev: dev }
    }

    /// Writes back every modified block, keeping them cached.
    fn write_back(&self, caches: &mut VecDeque<CachedBlock>) -> Result<()> {
        for cache in caches.iter_mut().filter(|c| c.modified) {
            self.block_dev.write_block(cache.block_id, &cache.data)?;
            cache.modified = false;
        }
        Ok(())
    }

    fn get_cache<'a>(&self, caches: &'a mut VecDeque<CachedBlock>, block_id: usize) -> Result<&'a mut CachedBlock> {
        if let Some(idx) = caches.iter().position(|b| b.block_id == block_id) {
            return Ok(&mut caches[idx]);
        }

        let mut data = Box::new([0; crate::BLOCK_SIZE]);
        self.block_dev.read_block(block_id, &mut data)?;

        if caches.len() >= BLOCK_CACHE_SIZE {
            if let Some(evicted) = caches.pop_front() {
                if evicted.modified {
                    if let Err(e) = self.block_dev.write_block(evicted.block_id, &evicted.data) {
                        caches.push_front(evicted);
                        return Err(e);
                    }
                }
            }
        }
        caches.push_back(CachedBlock { data, block_id, modified: false });
        let last = caches.len() - 1;
        Ok(&mut caches[last])
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, block_id: usize, buf: &mut Block) -> Result<()> {
        let mut caches = self.caches.lock();
        let cache = self.get_cache(&mut caches, block_id)?;
        buf.copy_from_slice(cache.data.as_ref());
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &Block) -> Result<()> {
        let mut caches = self.caches.lock();
        let cache = self.get_cache(&mut caches, block_id)?;
        cache.data.copy_from_slice(buf);
        cache.modified = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.write_back(&mut self.caches.lock())?;
        self.block_dev.flush()
    }
}

impl<D: BlockDevice> Drop for BlockCache<D> {
    fn drop(&mut self) {
        if let Err(e) = self.write_back(&mut self.caches.lock()) {
            log::warn!("dropping block cache with unwritten blocks: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block_dev::tests::FlakyDevice;
    use crate::block_dev::MemDevice;
    use crate::{FsError, BLOCK_SIZE};

    #[test]
    fn block_cache_basic() {
        let inner_dev = Arc::new(MemDevice::new());
        let cache = BlockCache::new(Arc::clone(&inner_dev));

        let b1 = [6; BLOCK_SIZE];
        let mut buf = [0; BLOCK_SIZE];

        cache.read_block(233, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        cache.write_block(233, &b1).unwrap();
        cache.read_block(233, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 6));

        // Not written through yet.
        inner_dev.read_block(233, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        cache.write_block(666, &b1).unwrap();
        drop(cache);

        inner_dev.read_block(233, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 6));
        inner_dev.read_block(666, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 6));
    }

    #[test]
    fn eviction_writes_back() {
        let inner_dev = Arc::new(MemDevice::new());
        let cache = BlockCache::new(Arc::clone(&inner_dev));

        for id in 0..BLOCK_CACHE_SIZE + 1 {
            cache.write_block(100 + id, &[id as u8 + 1; BLOCK_SIZE]).unwrap();
        }

        let mut buf = [0; BLOCK_SIZE];
        inner_dev.read_block(100, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        inner_dev.read_block(100 + BLOCK_CACHE_SIZE, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        cache.flush().unwrap();
        inner_dev.read_block(100 + BLOCK_CACHE_SIZE, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b as usize == BLOCK_CACHE_SIZE + 1));
    }

    #[test]
    fn failed_eviction_keeps_block() {
        let inner_dev = Arc::new(FlakyDevice::new());
        let cache = BlockCache::new(Arc::clone(&inner_dev));
        for id in 0..BLOCK_CACHE_SIZE {
            cache.write_block(100 + id, &[7; BLOCK_SIZE]).unwrap();
        }

        inner_dev.break_block(100);
        assert!(matches!(cache.write_block(500, &[1; BLOCK_SIZE]), Err(FsError::ShortIo)));

        inner_dev.heal();
        let mut buf = [0; BLOCK_SIZE];
        cache.read_block(100, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
        cache.flush().unwrap();
        inner_dev.read_block(100, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }
}
