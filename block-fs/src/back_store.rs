use std::path::Path;

use crate::bitmap::Bitmap;
use crate::block_dev::{BlockDevice, FileDevice};
use crate::{Block, BlockId, FsError, Result, BLOCK_COUNT, BLOCK_SIZE, FBM_BLOCKS};

pub struct BackStore<D: BlockDevice> {
    device: D,
    fbm: Bitmap,
}

fn check_name(path: &Path) -> Result<()> {
    if matches!(path.to_str(), Some("" | "\n")) {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

impl BackStore<FileDevice> {
    /// Creates a new zero-filled backing file and reserves the bitmap blocks.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        check_name(path)?;
        Self::create_on(FileDevice::create(path)?)
    }

    /// Opens an existing backing file and reloads its bitmap.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        check_name(path)?;
        Self::open_on(FileDevice::open(path)?)
    }
}

impl<D: BlockDevice> BackStore<D> {
    pub fn create_on(device: D) -> Result<Self> {
        let mut fbm = Bitmap::new(BLOCK_COUNT);
        for id in 0..FBM_BLOCKS {
            fbm.set(id);
        }
        let mut store = Self { device, fbm };
        store.flush()?;
        Ok(store)
    }

    pub fn open_on(device: D) -> Result<Self> {
        let mut bytes = Vec::with_capacity(crate::FBM_BYTES);
        let mut block = [0; BLOCK_SIZE];
        for id in 0..FBM_BLOCKS {
            device.read_block(id, &mut block)?;
            bytes.extend_from_slice(&block);
        }
        let fbm = Bitmap::from_bytes(BLOCK_COUNT, &bytes).ok_or(FsError::CorruptBitmap)?;
        if (0..FBM_BLOCKS).any(|id| !fbm.test(id)) {
            return Err(FsError::CorruptBitmap);
        }
        Ok(Self { device, fbm })
    }

    /// Persists the bitmap into its reserved region.
    pub fn flush(&mut self) -> Result<()> {
        let bytes = self.fbm.to_bytes();
        let mut block = [0; BLOCK_SIZE];
        for (id, chunk) in bytes.chunks(BLOCK_SIZE).enumerate() {
            block.copy_from_slice(chunk);
            self.device.write_block(id, &block)?;
        }
        self.device.flush()
    }

    /// Persists the bitmap and gives up the device.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// First-fit allocation from block 0.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let id = self.fbm.first_zero().ok_or(FsError::Full)?;
        self.fbm.set(id);
        Ok(id as BlockId)
    }

    /// Marks a specific block used. Fails without mutation if it already is.
    pub fn request(&mut self, id: BlockId) -> bool {
        !self.fbm.set(id as usize)
    }

    /// Frees a block. Ids inside the bitmap region are silently ignored.
    pub fn release(&mut self, id: BlockId) {
        if (id as usize) < FBM_BLOCKS {
            return;
        }
        self.fbm.reset(id as usize);
    }

    pub fn is_allocated(&self, id: BlockId) -> bool {
        self.fbm.test(id as usize)
    }

    pub fn free_blocks(&self) -> usize {
        BLOCK_COUNT - self.fbm.count_ones()
    }

    fn check_access(&self, id: BlockId) -> Result<()> {
        if (id as usize) < FBM_BLOCKS || !self.fbm.test(id as usize) {
            return Err(FsError::InvalidBlock(id));
        }
        Ok(())
    }

    pub fn read(&self, id: BlockId, buf: &mut Block) -> Result<()> {
        self.check_access(id)?;
        self.device.read_block(id as usize, buf)
    }

    pub fn write(&self, id: BlockId, buf: &Block) -> Result<()> {
        self.check_access(id)?;
        self.device.write_block(id as usize, buf)
    }
}
