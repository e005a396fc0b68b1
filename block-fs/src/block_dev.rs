use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use spin::Mutex;

use crate::{Block, FsError, Result, BLOCK_COUNT, BLOCK_SIZE, STORE_BYTES};

/// Raw fixed-size block access. Knows nothing about allocation.
pub trait BlockDevice {
    fn read_block(&self, block_id: usize, buf: &mut Block) -> Result<()>;
    fn write_block(&self, block_id: usize, buf: &Block) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn short_io(e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => FsError::ShortIo,
        _ => FsError::Io(e),
    }
}

/// A block device backed by a single regular file of exactly `STORE_BYTES` bytes.
pub struct FileDevice(Mutex<File>);

impl FileDevice {
    /// Creates (or truncates) the file and sizes it to the whole store, zero-filled.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(STORE_BYTES)?;
        Ok(FileDevice(Mutex::new(file)))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        if file.metadata()?.len() != STORE_BYTES {
            return Err(FsError::CorruptBitmap);
        }
        Ok(FileDevice(Mutex::new(file)))
    }
}

impl BlockDevice for FileDevice {
    fn read_block(&self, block_id: usize, buf: &mut Block) -> Result<()> {
        let mut f = self.0.lock();
        f.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))?;
        f.read_exact(buf).map_err(short_io)
    }

    fn write_block(&self, block_id: usize, buf: &Block) -> Result<()> {
        let mut f = self.0.lock();
        f.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))?;
        f.write_all(buf).map_err(short_io)
    }

    fn flush(&self) -> Result<()> {
        self.0.lock().sync_data()?;
        Ok(())
    }
}

/// A block device held in memory. Blocks never written read back as zeroes.
pub struct MemDevice(Mutex<BTreeMap<usize, Box<Block>>>);

impl MemDevice {
    pub fn new() -> Self {
        MemDevice(Mutex::new(BTreeMap::new()))
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block_id: usize, buf: &mut Block) -> Result<()> {
        if block_id >= BLOCK_COUNT {
            return Err(FsError::ShortIo);
        }
        match self.0.lock().get(&block_id) {
            Some(block) => buf.copy_from_slice(block.as_ref()),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &Block) -> Result<()> {
        if block_id >= BLOCK_COUNT {
            return Err(FsError::ShortIo);
        }
        self.0.lock().insert(block_id, Box::new(*buf));
        Ok(())
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<T> {
    fn read_block(&self, block_id: usize, buf: &mut Block) -> Result<()> {
        (**self).read_block(block_id, buf)
    }

    fn write_block(&self, block_id: usize, buf: &Block) -> Result<()> {
        (**self).write_block(block_id, buf)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}
