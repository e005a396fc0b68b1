use std::io;

use thiserror::Error;

use crate::BlockId;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid backing file name")]
    InvalidName,
    #[error("invalid path")]
    InvalidPath,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("block {0} is reserved or not allocated")]
    InvalidBlock(BlockId),

    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,

    #[error("no free blocks left in the store")]
    Full,
    #[error("inode table exhausted")]
    NoFreeInode,
    #[error("directory is full")]
    DirectoryFull,
    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("short I/O on the backing file")]
    ShortIo,

    #[error("free block bitmap is corrupt")]
    CorruptBitmap,
    #[error("filesystem is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("operation left the filesystem inconsistent: {0}")]
    Inconsistent(&'static str),
}

pub type Result<T> = core::result::Result<T, FsError>;
