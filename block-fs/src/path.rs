use crate::back_store::BackStore;
use crate::block_dev::BlockDevice;
use crate::directory::read_dir_block;
use crate::inode_table::InodeTable;
use crate::layout::FileKind;
use crate::{BlockId, FsError, InodeId, Result, FNAME_MAX, ROOT_INODE};

/// Where a path resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub inode: InodeId,
    /// Directory holding the entry. The root is its own parent.
    pub parent: InodeId,
    pub kind: FileKind,
    /// The directory block, for directories.
    pub data_block: Option<BlockId>,
}

/// Splits an absolute path into its components.
///
/// The path must start with `/` and must not end with it, so `/` itself is
/// rejected here; resolution treats it as the root separately. Repeated
/// slashes are collapsed. Every component must be shorter than `FNAME_MAX`.
pub fn parse_path(path: &str) -> Result<Vec<String>> {
    if path.is_empty() || !path.starts_with('/') || path.ends_with('/') {
        return Err(FsError::InvalidPath);
    }
    let parts: Vec<String> = path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect();
    if parts.is_empty() || parts.iter().any(|p| p.len() >= FNAME_MAX || p.contains('\0')) {
        return Err(FsError::InvalidPath);
    }
    Ok(parts)
}

/// Parent components and the terminal name of `path`.
pub fn split_parent(path: &str) -> Result<(Vec<String>, String)> {
    let mut parts = parse_path(path)?;
    let name = parts.pop().ok_or(FsError::InvalidPath)?;
    Ok((parts, name))
}

/// Walks `names` from the root. `Ok(None)` when a component is missing,
/// `NotDirectory` when a non-final component is a regular file.
pub fn walk<D: BlockDevice>(
    store: &BackStore<D>,
    table: &InodeTable,
    names: &[String],
) -> Result<Option<Location>> {
    let mut parent = ROOT_INODE;
    let mut current = ROOT_INODE;

    for name in names {
        let inode = table.read_inode(current);
        if inode.kind != Some(FileKind::Directory) {
            return Err(FsError::NotDirectory);
        }
        let block = inode.ptr(0).ok_or(FsError::Corrupt("directory without a block"))?;
        match read_dir_block(store, block)?.lookup(name) {
            Some((_, ino)) => {
                parent = current;
                current = ino;
            }
            None => return Ok(None),
        }
    }

    let inode = table.read_inode(current);
    let kind = inode.kind.ok_or(FsError::Corrupt("entry points at a free inode"))?;
    Ok(Some(Location {
        inode: current,
        parent,
        kind,
        data_block: match kind {
            FileKind::Directory => inode.ptr(0),
            FileKind::Regular => None,
        },
    }))
}

/// Resolves an absolute path, `/` included.
pub fn locate<D: BlockDevice>(
    store: &BackStore<D>,
    table: &InodeTable,
    path: &str,
) -> Result<Option<Location>> {
    if path == "/" {
        return walk(store, table, &[]);
    }
    walk(store, table, &parse_path(path)?)
}
