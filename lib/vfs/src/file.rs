use alloc::sync::Arc;

use spin::Once;
use systype::{SysError, SysResult};

/// A readable file.
///
/// Reads are stateless: the caller supplies the offset, the file returns up
/// to `buf.len()` bytes and reports how many it produced. A read at or past
/// the end yields 0.
pub trait File: Send + Sync {
    /// Size of the file in bytes.
    fn size(&self) -> usize;

    /// Reads at `off` into `buf`, returning the number of bytes read.
    fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize>;

    /// Whether the file may back a memory mapping. Files that cannot be
    /// mapped refuse here and the mapping attempt fails before any zone is
    /// kept.
    fn mmap(&self) -> SysResult<()> {
        Err(SysError::ENODEV)
    }
}

/// A path resolver producing files.
pub trait Filesystem: Send + Sync {
    /// Opens the file at `path`.
    fn open(&self, path: &str) -> SysResult<Arc<dyn File>>;
}

static ROOT: Once<Arc<dyn Filesystem>> = Once::new();

/// Registers the root filesystem. Later registrations are ignored.
pub fn register_root(fs: Arc<dyn Filesystem>) {
    ROOT.call_once(|| fs);
}

/// Opens `path` through the root filesystem.
///
/// # Errors
/// Returns `ENOENT` when no root is registered or the path does not
/// resolve.
pub fn open(path: &str) -> SysResult<Arc<dyn File>> {
    ROOT.get().ok_or(SysError::ENOENT)?.open(path)
}
