use alloc::{string::String, sync::Arc, vec::Vec};

use hashbrown::HashMap;
use spin::Mutex;
use systype::{SysError, SysResult};

use crate::{File, Filesystem};

/// A file whose contents live in a byte vector.
pub struct RamFile {
    data: Vec<u8>,
}

impl RamFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl File for RamFile {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize> {
        if off >= self.data.len() {
            return Ok(0);
        }
        let len = buf.len().min(self.data.len() - off);
        buf[..len].copy_from_slice(&self.data[off..off + len]);
        Ok(len)
    }

    fn mmap(&self) -> SysResult<()> {
        Ok(())
    }
}

/// A path-to-file map acting as a filesystem.
pub struct MapFs {
    files: Mutex<HashMap<String, Arc<dyn File>>>,
}

impl MapFs {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Binds `path` to `file`, replacing any previous binding.
    pub fn insert(&self, path: &str, file: Arc<dyn File>) {
        self.files.lock().insert(String::from(path), file);
    }
}

impl Default for MapFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for MapFs {
    fn open(&self, path: &str) -> SysResult<Arc<dyn File>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or(SysError::ENOENT)
    }
}
