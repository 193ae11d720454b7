//! Read-only introspection streams.
//!
//! Four System V inventories plus the memory summary, exposed as [`File`]s
//! in a flat node table. The id lists show one id per line and only the
//! objects the calling thread may read; the content is regenerated on
//! every read, with the offset applied to the rendered text.

use alloc::{format, string::String, sync::Arc, vec::Vec};
use core::fmt::Write as _;

use config::{
    ipc::{MSGMAX, MSGMNB, MSGMNI, SEMMNI, SEMMSL, SEMOPM, SEMVMX, SHMLBA, SHMMAX, SHMMIN, SHMMNI},
    mm::PAGE_SIZE,
};
use mutex::SpinLock;
use spin::{Lazy, Once};
use systype::{SysError, SysResult};
use vfs::File;

use crate::{
    ipc::{self, msg::MSG_TABLE, sem::SEM_TABLE, shm::SHM_TABLE, IpcObject},
    processor::current_task,
    vm::KSPACE,
};

static NODES: Lazy<SpinLock<Vec<(&'static str, Arc<dyn File>)>>> =
    Lazy::new(|| SpinLock::new(Vec::new()));
static INIT: Once<()> = Once::new();

/// Registers `file` under `name`.
///
/// # Panics
/// Panics on a duplicate name; node registration happens once at boot.
pub fn mknode(name: &'static str, file: Arc<dyn File>) {
    let mut nodes = NODES.lock();
    if nodes.iter().any(|(n, _)| *n == name) {
        panic!("sysfs: duplicate node {}", name);
    }
    nodes.push((name, file));
}

/// Looks a node up by name.
pub fn lookup(name: &str) -> Option<Arc<dyn File>> {
    NODES
        .lock()
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, f)| Arc::clone(f))
}

/// Registers the built-in nodes. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        mknode("sysv/shmlist", Arc::new(ShmListFile));
        mknode("sysv/semlist", Arc::new(SemListFile));
        mknode("sysv/msglist", Arc::new(MsgListFile));
        mknode("sysv/limits", Arc::new(LimitsFile));
        mknode("meminfo", Arc::new(MemInfoFile));
    });
}

/// Serves a window of regenerated content.
fn read_window(content: &str, off: usize, buf: &mut [u8]) -> SysResult<usize> {
    let bytes = content.as_bytes();
    if off >= bytes.len() {
        return Ok(0);
    }
    let len = buf.len().min(bytes.len() - off);
    buf[..len].copy_from_slice(&bytes[off..off + len]);
    Ok(len)
}

macro_rules! list_file {
    ($name:ident, $table:expr) => {
        struct $name;

        impl $name {
            fn generate(&self) -> String {
                let cred = *current_task().cred();
                let mut out = String::new();
                for obj in $table.snapshot() {
                    if ipc::ipc_hasperm(&obj.perm(), &cred, 0o4).is_ok() {
                        writeln!(out, "{}", obj.id()).unwrap();
                    }
                }
                out
            }
        }

        impl File for $name {
            fn size(&self) -> usize {
                self.generate().len()
            }

            fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize> {
                read_window(&self.generate(), off, buf)
            }
        }
    };
}

list_file!(ShmListFile, SHM_TABLE);
list_file!(SemListFile, SEM_TABLE);
list_file!(MsgListFile, MSG_TABLE);

struct LimitsFile;

impl LimitsFile {
    fn generate(&self) -> String {
        let mut out = String::new();
        macro_rules! print_limit {
            ($name:ident) => {
                writeln!(out, concat!(stringify!($name), " {}"), $name as u64).unwrap();
            };
        }
        print_limit!(SHMMIN);
        print_limit!(SHMMAX);
        print_limit!(SHMLBA);
        print_limit!(SHMMNI);
        print_limit!(SEMOPM);
        print_limit!(SEMMSL);
        print_limit!(SEMMNI);
        print_limit!(SEMVMX);
        print_limit!(MSGMNI);
        print_limit!(MSGMAX);
        print_limit!(MSGMNB);
        print_limit!(PAGE_SIZE);
        out
    }
}

impl File for LimitsFile {
    fn size(&self) -> usize {
        self.generate().len()
    }

    fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize> {
        read_window(&self.generate(), off, buf)
    }
}

/// Formats a byte count with a binary-ish human suffix.
fn mem_fmt(n: usize) -> String {
    if n >= 1_000_000_000 {
        format!("{}.{:02} GB", n / 1_000_000_000, (n / 10_000_000) % 100)
    } else if n >= 1_000_000 {
        format!("{}.{:02} MB", n / 1_000_000, (n / 10_000) % 100)
    } else if n >= 1_000 {
        format!("{}.{:02} kB", n / 1_000, (n / 10) % 100)
    } else {
        format!("{} B", n)
    }
}

struct MemInfoFile;

impl MemInfoFile {
    fn generate(&self) -> String {
        let mut out = String::new();
        let phys_used = mm::frame::frames_used() * PAGE_SIZE;
        let phys_size = mm::frame::frames_total() * PAGE_SIZE;
        let kvirt_size = KSPACE.total();
        let kvirt_used = kvirt_size - KSPACE.available();
        writeln!(
            out,
            "PhysicalUsed:      {:#018x} ({})",
            phys_used,
            mem_fmt(phys_used)
        )
        .unwrap();
        writeln!(
            out,
            "PhysicalSize:      {:#018x} ({})",
            phys_size,
            mem_fmt(phys_size)
        )
        .unwrap();
        writeln!(
            out,
            "KernelVirtualUsed: {:#018x} ({})",
            kvirt_used,
            mem_fmt(kvirt_used)
        )
        .unwrap();
        writeln!(
            out,
            "KernelVirtualSize: {:#018x} ({})",
            kvirt_size,
            mem_fmt(kvirt_size)
        )
        .unwrap();
        out
    }
}

impl File for MemInfoFile {
    fn size(&self) -> usize {
        self.generate().len()
    }

    fn read_at(&self, off: usize, buf: &mut [u8]) -> SysResult<usize> {
        read_window(&self.generate(), off, buf)
    }
}
