//! The kernel symbol table consulted for undefined symbols while linking a
//! kernel module.

use alloc::string::String;

use hashbrown::HashMap;
use mutex::SpinLock;
use spin::Lazy;

static KSYMS: Lazy<SpinLock<HashMap<String, usize>>> =
    Lazy::new(|| SpinLock::new(HashMap::new()));

/// Registers `name` at `addr`, replacing any previous binding.
pub fn register(name: &str, addr: usize) {
    KSYMS.lock().insert(String::from(name), addr);
}

/// Resolves `name` to an address.
pub fn lookup(name: &str) -> Option<usize> {
    KSYMS.lock().get(name).copied()
}
