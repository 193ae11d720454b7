//! The kernel's log sink: a bounded in-memory ring of formatted records.

use alloc::{collections::VecDeque, format, string::String};

use logger::LogSinkIf;
use mutex::SpinLock;

const KLOG_CAPACITY: usize = 256;

static KLOG: SpinLock<VecDeque<String>> = SpinLock::new(VecDeque::new());

struct LogSinkImpl;

#[crate_interface::impl_interface]
impl LogSinkIf for LogSinkImpl {
    fn write_log(record: &log::Record) {
        let line = format!("[{:>5}] {}", record.level(), record.args());
        let mut klog = KLOG.lock();
        if klog.len() == KLOG_CAPACITY {
            klog.pop_front();
        }
        klog.push_back(line);
    }
}

/// Snapshot of the retained log lines, oldest first.
pub fn klog_snapshot() -> alloc::vec::Vec<String> {
    KLOG.lock().iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_land_in_the_ring() {
        crate::init();
        log::set_max_level(log::LevelFilter::Info);
        log::info!("hello from the ring");
        assert!(klog_snapshot()
            .iter()
            .any(|line| line.contains("hello from the ring")));
    }
}

