use alloc::sync::Arc;

use super::SpinLock;

pub type ShareMutex<T> = Arc<SpinLock<T>>;

pub fn new_share_mutex<T>(data: T) -> ShareMutex<T> {
    Arc::new(SpinLock::new(data))
}
