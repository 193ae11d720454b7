mod share_mutex;
mod spin_mutex;

pub use share_mutex::{new_share_mutex, ShareMutex};
pub use spin_mutex::{MutexGuard, SpinMutex};

pub type SpinLock<T> = SpinMutex<T, Spin>;

/// Low-level support for a mutex flavor.
pub trait MutexSupport {
    /// Guard data
    type GuardData;
    /// Called before lock() & try_lock()
    fn before_lock() -> Self::GuardData;
    /// Called when MutexGuard dropping
    fn after_unlock(_: &mut Self::GuardData);
}

/// Plain spinning support with no interrupt management.
#[derive(Debug)]
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}
