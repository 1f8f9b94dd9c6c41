use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Hands out device identifiers of the form `<base>_<n>`.
///
/// A single counter is shared by every base name, so no two identifiers
/// produced by the same generator carry the same number.
#[derive(Debug, Default)]
pub struct DeviceIdGenerator {
    counter: AtomicUsize,
}

impl DeviceIdGenerator {
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a generator whose first identifier carries `first`.
    pub const fn starting_at(first: usize) -> Self {
        Self {
            counter: AtomicUsize::new(first),
        }
    }

    pub fn next_id(&self, base_name: &str) -> String {
        let ctr = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{base_name}_{ctr}")
    }
}
