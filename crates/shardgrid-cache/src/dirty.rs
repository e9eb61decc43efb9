//! Dirty-bit table for selective refresh.
//!
//! Watcher callbacks on the metadata store mark categories dirty; the next
//! refresh reloads exactly the dirty categories. Bits are atomics, so
//! notification is lock-free and a bit set while a reload is in flight is
//! never lost (set-after-clear wins and triggers the next refresh).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A category of cluster data with its own watcher and dirty bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeCategory {
    IdealState,
    LiveInstance,
    InstanceConfig,
    ResourceConfig,
}

impl ChangeCategory {
    pub const ALL: [ChangeCategory; 4] = [
        ChangeCategory::IdealState,
        ChangeCategory::LiveInstance,
        ChangeCategory::InstanceConfig,
        ChangeCategory::ResourceConfig,
    ];
}

/// One atomic bit per change category. Every bit starts set, so the first
/// refresh loads the whole world.
#[derive(Debug)]
pub(crate) struct DirtyFlags {
    ideal_state: AtomicBool,
    live_instance: AtomicBool,
    instance_config: AtomicBool,
    resource_config: AtomicBool,
}

impl DirtyFlags {
    pub(crate) fn new() -> Self {
        Self {
            ideal_state: AtomicBool::new(true),
            live_instance: AtomicBool::new(true),
            instance_config: AtomicBool::new(true),
            resource_config: AtomicBool::new(true),
        }
    }

    fn bit(&self, category: ChangeCategory) -> &AtomicBool {
        match category {
            ChangeCategory::IdealState => &self.ideal_state,
            ChangeCategory::LiveInstance => &self.live_instance,
            ChangeCategory::InstanceConfig => &self.instance_config,
            ChangeCategory::ResourceConfig => &self.resource_config,
        }
    }

    pub(crate) fn mark(&self, category: ChangeCategory) {
        self.bit(category).store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_all(&self) {
        for category in ChangeCategory::ALL {
            self.mark(category);
        }
    }

    /// Atomically read-and-clear a bit. Returns whether it was set.
    pub(crate) fn take(&self, category: ChangeCategory) -> bool {
        self.bit(category).swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_set(&self, category: ChangeCategory) -> bool {
        self.bit(category).load(Ordering::SeqCst)
    }
}

/// Cloneable handle for watcher callbacks to mark categories dirty without
/// touching the cache itself.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    flags: Arc<DirtyFlags>,
}

impl ChangeNotifier {
    pub(crate) fn new(flags: Arc<DirtyFlags>) -> Self {
        Self { flags }
    }

    /// Mark a category dirty; it will be reloaded on the next refresh.
    pub fn notify_data_change(&self, category: ChangeCategory) {
        self.flags.mark(category);
    }

    /// Path-scoped variant. The cache reloads at category granularity, so
    /// the path only feeds diagnostics.
    pub fn notify_path_change(&self, category: ChangeCategory, path: &str) {
        tracing::debug!(?category, path, "change notification");
        self.notify_data_change(category);
    }

    /// Mark every category dirty, forcing a whole-world reload.
    pub fn require_full_refresh(&self) {
        self.flags.mark_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_bits_start_set() {
        let flags = DirtyFlags::new();
        for category in ChangeCategory::ALL {
            assert!(flags.is_set(category));
        }
    }

    #[test]
    fn take_clears_the_bit() {
        let flags = DirtyFlags::new();
        assert!(flags.take(ChangeCategory::IdealState));
        assert!(!flags.is_set(ChangeCategory::IdealState));
        assert!(!flags.take(ChangeCategory::IdealState));
        // Other bits untouched.
        assert!(flags.is_set(ChangeCategory::LiveInstance));
    }

    #[test]
    fn set_after_clear_survives() {
        let flags = Arc::new(DirtyFlags::new());
        assert!(flags.take(ChangeCategory::LiveInstance));

        // A watcher firing after the bit was cleared must re-arm it.
        let notifier = ChangeNotifier::new(flags.clone());
        notifier.notify_data_change(ChangeCategory::LiveInstance);

        assert!(flags.take(ChangeCategory::LiveInstance));
    }

    #[test]
    fn require_full_refresh_sets_everything() {
        let flags = Arc::new(DirtyFlags::new());
        for category in ChangeCategory::ALL {
            flags.take(category);
        }

        let notifier = ChangeNotifier::new(flags.clone());
        notifier.require_full_refresh();

        for category in ChangeCategory::ALL {
            assert!(flags.is_set(category));
        }
    }
}
