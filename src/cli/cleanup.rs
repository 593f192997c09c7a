use once_cell::sync::Lazy;
use parking_lot::Mutex;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Interrupt cleanup registry: closures that must run if the operator hits Ctrl+C
/// while a scenario still owns external resources (local helper processes).
#[derive(Default)]
struct CleanupRegistry {
    next_id: u64,
    items: Vec<(u64, Cleanup)>,
}

impl CleanupRegistry {
    fn register(&mut self, f: Cleanup) -> u64 {
        self.next_id += 1;
        self.items.push((self.next_id, f));
        self.next_id
    }

    fn remove(&mut self, id: u64) {
        self.items.retain(|(item, _)| *item != id);
    }

    fn take_all(&mut self) -> Vec<(u64, Cleanup)> {
        std::mem::take(&mut self.items)
    }
}

static GLOBAL_CLEANUP: Lazy<Mutex<CleanupRegistry>> =
    Lazy::new(|| Mutex::new(CleanupRegistry::default()));

/// Register a cleanup closure; the returned id drops it again via [`unregister_cleanup`].
pub fn register_cleanup(f: impl FnOnce() + Send + 'static) -> u64 {
    GLOBAL_CLEANUP.lock().register(Box::new(f))
}

pub fn unregister_cleanup(id: u64) {
    GLOBAL_CLEANUP.lock().remove(id);
}

/// Run all registered cleanup closures. Safe to call multiple times.
pub fn run_cleanups() {
    // Take the closures out first so a cleanup may itself touch the registry.
    let items = GLOBAL_CLEANUP.lock().take_all();
    log::debug!("Running {} cleanup handlers", items.len());
    for (_, f) in items {
        // Each cleanup gets its own catch_unwind to avoid aborting others
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    }
}

/// Install the Ctrl+C handler: run cleanups, then exit with the conventional 130.
pub fn install_interrupt_handler() {
    if let Err(err) = ctrlc::set_handler(|| {
        log::warn!("Interrupted, cleaning up local helpers");
        run_cleanups();
        std::process::exit(130);
    }) {
        log::warn!("Failed to install Ctrl+C handler: {err}");
    }
}
