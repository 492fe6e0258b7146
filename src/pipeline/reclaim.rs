//! Resource reclamation scope for one pipeline run.
//!
//! Decoded bitmaps are large next to the memory ceiling, so every buffer a
//! run owns is scoped to that run and freed by ordinary drops. The
//! [`ReclaimScope`] guard marks the end of the run: when it drops (success,
//! classified error, or unwinding panic) it logs the release and fires the
//! optional [`ReclaimHook`], which lets a deployment return freed pages to
//! the OS (e.g. an allocator purge) before the next request starts.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Called once at the end of every pipeline run.
pub type ReclaimHook = Arc<dyn Fn() + Send + Sync>;

/// Guard covering a single pipeline run.
pub struct ReclaimScope {
    hook: Option<ReclaimHook>,
    started: Instant,
}

impl ReclaimScope {
    pub fn enter(hook: Option<ReclaimHook>) -> Self {
        Self {
            hook,
            started: Instant::now(),
        }
    }
}

impl fmt::Debug for ReclaimScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimScope")
            .field("hook", &self.hook.is_some())
            .field("started", &self.started)
            .finish()
    }
}

impl Drop for ReclaimScope {
    fn drop(&mut self) {
        debug!(
            "Pipeline scope closed after {}ms; buffers released",
            self.started.elapsed().as_millis()
        );
        if let Some(ref hook) = self.hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook() -> (ReclaimHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }), count)
    }

    #[test]
    fn hook_fires_once_on_drop() {
        let (hook, count) = counting_hook();
        {
            let _scope = ReclaimScope::enter(Some(hook));
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_fires_on_early_return() {
        fn run(hook: ReclaimHook) -> Result<(), &'static str> {
            let _scope = ReclaimScope::enter(Some(hook));
            Err::<(), _>("boom")?;
            Ok(())
        }
        let (hook, count) = counting_hook();
        assert!(run(hook).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_fires_while_unwinding() {
        let (hook, count) = counting_hook();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scope = ReclaimScope::enter(Some(hook));
            panic!("decoder exploded");
        }));
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_hook_is_fine() {
        drop(ReclaimScope::enter(None));
    }
}
