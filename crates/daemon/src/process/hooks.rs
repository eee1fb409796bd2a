use std::sync::Arc;

use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct HookList {
    hooks: Vec<Hook>,
    ran: bool,
}

/// Callbacks run once, in registration order, after the servers stop.
#[derive(Clone, Default)]
pub struct ShutdownHooks {
    inner: Arc<Mutex<HookList>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook. Returns false, dropping the hook, if the hooks already ran.
    pub fn register(&self, hook: impl FnOnce() + Send + 'static) -> bool {
        let mut list = self.inner.lock();
        if list.ran {
            tracing::warn!("shutdown hook registered after shutdown, ignoring it");
            return false;
        }
        list.hooks.push(Box::new(hook));
        true
    }

    /// Run every registered hook in order. Only the first call does anything.
    ///
    /// Returns how many hooks ran.
    pub fn run(&self) -> usize {
        let hooks = {
            let mut list = self.inner.lock();
            if list.ran {
                return 0;
            }
            list.ran = true;
            std::mem::take(&mut list.hooks)
        };
        let count = hooks.len();
        for hook in hooks {
            hook();
        }
        tracing::debug!(count, "shutdown hooks done");
        count
    }

    pub fn has_run(&self) -> bool {
        self.inner.lock().ran
    }

    pub fn len(&self) -> usize {
        self.inner.lock().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = self.inner.lock();
        f.debug_struct("ShutdownHooks")
            .field("pending", &list.hooks.len())
            .field("ran", &list.ran)
            .finish()
    }
}
