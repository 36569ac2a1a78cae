//! # Push-Feed Plumbing
//!
//! Shared pieces of the subscription and monitor connections: the listener
//! registry read by the dispatch thread, and the handle that owns the thread.
//!
//! ## Design Principles
//! 1. **Snapshot Delivery**: The dispatcher copies the listener list under
//!    the lock and calls listeners outside it, so a listener may add or
//!    remove listeners without deadlocking. A listener added while an event
//!    is being delivered first sees the next event.
//! 2. **Panic Isolation**: A panicking listener is logged and skipped; it
//!    must not take the whole feed down.
//! 3. **No Self-Join**: Closing from inside a listener callback detaches the
//!    thread instead of joining itself.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{error, warn};

use rkv_common::RkvResult;

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered, lock-protected listener list.
pub(crate) struct ListenerRegistry<L: ?Sized> {
    listeners: Mutex<Vec<(ListenerId, Arc<L>)>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub(crate) fn new() -> Self {
        ListenerRegistry {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns true when a listener with `id` was registered.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Copies the current listeners in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Calls `f` on every listener registered at the time of the call.
    pub(crate) fn notify(&self, f: impl Fn(&L)) {
        for listener in self.snapshot() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&*listener)));
            if outcome.is_err() {
                error!("listener panicked while handling an event");
            }
        }
    }
}

/// Owns one background dispatch thread.
///
/// Every method takes `&self` and never holds a lock while joining, so a
/// listener on the thread itself may query or close its connection.
pub(crate) struct DispatchThread {
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

/// Clears the running flag when the thread body returns or unwinds.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DispatchThread {
    pub(crate) fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> RkvResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(Arc::clone(&running));
        let handle = thread::Builder::new().name(name).spawn(move || {
            let _guard = guard;
            body();
        })?;
        Ok(DispatchThread {
            handle: Mutex::new(Some(handle)),
            running,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Waits for the thread to exit. The socket must already be shut down.
    ///
    /// Only the first caller joins; later or concurrent callers return at once.
    pub(crate) fn join(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Closed from a listener callback; the loop exits on its own.
            return;
        }
        if handle.join().is_err() {
            warn!("dispatch thread terminated by a panic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    trait Counter: Send + Sync {
        fn hit(&self);
    }

    struct Hits(AtomicUsize);

    impl Counter for Hits {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panics;

    impl Counter for Panics {
        fn hit(&self) {
            panic!("listener failure");
        }
    }

    #[test]
    fn test_add_remove_preserves_order() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let first = Arc::new(Hits(AtomicUsize::new(0)));
        let second = Arc::new(Hits(AtomicUsize::new(0)));
        let first_id = registry.add(first.clone());
        registry.add(second.clone());
        assert_eq!(registry.len(), 2);

        registry.notify(|listener| listener.hit());
        assert!(registry.remove(first_id));
        assert!(!registry.remove(first_id));
        registry.notify(|listener| listener.hit());

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let registry: ListenerRegistry<dyn Counter> = ListenerRegistry::new();
        let hits = Arc::new(Hits(AtomicUsize::new(0)));
        registry.add(Arc::new(Panics));
        registry.add(hits.clone());
        registry.notify(|listener| listener.hit());
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_waits_for_exit() {
        let thread = DispatchThread::spawn("rkv-test".into(), || {}).unwrap();
        thread.join();
        assert!(!thread.is_running());
        thread.join();
    }

    #[test]
    fn test_running_flag_clears_after_panic() {
        let thread =
            DispatchThread::spawn("rkv-test-panic".into(), || panic!("body failure")).unwrap();
        thread.join();
        assert!(!thread.is_running());
    }

    #[test]
    fn test_body_can_query_while_being_joined() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let slot: Arc<Mutex<Option<Arc<DispatchThread>>>> = Arc::new(Mutex::new(None));
        let body_slot = Arc::clone(&slot);

        let thread = Arc::new(
            DispatchThread::spawn("rkv-test-reentrant".into(), move || {
                let _ = release_rx.recv();
                let me = body_slot.lock().clone().unwrap();
                entered_tx.send(me.is_running()).unwrap();
                me.join();
            })
            .unwrap(),
        );
        *slot.lock() = Some(Arc::clone(&thread));

        let joiner = {
            let thread = Arc::clone(&thread);
            std::thread::spawn(move || thread.join())
        };
        release_tx.send(()).unwrap();
        assert!(entered_rx.recv().unwrap());
        joiner.join().unwrap();
        // The body may have taken the handle itself and detached.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while thread.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!thread.is_running());
        slot.lock().take();
    }
}
