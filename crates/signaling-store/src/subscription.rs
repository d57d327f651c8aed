use parking_lot::Mutex;
use std::fmt;
use tokio::sync::mpsc;

type Release = Box<dyn FnOnce() + Send>;

/// Handle that cancels a store subscription exactly once.
///
/// Calling [`Unsubscribe::unsubscribe`] repeatedly is a no-op after the first call,
/// and dropping the handle releases it as well.
pub struct Unsubscribe {
    release: Mutex<Option<Release>>,
}

impl Unsubscribe {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn noop() -> Self {
        Self {
            release: Mutex::new(None),
        }
    }

    /// Returns `true` if this call performed the release.
    pub fn unsubscribe(&self) -> bool {
        let release = self.release.lock().take();
        match release {
            Some(release) => {
                release();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A stream of store notifications paired with its cancellation handle.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    handle: Unsubscribe,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, handle: Unsubscribe) -> Self {
        Self { rx, handle }
    }

    /// Next notification; `None` once the subscription is cancelled or the record is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(&self) -> bool {
        self.handle.unsubscribe()
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<T>, Unsubscribe) {
        (self.rx, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn release_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        drop(Unsubscribe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
