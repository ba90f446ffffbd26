use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::{Error, Result};

/// Produces a model. Called at most once per successful load.
pub trait ModelLoader<M: ?Sized>: Send + Sync {
    fn load(&self) -> Result<Arc<M>>;
}

impl<M: ?Sized, F> ModelLoader<M> for F
where
    F: Fn() -> Result<Arc<M>> + Send + Sync,
{
    fn load(&self) -> Result<Arc<M>> {
        self()
    }
}

enum State<M: ?Sized> {
    Empty,
    Loading,
    Ready(Arc<M>),
}

struct Inner<M: ?Sized> {
    state: State<M>,
    // Bumped every time a load attempt finishes, so waiters can tell whether
    // the attempt they waited on is the one that failed.
    attempt: u64,
    last_failure: Option<String>,
}

/// Handle to a model that is loaded on first use.
///
/// The first caller of [`LazyModel::get`] runs the loader; concurrent callers
/// block on a condvar until that load finishes and then observe the same
/// model, or the same failure. A failed load leaves the handle empty so a
/// later call retries. Once loaded the model is shared read-only.
pub struct LazyModel<M: ?Sized> {
    name: String,
    loader: Box<dyn ModelLoader<M>>,
    inner: Mutex<Inner<M>>,
    loaded: Condvar,
}

impl<M: ?Sized> LazyModel<M> {
    pub fn new<S: Into<String>, L: ModelLoader<M> + 'static>(name: S, loader: L) -> Self {
        Self {
            name: name.into(),
            loader: Box::new(loader),
            inner: Mutex::new(Inner {
                state: State::Empty,
                attempt: 0,
                last_failure: None,
            }),
            loaded: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loads the model if needed. No-op when already loaded.
    pub fn initialize(&self) -> Result<()> {
        self.get().map(|_| ())
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.lock().state, State::Ready(_))
    }

    /// Returns the loaded model, loading it first if necessary.
    pub fn get(&self) -> Result<Arc<M>> {
        let mut inner = self.lock();
        loop {
            if let State::Ready(m) = &inner.state {
                return Ok(m.clone());
            }
            if !matches!(inner.state, State::Loading) {
                break;
            }

            let waiting_on = inner.attempt;
            inner = self
                .loaded
                .wait_while(inner, |i| matches!(i.state, State::Loading))
                .unwrap_or_else(|e| e.into_inner());
            if matches!(inner.state, State::Empty) && inner.attempt == waiting_on + 1 {
                let msg = inner.last_failure.clone().unwrap_or_default();
                return Err(Error::ModelLoad(msg));
            }
        }

        inner.state = State::Loading;
        drop(inner);

        info!(model = %self.name, "loading model");
        let res = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load()))
            .unwrap_or_else(|_| Err(Error::ModelLoad("loader panicked".into())));

        let mut inner = self.lock();
        inner.attempt += 1;
        let out = match res {
            Ok(m) => {
                info!(model = %self.name, "model loaded");
                inner.state = State::Ready(m.clone());
                inner.last_failure = None;
                Ok(m)
            }
            Err(e) => {
                let msg = match e {
                    Error::ModelLoad(msg) => msg,
                    other => other.to_string(),
                };
                warn!(model = %self.name, error = %msg, "model load failed");
                inner.state = State::Empty;
                inner.last_failure = Some(msg.clone());
                Err(Error::ModelLoad(msg))
            }
        };
        drop(inner);
        self.loaded.notify_all();
        out
    }

    fn lock(&self) -> MutexGuard<'_, Inner<M>> {
        // The state is always left consistent before any code that can panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn loads_once_and_caches() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads2 = loads.clone();
        let lazy = LazyModel::new("counter", move || -> Result<Arc<u32>> {
            loads2.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(5u32))
        });
        assert!(!lazy.is_loaded());
        lazy.initialize().unwrap();
        lazy.initialize().unwrap();
        assert_eq!(*lazy.get().unwrap(), 5);
        assert!(lazy.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_calls_load_exactly_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads2 = loads.clone();
        let lazy = Arc::new(LazyModel::new("slow", move || -> Result<Arc<String>> {
            loads2.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            Ok(Arc::new(String::from("weights")))
        }));

        let barrier = Arc::new(Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    lazy.get().unwrap()
                })
            })
            .collect();

        let models: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        for m in &models {
            assert!(Arc::ptr_eq(m, &models[0]));
        }
    }

    #[test]
    fn racing_callers_share_a_failure_then_retry_succeeds() {
        let loads = Arc::new(AtomicUsize::new(0));
        let loads2 = loads.clone();
        let lazy = Arc::new(LazyModel::new("flaky", move || -> Result<Arc<u8>> {
            let n = loads2.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            if n == 0 {
                Err(Error::ModelLoad("weights missing".into()))
            } else {
                Ok(Arc::new(1u8))
            }
        }));

        let barrier = Arc::new(Barrier::new(4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lazy = lazy.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    lazy.get().map(|_| ()).map_err(|e| e.to_string())
                })
            })
            .collect();
        for t in threads {
            let err = t.join().unwrap().unwrap_err();
            assert!(err.contains("weights missing"), "{}", err);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!lazy.is_loaded());

        lazy.initialize().unwrap();
        assert!(lazy.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn other_errors_become_model_load() {
        let lazy: LazyModel<u8> = LazyModel::new("io", || -> Result<Arc<u8>> {
            Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")))
        });
        assert!(matches!(lazy.get(), Err(Error::ModelLoad(_))));
    }
}
