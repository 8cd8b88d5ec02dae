//! Request-scoped batching loader.
//!
//! Every `load(key)` issued before control returns to the executor is queued;
//! the first caller to resume takes the whole queue and makes one batch call,
//! then hands each waiter the result for its key. Identical in-flight keys
//! share one slot, and resolved keys are cached until the entity manager
//! clears its loaders after a flush.

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, Outcome, try_outcome};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Future returned by a batch function: one entry per requested key, in order.
pub type BatchFuture<'a, V> = LocalBoxFuture<'a, Outcome<Vec<Option<V>>, Error>>;

type BatchFn<K, V> = dyn for<'a> Fn(&'a Cx, Vec<K>) -> BatchFuture<'a, V>;
type Waiter<V> = oneshot::Sender<std::result::Result<Option<V>, String>>;

/// A de-duplicating, batching cache for one `(operation, batch key)` pair.
pub struct DataLoader<K, V> {
    inner: Rc<LoaderInner<K, V>>,
}

impl<K, V> Clone for DataLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

struct LoaderInner<K, V> {
    name: String,
    batch: Box<BatchFn<K, V>>,
    state: RefCell<LoaderState<K, V>>,
}

struct LoaderState<K, V> {
    cache: HashMap<K, Option<V>>,
    queue: Vec<K>,
    waiters: HashMap<K, Vec<Waiter<V>>>,
    batches: usize,
}

impl<K, V> DataLoader<K, V>
where
    K: Eq + Hash + Clone + Debug + 'static,
    V: Clone + 'static,
{
    pub fn new<F>(name: impl Into<String>, batch: F) -> Self
    where
        F: for<'a> Fn(&'a Cx, Vec<K>) -> BatchFuture<'a, V> + 'static,
    {
        Self {
            inner: Rc::new(LoaderInner {
                name: name.into(),
                batch: Box::new(batch),
                state: RefCell::new(LoaderState {
                    cache: HashMap::new(),
                    queue: Vec::new(),
                    waiters: HashMap::new(),
                    batches: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of batch calls made so far.
    pub fn batches(&self) -> usize {
        self.inner.state.borrow().batches
    }

    /// Resolve one key. `Ok(None)` means the batch had no result for it.
    pub async fn load(&self, cx: &Cx, key: K) -> Outcome<Option<V>, Error> {
        let rx = {
            let mut state = self.inner.state.borrow_mut();
            if let Some(hit) = state.cache.get(&key) {
                return Outcome::Ok(hit.clone());
            }
            let (tx, rx) = oneshot::channel();
            if let Some(list) = state.waiters.get_mut(&key) {
                list.push(tx);
            } else {
                state.waiters.insert(key.clone(), vec![tx]);
                state.queue.push(key);
            }
            rx
        };

        YieldNow::default().await;

        let batch = std::mem::take(&mut self.inner.state.borrow_mut().queue);
        if !batch.is_empty() {
            try_outcome!(self.dispatch(cx, batch).await);
        }

        match rx.await {
            Ok(Ok(value)) => Outcome::Ok(value),
            Ok(Err(message)) => Outcome::Err(Error::Custom(message)),
            Err(oneshot::Canceled) => Outcome::Err(Error::Custom(format!(
                "{} batch was dropped before completing",
                self.inner.name
            ))),
        }
    }

    /// Resolve several keys through one batch.
    pub async fn load_many(&self, cx: &Cx, keys: Vec<K>) -> Outcome<Vec<Option<V>>, Error> {
        let loads = keys.into_iter().map(|key| self.load(cx, key));
        let mut out = Vec::new();
        for outcome in futures::future::join_all(loads).await {
            out.push(try_outcome!(outcome));
        }
        Outcome::Ok(out)
    }

    /// Seed the cache, e.g. with rows already fetched by another path.
    pub fn prime(&self, key: K, value: Option<V>) {
        self.inner.state.borrow_mut().cache.entry(key).or_insert(value);
    }

    pub fn clear(&self) {
        self.inner.state.borrow_mut().cache.clear();
    }

    async fn dispatch(&self, cx: &Cx, keys: Vec<K>) -> Outcome<(), Error> {
        let mut guard = DispatchGuard {
            inner: &self.inner,
            keys: Some(keys.clone()),
        };
        self.inner.state.borrow_mut().batches += 1;
        tracing::debug!(
            loader = %self.inner.name,
            keys = keys.len(),
            "Dispatching batch"
        );

        let outcome = (self.inner.batch)(cx, keys.clone()).await;
        guard.keys = None;

        match outcome {
            Outcome::Ok(values) if values.len() == keys.len() => {
                let mut state = self.inner.state.borrow_mut();
                for (key, value) in keys.into_iter().zip(values) {
                    for tx in state.waiters.remove(&key).unwrap_or_default() {
                        let _ = tx.send(Ok(value.clone()));
                    }
                    state.cache.insert(key, value);
                }
                Outcome::Ok(())
            }
            Outcome::Ok(values) => {
                let message = format!(
                    "{} batch returned {} results for {} keys",
                    self.inner.name,
                    values.len(),
                    keys.len()
                );
                self.fail(&keys, &message);
                Outcome::Err(Error::Custom(message))
            }
            Outcome::Err(e) => {
                self.fail(&keys, &e.to_string());
                Outcome::Err(e)
            }
            Outcome::Cancelled(reason) => {
                self.fail(&keys, "batch cancelled");
                Outcome::Cancelled(reason)
            }
            Outcome::Panicked(payload) => {
                self.fail(&keys, "batch panicked");
                Outcome::Panicked(payload)
            }
        }
    }

    fn fail(&self, keys: &[K], message: &str) {
        let mut state = self.inner.state.borrow_mut();
        for key in keys {
            for tx in state.waiters.remove(key).unwrap_or_default() {
                let _ = tx.send(Err(message.to_string()));
            }
        }
    }
}

/// Drops the waiters of a batch whose future was dropped mid-flight, so
/// their receivers observe cancellation instead of hanging.
struct DispatchGuard<'a, K: Eq + Hash, V> {
    inner: &'a LoaderInner<K, V>,
    keys: Option<Vec<K>>,
}

impl<K: Eq + Hash, V> Drop for DispatchGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(keys) = self.keys.take() {
            if let Ok(mut state) = self.inner.state.try_borrow_mut() {
                for key in &keys {
                    state.waiters.remove(key);
                }
            }
        }
    }
}

/// Returns `Pending` exactly once so sibling futures can enqueue their keys.
#[derive(Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            task.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn squares(calls: Rc<RefCell<Vec<Vec<i64>>>>) -> DataLoader<i64, i64> {
        DataLoader::new("squares", move |_cx, keys: Vec<i64>| {
            let calls = Rc::clone(&calls);
            Box::pin(async move {
                calls.borrow_mut().push(keys.clone());
                Outcome::Ok(
                    keys.iter()
                        .map(|k| if *k < 0 { None } else { Some(k * k) })
                        .collect(),
                )
            })
        })
    }

    #[test]
    fn concurrent_loads_share_one_batch() {
        let cx = Cx::for_testing();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = squares(Rc::clone(&calls));

        futures::executor::block_on(async {
            let results = futures::future::join_all((1..=5).map(|k| loader.load(&cx, k))).await;
            let values: Vec<Option<i64>> = results
                .into_iter()
                .map(|o| match o {
                    Outcome::Ok(v) => v,
                    _ => panic!("unexpected outcome"),
                })
                .collect();
            assert_eq!(values, vec![Some(1), Some(4), Some(9), Some(16), Some(25)]);
        });

        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0], vec![1, 2, 3, 4, 5]);
        assert_eq!(loader.batches(), 1);
    }

    #[test]
    fn duplicate_keys_are_requested_once_and_cached() {
        let cx = Cx::for_testing();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = squares(Rc::clone(&calls));

        futures::executor::block_on(async {
            let (a, b) = futures::join!(loader.load(&cx, 3), loader.load(&cx, 3));
            assert!(matches!(a, Outcome::Ok(Some(9))));
            assert!(matches!(b, Outcome::Ok(Some(9))));
            assert!(matches!(loader.load(&cx, 3).await, Outcome::Ok(Some(9))));
            assert!(matches!(loader.load(&cx, -1).await, Outcome::Ok(None)));
        });

        assert_eq!(*calls.borrow(), vec![vec![3], vec![-1]]);
    }

    #[test]
    fn batch_errors_reach_every_waiter() {
        let cx = Cx::for_testing();
        let attempts = Rc::new(Cell::new(0));
        let counter = Rc::clone(&attempts);
        let loader: DataLoader<i64, i64> = DataLoader::new("broken", move |_cx, _keys| {
            counter.set(counter.get() + 1);
            Box::pin(async { Outcome::Err(Error::Custom("db down".into())) })
        });

        futures::executor::block_on(async {
            let (a, b) = futures::join!(loader.load(&cx, 1), loader.load(&cx, 2));
            for outcome in [a, b] {
                match outcome {
                    Outcome::Err(e) => assert!(e.to_string().contains("db down")),
                    _ => panic!("expected error"),
                }
            }
        });
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn misaligned_batch_results_fail_loudly() {
        let cx = Cx::for_testing();
        let loader: DataLoader<i64, i64> = DataLoader::new("short", |_cx, _keys| {
            Box::pin(async { Outcome::Ok(vec![Some(1)]) })
        });
        futures::executor::block_on(async {
            let outcome = loader.load_many(&cx, vec![1, 2]).await;
            match outcome {
                Outcome::Err(e) => assert!(e.to_string().contains("1 results for 2 keys")),
                _ => panic!("expected error"),
            }
        });
    }

    #[test]
    fn primed_keys_skip_the_batch() {
        let cx = Cx::for_testing();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let loader = squares(Rc::clone(&calls));
        loader.prime(7, Some(70));
        futures::executor::block_on(async {
            assert!(matches!(loader.load(&cx, 7).await, Outcome::Ok(Some(70))));
        });
        assert!(calls.borrow().is_empty());
    }
}
