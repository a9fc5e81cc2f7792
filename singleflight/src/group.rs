use anyhow::anyhow;
use core::any::Any;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle as Runtime;
use tracing::{debug, trace, trace_span, Instrument};

use crate::{Key, SharedError};

type Outcome<T> = Shared<BoxFuture<'static, Result<T, SharedError>>>;

struct Episode<T> {
    id: u64,
    outcome: Outcome<T>,
}

struct Inner<T> {
    table: RwLock<HashMap<Key, Episode<T>>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    /// Drops the entry for `key` unless a newer episode already owns it.
    fn remove(&self, key: &Key, id: u64) {
        let mut map = self.table.write();
        if map.get(key).is_some_and(|episode| episode.id == id) {
            map.remove(key);
            trace!("Entry removed");
        }
    }
}

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Clones share the same pending table. Two groups built with [`Group::new`]
/// never see each other's work.
pub struct Group<T> {
    inner: Arc<Inner<T>>,
    name: Arc<str>,
    detach: bool,
}

impl<T> Clone for Group<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            name: self.name.clone(),
            detach: self.detach,
        }
    }
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Group<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("detach", &self.detach)
            .field("in_flight", &self.len())
            .finish()
    }
}

impl<T> Group<T> {
    pub fn new() -> Group<T> {
        Group {
            inner: Arc::new(Inner {
                table: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
            name: Arc::from("singleflight"),
            detach: true,
        }
    }

    /// Label recorded on the span of every episode started by this group.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// When enabled (the default), each new unit of work is also spawned onto
    /// the current Tokio runtime, so it runs to completion and leaves the
    /// table even if every waiter is dropped. When disabled, or when no
    /// runtime is current, work only progresses while some waiter polls it.
    pub fn detached(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Number of units of work currently in flight.
    pub fn len(&self) -> usize {
        self.inner.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Group<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// work makes sure that only one execution is in-flight for a given key
    /// at a time. If a duplicate comes in while the work is pending, the
    /// returned waiter shares the original execution and receives the same
    /// result; `work` is not called for it.
    ///
    /// The lookup and registration happen before this returns. `work` itself
    /// is started on the current Tokio runtime, or, without one, the first
    /// time any waiter of the execution is polled. Panics raised by `work`
    /// are reported as errors to every waiter.
    pub fn work<F, Fut, E>(&self, key: Key, work: F) -> Waiter<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + Sync + 'static,
    {
        let map = self.inner.table.upgradable_read();
        trace!(%key, "Acquire read lock");
        if let Some(episode) = map.get(&key) {
            trace!(%key, episode = episode.id, "joining in-flight episode");
            let outcome = episode.outcome.clone();
            return Waiter {
                key,
                outcome,
                joined: true,
            };
        }

        let mut map = RwLockUpgradableReadGuard::upgrade(map);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let outcome = self.episode(key.clone(), id, work);
        map.insert(
            key.clone(),
            Episode {
                id,
                outcome: outcome.clone(),
            },
        );
        drop(map);
        trace!(%key, episode = id, "episode registered");

        if self.detach {
            match Runtime::try_current() {
                Ok(runtime) => drop(runtime.spawn(outcome.clone())),
                Err(_) => debug!(%key, "no Tokio runtime, work stays waiter-driven"),
            }
        }

        Waiter {
            key,
            outcome,
            joined: false,
        }
    }

    fn episode<F, Fut, E>(&self, key: Key, id: u64, work: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + Sync + 'static,
    {
        let span = trace_span!("episode", group = %self.name, %key, id);
        let inner: Weak<Inner<T>> = Arc::downgrade(&self.inner);

        async move {
            trace!("working...");
            let result = AssertUnwindSafe(async move { work().await })
                .catch_unwind()
                .await;
            let outcome: Result<T, SharedError> = match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Arc::new(e.into())),
                Err(panic) => Err(Arc::new(anyhow!(
                    "producer panicked: {}",
                    panic_message(&*panic)
                ))),
            };

            // The entry goes away in the same poll that settles the shared
            // outcome, so no caller can join an execution that already ended.
            if let Some(inner) = inner.upgrade() {
                inner.remove(&key, id);
            }
            match &outcome {
                Ok(_) => trace!("Work done"),
                Err(e) => debug!(error = %e, "Work failed"),
            }
            outcome
        }
        .instrument(span)
        .boxed()
        .shared()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "Box<dyn Any>"
    }
}

/// Waiter resolves to the outcome of one execution inside a [`Group`].
///
/// Dropping a waiter does not cancel the execution for the other waiters.
pub struct Waiter<T> {
    key: Key,
    outcome: Outcome<T>,
    joined: bool,
}

impl<T> Waiter<T> {
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Whether this waiter joined an execution another caller started.
    pub fn joined(&self) -> bool {
        self.joined
    }
}

impl<T> Clone for Waiter<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            outcome: self.outcome.clone(),
            joined: self.joined,
        }
    }
}

impl<T> fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("key", &self.key)
            .field("joined", &self.joined)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> Future for Waiter<T> {
    type Output = Result<T, SharedError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().outcome.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use futures::future::join_all;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};
    use tracing_test::traced_test;

    use super::Group;
    use crate::Key;

    #[tokio::test]
    #[traced_test]
    async fn test_work() {
        let group = Group::new();
        let res = group
            .work(Key::from("test_key"), || async { Ok::<i32, std::io::Error>(0) })
            .await;
        assert!(res.is_ok());
        assert_eq!(res.unwrap(), 0);
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_work_error() {
        let group = Group::<i32>::new();
        let res = group
            .work(Key::from("test_key"), || async { bail!("test error") })
            .await;
        assert!(res.is_err());
        assert_eq!(res.unwrap_err().to_string(), "test error");
        assert!(group.is_empty());

        let res = group
            .work(Key::from("test_key"), || async { Ok::<i32, std::io::Error>(0) })
            .await;
        assert_eq!(res.unwrap(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_duplicates_share_one_execution() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let calls = calls.clone();
                let gate = gate.clone();
                group.work(Key::from("k"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok::<_, anyhow::Error>("value".to_string())
                })
            })
            .collect();
        assert!(!waiters[0].joined());
        assert!(waiters[1].joined());
        assert!(waiters[2].joined());
        assert_eq!(group.len(), 1);

        gate.notify_one();
        let results = join_all(waiters).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for res in results {
            assert_eq!(res.unwrap(), "value");
        }
        assert!(group.is_empty());
        assert!(logs_contain("joining in-flight episode"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_distinct_keys_run_independently() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = ["a", "b", "a", "c"]
            .into_iter()
            .map(|key| {
                let calls = calls.clone();
                group.work(Key::from(key), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(key.len())
                })
            })
            .collect();
        assert_eq!(group.len(), 3);

        for res in join_all(waiters).await {
            assert_eq!(res.unwrap(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_waiters_share_the_same_error() {
        let group = Group::<u8>::new();
        let first = group.work(Key::from("e"), || async { bail!("unavailable") });
        let second = group.work(Key::from("e"), || async { Ok::<u8, anyhow::Error>(1) });

        let (first, second) = tokio::join!(first, second);
        let (first, second) = (first.unwrap_err(), second.unwrap_err());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.to_string(), "unavailable");
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panic_settles_as_error() {
        let group = Group::<u8>::new();
        let res = group
            .work(Key::from("p"), || async {
                if true {
                    panic!("boom");
                }
                Ok::<u8, anyhow::Error>(0)
            })
            .await;
        assert_eq!(res.unwrap_err().to_string(), "producer panicked: boom");
        assert!(group.is_empty());

        let res = group
            .work(Key::from("p"), || -> std::future::Ready<anyhow::Result<u8>> {
                panic!("{} boom", "sync")
            })
            .await;
        assert_eq!(res.unwrap_err().to_string(), "producer panicked: sync boom");
        assert!(group.is_empty());

        let res = group
            .work(Key::from("p"), || async { Ok::<u8, anyhow::Error>(2) })
            .await;
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reentrant_call_joins_pending_work() {
        let group = Group::<u32>::new();
        let nested = Arc::new(Mutex::new(None));

        let inner_group = group.clone();
        let slot = nested.clone();
        let outer = group.work(Key::from("r"), move || {
            let again = inner_group.work(Key::from("r"), || async { Ok::<u32, anyhow::Error>(2) });
            *slot.lock() = Some(again);
            async { Ok::<u32, anyhow::Error>(1) }
        });
        assert_eq!(outer.await.unwrap(), 1);

        let again = nested.lock().take().unwrap();
        assert!(again.joined());
        assert_eq!(again.await.unwrap(), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_timeout_does_not_disturb_pending_work() {
        let group = Group::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let first = group.work(Key::from("t"), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, anyhow::Error>(7)
        });
        assert!(tokio::time::timeout(Duration::from_millis(5), first)
            .await
            .is_err());
        assert_eq!(group.len(), 1);

        let second = group.work(Key::from("t"), || async { Ok::<_, anyhow::Error>(0) });
        assert!(second.joined());
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_abandoned_work_still_settles() {
        let group = Group::<u32>::new();
        let finished = Arc::new(AtomicUsize::new(0));

        let counter = finished.clone();
        let only = group.work(Key::from("abandoned"), move || async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(5)
        });
        assert!(tokio::time::timeout(Duration::from_millis(5), only)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_dropped_waiter_does_not_stop_work() {
        let group = Group::<u32>::new();
        let (tx, rx) = oneshot::channel();

        drop(group.work(Key::from("d"), move || async move {
            let _ = tx.send(());
            Ok::<_, anyhow::Error>(3)
        }));
        rx.await.unwrap();
        tokio::task::yield_now().await;
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_waiter_driven_work_waits_for_a_poll() {
        let group = Group::<u32>::new().detached(false);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        drop(group.work(Key::from("lazy"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(1) }
        }));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(group.len(), 1);

        let res = group
            .work(Key::from("lazy"), || async { Ok::<_, anyhow::Error>(2) })
            .await;
        assert_eq!(res.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[test]
    fn test_work_without_runtime_is_waiter_driven() {
        let group = Group::<u32>::new();
        let waiter = group.work(Key::from("sync"), || async { Ok::<_, anyhow::Error>(4) });
        assert_eq!(group.len(), 1);
        assert_eq!(futures::executor::block_on(waiter).unwrap(), 4);
        assert!(group.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_groups_do_not_share_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let work = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        };

        let left = Group::new();
        let right = Group::new();
        let a = left.work(Key::from("same"), work(calls.clone()));
        let b = right.work(Key::from("same"), work(calls.clone()));
        assert!(!b.joined());

        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
