//! Coalesce concurrent calls to an asynchronous producer.
//!
//! [`wrap`] turns a producer `Fn(A) -> impl Future<Output = Result<T, E>>`
//! into a [`Coalescer`]. Calls whose arguments fingerprint equal while an
//! earlier one is still pending share that earlier execution: the producer
//! runs once and every caller receives a clone of the same value, or the
//! same error. Nothing is kept once the execution settles, so the next call
//! runs the producer again. This suppresses concurrent duplicates only; it is
//! not a cache.
//!
//! Producers taking several arguments take them as a tuple.
//!
//! ```
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), coalesce::Error> {
//! let lookup = coalesce::wrap(|user: u64| async move {
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//!     Ok::<_, anyhow::Error>(format!("user-{user}"))
//! });
//!
//! let (a, b) = tokio::join!(lookup.call(7), lookup.call(7));
//! assert_eq!(a?, b?);
//! # Ok(())
//! # }
//! ```
use core::future::Future;
use core::marker::PhantomData;
use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::future::FusedFuture;
use futures::FutureExt;
use serde::Serialize;
use singleflight::{Group, Waiter};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

pub mod fingerprint;
mod types;

pub use fingerprint::{Fingerprinter, Json};
pub use singleflight::{Key, SharedError};
pub use types::{Error, Options};

/// Wraps `producer`, fingerprinting arguments by their JSON encoding.
pub fn wrap<A, T, E, F, Fut>(producer: F) -> Coalescer<A, T, F>
where
    A: Serialize + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Into<anyhow::Error> + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    wrap_with(producer, Json)
}

/// Wraps `producer`, deriving keys from arguments with `fingerprinter`.
pub fn wrap_with<A, T, E, F, Fut, P>(producer: F, fingerprinter: P) -> Coalescer<A, T, F, P>
where
    A: Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Into<anyhow::Error> + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    P: Fingerprinter<A>,
{
    let options = Options::default();
    Coalescer {
        producer: Arc::new(producer),
        fingerprinter: Arc::new(fingerprinter),
        group: Group::new()
            .named(options.name)
            .detached(options.detach),
        _args: PhantomData,
    }
}

/// A producer wrapped with duplicate call suppression.
///
/// Clones share pending calls. Coalescers built by separate [`wrap`] calls
/// never do, even around the same producer.
pub struct Coalescer<A, T, F, P = Json> {
    producer: Arc<F>,
    fingerprinter: Arc<P>,
    group: Group<T>,
    _args: PhantomData<fn(A)>,
}

impl<A, T, F, P> Clone for Coalescer<A, T, F, P> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            fingerprinter: self.fingerprinter.clone(),
            group: self.group.clone(),
            _args: PhantomData,
        }
    }
}

impl<A, T, F, P> fmt::Debug for Coalescer<A, T, F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

impl<A, T, F, P> Coalescer<A, T, F, P> {
    pub fn with_options(mut self, options: Options) -> Self {
        self.group = self.group.named(options.name).detached(options.detach);
        self
    }

    /// Number of calls currently pending, each possibly shared by many callers.
    pub fn in_flight(&self) -> usize {
        self.group.len()
    }
}

impl<A, T, F, P> Coalescer<A, T, F, P>
where
    A: Send + 'static,
    T: Clone + Send + Sync + 'static,
    P: Fingerprinter<A>,
{
    /// call runs the producer with `args`, unless a call with the same
    /// fingerprint is already pending, in which case the returned future
    /// resolves to that call's outcome instead.
    ///
    /// The fingerprint is computed and the call registered before this
    /// returns. A fingerprint failure yields a future that fails with
    /// [`Error::Fingerprint`] and leaves no trace behind.
    pub fn call<E, Fut>(&self, args: A) -> Call<T>
    where
        E: Into<anyhow::Error> + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = match self.fingerprinter.fingerprint(&args) {
            Ok(key) => key,
            Err(e) => {
                trace!(error = %e, "Fingerprint failed");
                return Call {
                    state: State::Rejected(Error::Fingerprint(e)),
                };
            }
        };
        let producer = self.producer.clone();
        let waiter = self.group.work(key, move || producer(args));
        Call {
            state: State::Waiting(waiter),
        }
    }
}

enum State<T> {
    Rejected(Error),
    Waiting(Waiter<T>),
    Done,
}

/// Future returned by [`Coalescer::call`].
pub struct Call<T> {
    state: State<T>,
}

impl<T> Call<T> {
    /// Whether this call shares a producer run another caller started.
    pub fn joined(&self) -> bool {
        match &self.state {
            State::Waiting(waiter) => waiter.joined(),
            State::Rejected(_) | State::Done => false,
        }
    }

    /// Fingerprint this call was registered under, until it completes.
    pub fn key(&self) -> Option<&Key> {
        match &self.state {
            State::Waiting(waiter) => Some(waiter.key()),
            State::Rejected(_) | State::Done => None,
        }
    }
}

impl<T> fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Rejected(error) => f.debug_tuple("Rejected").field(error).finish(),
            State::Waiting(waiter) => f.debug_tuple("Waiting").field(waiter).finish(),
            State::Done => f.write_str("Done"),
        }
    }
}

impl<T: Clone> Future for Call<T> {
    type Output = Result<T, Error>;

    /// Once the call has completed, further polls stay pending.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match mem::replace(&mut this.state, State::Done) {
            State::Waiting(mut waiter) => match waiter.poll_unpin(cx) {
                Poll::Ready(outcome) => outcome.map_err(Error::Producer),
                Poll::Pending => {
                    this.state = State::Waiting(waiter);
                    return Poll::Pending;
                }
            },
            State::Rejected(error) => Err(error),
            State::Done => return Poll::Pending,
        };
        Poll::Ready(outcome)
    }
}

impl<T: Clone> FusedFuture for Call<T> {
    fn is_terminated(&self) -> bool {
        matches!(self.state, State::Done)
    }
}
