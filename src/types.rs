use singleflight::SharedError;
use std::borrow::Cow;
use thiserror::Error;

/// Options represents the options for a coalescer
#[derive(Clone, Debug)]
pub struct Options {
    /// Name is recorded on the tracing span of every pending call. default is "coalesce"
    /// useful to tell apart several coalescers in the same process.
    pub name: Cow<'static, str>,
    /// Detach spawns every new call onto the current Tokio runtime. default is true
    /// the producer then runs to completion, and the call leaves the pending set,
    /// even when every caller has dropped its future or timed out.
    /// if disabled, or without a runtime, the call only progresses while some
    /// caller polls it.
    pub detach: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("coalesce"),
            detach: true,
        }
    }
}

/// Failure of a single coalesced call.
#[derive(Debug, Error)]
pub enum Error {
    /// The call arguments could not be fingerprinted. The producer was not
    /// called and no call was registered.
    #[error("unable to fingerprint call arguments: {0:#}")]
    Fingerprint(anyhow::Error),
    /// The producer failed. Every caller that shared the call holds the same
    /// `Arc`.
    #[error("{0:#}")]
    Producer(SharedError),
}
