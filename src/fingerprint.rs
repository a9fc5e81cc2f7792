//! Deriving a [`Key`] from call arguments.
//!
//! Two calls are duplicates when their arguments produce equal keys. The
//! default [`Json`] fingerprinter encodes the arguments with `serde_json`:
//!
//! - sequences and tuples keep their order,
//! - struct fields follow declaration order,
//! - `BTreeMap` and `serde_json::Value` objects come out sorted by key,
//! - `HashMap` and `HashSet` follow their iteration order.
//!
//! The last point means two equal hash maps may fingerprint differently and
//! miss each other. Keys are not re-sorted after encoding; use ordered
//! collections in arguments, or plug in a custom [`Fingerprinter`].
use anyhow::Context;
use serde::Serialize;
use singleflight::Key;

/// Maps an argument value to the key its calls are coalesced under.
///
/// Must be a pure function of `args`.
pub trait Fingerprinter<A: ?Sized> {
    fn fingerprint(&self, args: &A) -> anyhow::Result<Key>;
}

impl<A, F> Fingerprinter<A> for F
where
    A: ?Sized,
    F: Fn(&A) -> anyhow::Result<Key>,
{
    fn fingerprint(&self, args: &A) -> anyhow::Result<Key> {
        self(args)
    }
}

/// Default fingerprinter: the JSON encoding of the arguments.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl<A> Fingerprinter<A> for Json
where
    A: Serialize + ?Sized,
{
    fn fingerprint(&self, args: &A) -> anyhow::Result<Key> {
        let encoded = serde_json::to_string(args).context("arguments are not JSON encodable")?;
        Ok(Key::from(encoded))
    }
}
