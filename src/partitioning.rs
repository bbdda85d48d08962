//! # Partitioning
//!
//! Keys decide where an event is processed. A stream configured with a
//! [`Key`] extracts one or more values from each event and joins them into a
//! single routing string; the [`Hasher`] maps that string to a number and
//! [`partition_for`] reduces it modulo the partition count.
//!
//! ## Usage
//!
//! ```rust
//! use s4rs::partitioning::{DefaultHasher, Hasher, Key, partition_for};
//!
//! let key: Key<(String, String)> =
//!     Key::new(|e: &(String, String)| vec![e.0.clone(), e.1.clone()]);
//! let routing = key.get(&("tenant".to_string(), "user".to_string()));
//! assert_eq!(routing, "tenant^user");
//!
//! let partition = partition_for(DefaultHasher.hash(&routing), 4);
//! assert!(partition < 4);
//! ```

use std::fmt;
use std::sync::Arc;

/// Separator used to join multiple key values.
pub const DEFAULT_SEPARATOR: &str = "^";

/// Extracts key values from an event.
pub trait KeyFinder<E>: Send + Sync {
    /// Returns the key values of `event`, in a stable order.
    fn get(&self, event: &E) -> Vec<String>;
}

impl<E, F> KeyFinder<E> for F
where
    F: Fn(&E) -> Vec<String> + Send + Sync,
{
    fn get(&self, event: &E) -> Vec<String> {
        self(event)
    }
}

/// Routing key of a keyed stream.
pub struct Key<E> {
    finder: Arc<dyn KeyFinder<E>>,
    separator: String,
}

impl<E> Clone for Key<E> {
    fn clone(&self) -> Self {
        Self {
            finder: Arc::clone(&self.finder),
            separator: self.separator.clone(),
        }
    }
}

impl<E> fmt::Debug for Key<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("separator", &self.separator)
            .finish_non_exhaustive()
    }
}

impl<E: 'static> Key<E> {
    /// Creates a key joined with [`DEFAULT_SEPARATOR`].
    pub fn new(finder: impl KeyFinder<E> + 'static) -> Self {
        Self::with_separator(finder, DEFAULT_SEPARATOR)
    }

    /// Creates a key joined with a custom separator.
    pub fn with_separator(
        finder: impl KeyFinder<E> + 'static,
        separator: impl Into<String>,
    ) -> Self {
        Self {
            finder: Arc::new(finder),
            separator: separator.into(),
        }
    }

    /// Returns the routing string for `event`.
    pub fn get(&self, event: &E) -> String {
        self.finder.get(event).join(&self.separator)
    }
}

/// Maps a routing string to a non-negative number.
///
/// Implementations must be pure: every process in the cluster has to agree on
/// the value for a given key.
pub trait Hasher: Send + Sync {
    /// Hashes `key`.
    fn hash(&self, key: &str) -> u64;
}

/// 64-bit FNV-1a.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHasher;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl Hasher for DefaultHasher {
    fn hash(&self, key: &str) -> u64 {
        key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
    }
}

/// Reduces a hash to a partition index in `0..partition_count`.
///
/// A partition count of zero (no topology yet) maps everything to 0.
pub fn partition_for(hash: u64, partition_count: usize) -> usize {
    if partition_count == 0 {
        return 0;
    }
    (hash % partition_count as u64) as usize
}
