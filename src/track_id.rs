//! Opaque track identifier supplied by the caller.

use std::fmt;
use std::sync::Arc;

/// Unique, caller-supplied identifier for a loaded track.
///
/// Cheap to clone (an `Arc<str>` under the hood) so it can be handed to
/// background threads (loader, watcher) without contending on the track
/// map.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TrackId(Arc<str>);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackId({:?})", self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
