//! Stream registry
//!
//! Maps stream identifiers to their shared media source. One lock guards the
//! map and is only ever held for the map operation itself; session setup and
//! teardown happen outside it so unrelated streams never wait on each other.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CodecProfile;
use crate::error::{Error, Result};
use crate::source::SharedMediaSource;
use crate::types::StreamId;

/// Registry of active streams, at most one source per id
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, Arc<SharedMediaSource>>>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a new publisher.
    ///
    /// Fails with [`Error::Conflict`] without touching the existing entry if
    /// the id is taken.
    pub fn register(&self, id: StreamId, codec: CodecProfile) -> Result<Arc<SharedMediaSource>> {
        let mut streams = self.streams.lock();

        if streams.contains_key(&id) {
            debug!(stream_id = %id, "Stream already registered");
            return Err(Error::Conflict(id));
        }

        let source = Arc::new(SharedMediaSource::new(id.clone(), codec));
        streams.insert(id.clone(), Arc::clone(&source));

        info!(stream_id = %id, total_streams = streams.len(), "Stream registered");
        Ok(source)
    }

    /// Find the source currently registered under `id`
    pub fn lookup(&self, id: &StreamId) -> Result<Arc<SharedMediaSource>> {
        self.streams
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Remove `id` if, and only if, it still maps to `source`.
    ///
    /// A late teardown of an old publisher must not evict a newer one that
    /// reused the same id.
    pub fn remove(&self, id: &StreamId, source: &Arc<SharedMediaSource>) -> bool {
        let mut streams = self.streams.lock();

        match streams.get(id) {
            Some(current) if Arc::ptr_eq(current, source) => {
                streams.remove(id);
                info!(stream_id = %id, total_streams = streams.len(), "Stream removed");
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: &StreamId) -> bool {
        self.streams.lock().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// All registered sources, in no particular order
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<SharedMediaSource>> {
        self.streams.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> StreamId {
        StreamId::parse(s).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = StreamRegistry::new();
        let source = registry.register(id("cam1"), CodecProfile::default()).unwrap();

        let found = registry.lookup(&id("cam1")).unwrap();
        assert!(Arc::ptr_eq(&source, &found));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_register_conflicts() {
        let registry = StreamRegistry::new();
        let original = registry.register(id("cam1"), CodecProfile::default()).unwrap();

        let result = registry.register(id("cam1"), CodecProfile::default());
        assert!(matches!(result, Err(Error::Conflict(ref s)) if s.as_str() == "cam1"));

        // The original entry is untouched
        let found = registry.lookup(&id("cam1")).unwrap();
        assert!(Arc::ptr_eq(&original, &found));
    }

    #[test]
    fn test_lookup_missing() {
        let registry = StreamRegistry::new();
        assert!(matches!(
            registry.lookup(&id("doesnotexist")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_requires_same_source() {
        let registry = StreamRegistry::new();
        let old = registry.register(id("cam1"), CodecProfile::default()).unwrap();
        assert!(registry.remove(&id("cam1"), &old));
        assert!(registry.is_empty());

        let new = registry.register(id("cam1"), CodecProfile::default()).unwrap();
        // Stale teardown of the old source leaves the new one alone
        assert!(!registry.remove(&id("cam1"), &old));
        assert!(registry.contains(&id("cam1")));
        assert!(registry.remove(&id("cam1"), &new));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_single_winner() {
        let registry = Arc::new(StreamRegistry::new());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry.register(id("race"), CodecProfile::default()).is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
