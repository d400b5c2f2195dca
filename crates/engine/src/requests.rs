use std::collections::HashMap;

use recordcache_core::ids::{HandleAllocator, RequestId, ResourceKey};

use crate::error::EngineError;

/// Handle for a pending fetch. Fetches for the same key share one request
/// while it is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub request: RequestId,
    pub key: ResourceKey,
    pub deduplicated: bool,
}

/// Why a fetch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    NotFound,
    Error(String),
}

#[derive(Debug, Default)]
pub struct RequestTracker {
    handles: HandleAllocator,
    by_key: HashMap<ResourceKey, RequestId>,
    by_request: HashMap<RequestId, ResourceKey>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fetch for `key`, joining the outstanding one if any.
    pub fn begin(&mut self, key: ResourceKey) -> FetchTicket {
        if let Some(request) = self.by_key.get(&key) {
            return FetchTicket {
                request: *request,
                key,
                deduplicated: true,
            };
        }
        let request = self.handles.next_request();
        self.by_key.insert(key, request);
        self.by_request.insert(request, key);
        FetchTicket {
            request,
            key,
            deduplicated: false,
        }
    }

    /// Close a request and return the key it was for. Requests already
    /// settled are unknown.
    pub fn settle(&mut self, request: RequestId) -> Result<ResourceKey, EngineError> {
        let key = self
            .by_request
            .remove(&request)
            .ok_or(EngineError::UnknownRequest(request))?;
        if self.by_key.get(&key) == Some(&request) {
            self.by_key.remove(&key);
        }
        Ok(key)
    }

    pub fn is_pending(&self, key: ResourceKey) -> bool {
        self.by_key.contains_key(&key)
    }

    pub fn rekey(&mut self, loser: ResourceKey, survivor: ResourceKey) {
        let Some(request) = self.by_key.remove(&loser) else {
            return;
        };
        self.by_request.insert(request, survivor);
        self.by_key.entry(survivor).or_insert(request);
    }

    pub fn pending(&self) -> usize {
        self.by_request.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_fetches_share_a_request() {
        let mut tracker = RequestTracker::new();
        let key = ResourceKey::from_raw(4);
        let first = tracker.begin(key);
        let second = tracker.begin(key);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.request, second.request);

        assert_eq!(tracker.settle(first.request).unwrap(), key);
        assert!(matches!(
            tracker.settle(second.request),
            Err(EngineError::UnknownRequest(_))
        ));
        assert!(!tracker.begin(key).deduplicated);
    }
}
