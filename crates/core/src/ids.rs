use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! handle_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn as_raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_id!(ResourceKey);
handle_id!(SubscriptionId);
handle_id!(LiveSetId);
handle_id!(RequestId);

/// Monotonic allocator for handle ids. Values are never handed out twice.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_raw(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_key(&self) -> ResourceKey {
        ResourceKey(self.next_raw())
    }

    pub fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.next_raw())
    }

    pub fn next_live_set(&self) -> LiveSetId {
        LiveSetId(self.next_raw())
    }

    pub fn next_request(&self) -> RequestId {
        RequestId(self.next_raw())
    }
}

/// Client-side identity of a resource, stable for the life of the process.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalKey(String);

impl LocalKey {
    pub fn generate() -> Self {
        Self(format!("@lid:{}", Uuid::now_v7()))
    }

    pub fn from_client(lid: impl Into<String>) -> Self {
        Self(lid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalKey({})", self.0)
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The resolved identity behind a `ResourceKey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub key: ResourceKey,
    pub resource_type: String,
    pub id: Option<String>,
    pub local_key: LocalKey,
}

impl Identifier {
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.resource_type, id),
            None => write!(f, "{}:{}", self.resource_type, self.local_key),
        }
    }
}
