use std::sync::{Arc, Mutex, Once};

use recordcache_core::{
    config::CacheConfig,
    field_value::FieldValue,
    ids::{ResourceKey, SubscriptionId},
    schema::StaticSchema,
    CoreError,
};
use recordcache_engine::{Cache, ChangeKind, EngineError};

/// Blog-shaped schema shared by the integration suites.
///
/// `user.friends` is asynchronous; everything else is synchronous.
/// `post.tags` has no inverse.
pub const BLOG_SCHEMA: &str = r#"
[types.user]
attributes = ["name", "email"]

[types.user.relationships.posts]
kind = "to-many"
type = "post"
inverse = "author"

[types.user.relationships.bestFriend]
kind = "to-one"
type = "user"
inverse = "bestFriend"

[types.user.relationships.friends]
kind = "to-many"
type = "user"
inverse = "friends"
async = true

[types.post]
attributes = ["title", "body"]

[types.post.relationships.author]
kind = "to-one"
type = "user"
inverse = "posts"

[types.post.relationships.comments]
kind = "to-many"
type = "comment"
inverse = "post"

[types.post.relationships.tags]
kind = "to-many"
type = "tag"

[types.comment]
attributes = ["text"]

[types.comment.relationships.post]
kind = "to-one"
type = "post"
inverse = "comments"

[types.tag]
attributes = ["label"]
"#;

pub fn blog_schema() -> Result<StaticSchema, CoreError> {
    StaticSchema::from_toml_str(BLOG_SCHEMA)
}

/// Route `tracing` output through the test harness. Safe to call from
/// every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init()
            .ok();
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    pub field: Option<String>,
}

/// A cache over the blog schema plus a shared log of every notification
/// delivered to subscriptions made through `watch`.
pub struct TestCache {
    pub cache: Cache,
    log: Arc<Mutex<Vec<Change>>>,
}

impl TestCache {
    pub fn new() -> Result<Self, CoreError> {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Result<Self, CoreError> {
        init_tracing();
        Ok(Self {
            cache: Cache::new(Arc::new(blog_schema()?), config),
            log: Arc::default(),
        })
    }

    /// Push a JSON document and return its primary keys.
    pub fn push_json(&mut self, value: serde_json::Value) -> Result<Vec<ResourceKey>, Box<dyn std::error::Error>> {
        let document = crate::documents::document(value)?;
        Ok(self.cache.push(&document)?)
    }

    pub fn key(&self, resource_type: &str, id: &str) -> Result<ResourceKey, EngineError> {
        self.cache
            .peek(resource_type, id)
            .ok_or_else(|| EngineError::InvalidOperation(format!("{resource_type}:{id} is not cached")))
    }

    pub fn watch(&mut self, key: ResourceKey) -> Result<SubscriptionId, EngineError> {
        let log = Arc::clone(&self.log);
        self.cache.subscribe(key, move |key, kind, field| {
            if let Ok(mut log) = log.lock() {
                log.push(Change {
                    key,
                    kind,
                    field: field.map(str::to_string),
                });
            }
        })
    }

    pub fn changes(&self) -> Vec<Change> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn changes_of(&self, kind: ChangeKind) -> Vec<Change> {
        self.changes().into_iter().filter(|c| c.kind == kind).collect()
    }

    pub fn clear_changes(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }

    pub fn members(&self, key: ResourceKey, field: &str) -> Result<Vec<ResourceKey>, EngineError> {
        Ok(self.cache.relationship(key, field)?.members)
    }

    pub fn canonical(&self, key: ResourceKey, field: &str) -> Result<Vec<ResourceKey>, EngineError> {
        Ok(self.cache.relationship(key, field)?.canonical)
    }

    pub fn text(&self, key: ResourceKey, field: &str) -> Option<String> {
        self.cache
            .attribute(key, field)
            .and_then(FieldValue::as_text)
            .map(str::to_string)
    }
}
