//! Polymorphic key/value store layer.
//!
//! Stores are named buckets of JSON-representable values behind a
//! `StoreProvider` trait object. Four variants exist: an ephemeral
//! per-request map, a process-local map with optional TTL, a distributed
//! wide-column variant (backend reached through the `WideColumnClient`
//! collaborator) and a distributed hash variant backed by Redis. The
//! active provider is chosen once per process from `IMPOSTER_STORE_DRIVER`
//! and injected through `ServerState`; tests construct a `StoreFactory`
//! over any provider directly.

pub mod ephemeral;
pub mod inmemory;
pub mod redis;
pub mod widecolumn;

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backtrace::Backtrace;
use serde_json::Value;
use thiserror::Error;

use crate::config::StoreDefinition;
use crate::impl_fmt_display;

/// Name of the per-request store.
pub const REQUEST_STORE: &str = "request";

#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,
    pub backtrace: Box<Backtrace>,
}

#[derive(Debug, Error)]
pub enum StoreErrorKind {
    #[error("store backend error: {}", _0)]
    Backend(String),

    #[error("atomic counter error: {}", _0)]
    Counter(String),

    #[error("invalid store configuration: {}", _0)]
    Config(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        StoreErrorKind::Backend(msg.into()).into()
    }

    pub fn counter(msg: impl Into<String>) -> Self {
        StoreErrorKind::Counter(msg.into()).into()
    }

    pub fn kind(&self) -> &StoreErrorKind {
        &self.kind
    }
}

impl From<StoreErrorKind> for StoreError {
    fn from(kind: StoreErrorKind) -> Self {
        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
        }
    }
}

impl_fmt_display!(StoreError, StoreErrorKind);

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(inner: std::io::Error) -> Self {
        StoreErrorKind::Backend(inner.to_string()).into()
    }
}

/// The contract shared by every store variant.
///
/// Read operations swallow backend errors (callers observe "absent");
/// atomic counters surface them so admission control can fail open.
pub trait StoreProvider: Send + Sync {
    fn get(&self, store: &str, key: &str) -> Option<Value>;

    fn put(&self, store: &str, key: &str, value: Value);

    /// All entries whose key starts with `prefix`, keyed by the full key.
    fn scan(&self, store: &str, prefix: &str) -> BTreeMap<String, Value>;

    fn delete(&self, store: &str, key: &str);

    fn delete_store(&self, store: &str);

    /// Atomically add `delta` and return the post-operation count. `ttl`
    /// applies only when this call creates the counter.
    fn atomic_inc(
        &self,
        store: &str,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError>;

    /// Atomically subtract `delta` and return the post-operation count.
    fn atomic_dec(&self, store: &str, key: &str, delta: i64) -> Result<i64, StoreError>;
}

/// A named store bound to a provider. The process-wide key prefix is
/// prepended before delegation and stripped again on scan results, so
/// callers never observe it.
#[derive(Clone)]
pub struct Store {
    name: String,
    provider: Arc<dyn StoreProvider>,
    key_prefix: String,
    counter_ttl: Option<Duration>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("name", &self.name).finish()
    }
}

impl Store {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_counter_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.counter_ttl = ttl;
        self
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    pub fn load(&self, key: &str) -> Option<Value> {
        self.provider.get(&self.name, &self.prefixed(key))
    }

    /// Load a value rendered as a string; non-string values are
    /// JSON-encoded.
    pub fn load_string(&self, key: &str) -> Option<String> {
        self.load(key).map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.load(key).is_some()
    }

    pub fn save(&self, key: &str, value: Value) {
        self.provider.put(&self.name, &self.prefixed(key), value)
    }

    /// Entries whose key starts with `prefix`. Result keys carry the
    /// caller's prefix but never the process-wide one.
    pub fn scan(&self, prefix: &str) -> BTreeMap<String, Value> {
        self.provider
            .scan(&self.name, &self.prefixed(prefix))
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&self.key_prefix)
                    .map(|stripped| (stripped.to_owned(), value))
            })
            .collect()
    }

    pub fn delete(&self, key: &str) {
        self.provider.delete(&self.name, &self.prefixed(key))
    }

    pub fn delete_all(&self) {
        self.provider.delete_store(&self.name)
    }

    pub fn atomic_inc(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.provider
            .atomic_inc(&self.name, &self.prefixed(key), delta, self.counter_ttl)
    }

    pub fn atomic_dec(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.provider
            .atomic_dec(&self.name, &self.prefixed(key), delta)
    }
}

/// Creates `Store` handles over the process-wide provider. The provider
/// is built exactly once from the environment at startup; tests inject
/// alternatives through `StoreFactory::new`.
#[derive(Clone)]
pub struct StoreFactory {
    provider: Arc<dyn StoreProvider>,
    key_prefix: String,
}

impl StoreFactory {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            key_prefix: String::new(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Select the provider from `IMPOSTER_STORE_DRIVER`:
    /// `store-dynamodb`, `store-redis`, anything else (or unset) is the
    /// in-memory variant.
    pub fn from_env() -> Result<Self, StoreError> {
        let driver = env::var("IMPOSTER_STORE_DRIVER").unwrap_or_default();
        let provider: Arc<dyn StoreProvider> = match driver.as_str() {
            "store-dynamodb" => match widecolumn::WideColumnStoreProvider::from_env() {
                Ok(provider) => Arc::new(provider),
                Err(e) => {
                    // The wire client is supplied by the deployment
                    // adapter; without one we can only run process-local.
                    error!("wide-column store unavailable ({}), using in-memory", e);
                    Arc::new(inmemory::InMemoryStoreProvider::from_env())
                }
            },
            "store-redis" => Arc::new(redis::RedisStoreProvider::from_env()?),
            _ => Arc::new(inmemory::InMemoryStoreProvider::from_env()),
        };
        let key_prefix = env::var("IMPOSTER_STORE_KEY_PREFIX").unwrap_or_default();
        Ok(Self {
            provider,
            key_prefix,
        })
    }

    pub fn open(&self, name: &str) -> Store {
        Store {
            name: name.to_owned(),
            provider: Arc::clone(&self.provider),
            key_prefix: self.key_prefix.clone(),
            counter_ttl: None,
        }
    }

    /// A fresh per-request store. Its lifetime is the exchange; it never
    /// touches the shared provider.
    pub fn request_store(&self) -> Store {
        Store {
            name: REQUEST_STORE.to_owned(),
            provider: Arc::new(ephemeral::EphemeralStoreProvider::default()),
            key_prefix: String::new(),
            counter_ttl: None,
        }
    }

    /// Inject startup data into named stores. Errors are logged and
    /// skipped; a bad preload never takes the store down.
    pub fn preload(&self, definitions: &BTreeMap<String, StoreDefinition>, config_dir: &Path) {
        for (name, definition) in definitions {
            let store = self.open(name);
            for (key, value) in &definition.preload_data {
                store.save(key, value.clone());
            }
            if let Some(file) = &definition.preload_file {
                match load_preload_file(config_dir, file) {
                    Ok(entries) => {
                        for (key, value) in entries {
                            store.save(&key, value);
                        }
                    }
                    Err(e) => {
                        warn!("skipping preload file {} for store {}: {}", file, name, e);
                    }
                }
            }
        }
    }
}

fn load_preload_file(
    config_dir: &Path,
    file: &str,
) -> Result<serde_json::Map<String, Value>, StoreError> {
    let path = crate::respond::resolve_config_path(config_dir, file)
        .map_err(|e| StoreError::backend(e.to_string()))?;
    let raw = fs::read_to_string(path)?;
    let parsed: Value =
        serde_json::from_str(&raw).map_err(|e| StoreError::backend(e.to_string()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::backend("preload file must hold a JSON object")),
    }
}

/// Parse a Go-style duration string (`30m`, `1h30m`, `90s`, `500ms`).
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let mut unit = c.to_string();
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }
        let count: u64 = digits.parse().ok()?;
        digits.clear();
        total += match unit.as_str() {
            "h" => Duration::from_secs(count * 3600),
            "m" => Duration::from_secs(count * 60),
            "s" => Duration::from_secs(count),
            "ms" => Duration::from_millis(count),
            _ => return None,
        };
    }
    if !digits.is_empty() {
        // trailing digits without a unit
        return None;
    }
    Some(total)
}

/// Coerce a stored value to a counter. Missing and non-numeric values
/// count as zero so a clobbered counter recovers rather than wedging.
pub(crate) fn value_as_count(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_factory() -> StoreFactory {
        StoreFactory::new(Arc::new(inmemory::InMemoryStoreProvider::new(None)))
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let store = test_factory().open("pets");
        store.save("name", json!("Rex"));
        assert_eq!(store.load("name"), Some(json!("Rex")));
        assert!(store.has("name"));

        store.delete("name");
        assert_eq!(store.load("name"), None);
        assert!(!store.has("name"));
    }

    #[test]
    fn load_string_json_encodes_non_strings() {
        let store = test_factory().open("pets");
        store.save("count", json!(3));
        store.save("tags", json!(["a", "b"]));
        assert_eq!(store.load_string("count").as_deref(), Some("3"));
        assert_eq!(store.load_string("tags").as_deref(), Some(r#"["a","b"]"#));
    }

    #[test]
    fn scan_returns_exactly_matching_entries() {
        let store = test_factory().open("pets");
        store.save("pet.1", json!("a"));
        store.save("pet.2", json!("b"));
        store.save("owner.1", json!("c"));

        let result = store.scan("pet.");
        assert_eq!(result.len(), 2);
        assert!(result.contains_key("pet.1"));
        assert!(result.contains_key("pet.2"));
    }

    #[test]
    fn process_prefix_is_invisible_to_callers() {
        let factory = test_factory().with_key_prefix("tenant1.");
        let store = factory.open("pets");
        store.save("pet.1", json!("a"));

        // The provider sees the prefixed key...
        let raw = factory.provider.get("pets", "tenant1.pet.1");
        assert_eq!(raw, Some(json!("a")));

        // ...but scan results do not carry it.
        let result = store.scan("pet.");
        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["pet.1"]);
    }

    #[test]
    fn delete_store_clears_only_that_store() {
        let factory = test_factory();
        let pets = factory.open("pets");
        let owners = factory.open("owners");
        pets.save("a", json!(1));
        owners.save("a", json!(2));

        pets.delete_all();
        assert_eq!(pets.load("a"), None);
        assert_eq!(owners.load("a"), Some(json!(2)));
    }

    #[test]
    fn request_stores_are_isolated() {
        let factory = test_factory();
        let first = factory.request_store();
        let second = factory.request_store();
        first.save("k", json!("v"));
        assert_eq!(second.load("k"), None);
    }

    #[test]
    fn preload_merges_inline_data_and_files() {
        use crate::config::StoreDefinition;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pets.json"), r#"{"rex": {"species": "dog"}}"#).unwrap();

        let mut definitions = BTreeMap::new();
        definitions.insert(
            "pets".to_owned(),
            StoreDefinition {
                preload_data: [("favourite".to_owned(), json!("Rex"))].into_iter().collect(),
                preload_file: Some("pets.json".to_owned()),
            },
        );
        // a bad preload is logged and skipped, never fatal
        definitions.insert(
            "broken".to_owned(),
            StoreDefinition {
                preload_data: BTreeMap::new(),
                preload_file: Some("missing.json".to_owned()),
            },
        );

        let factory = test_factory();
        factory.preload(&definitions, dir.path());

        let pets = factory.open("pets");
        assert_eq!(pets.load("favourite"), Some(json!("Rex")));
        assert_eq!(pets.load("rex"), Some(json!({"species": "dog"})));
        assert!(factory.open("broken").scan("").is_empty());
    }

    #[test]
    fn parses_go_durations() {
        assert_eq!(parse_go_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_go_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_go_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_go_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_go_duration(""), None);
        assert_eq!(parse_go_duration("bogus"), None);
        assert_eq!(parse_go_duration("15"), None);
    }
}
