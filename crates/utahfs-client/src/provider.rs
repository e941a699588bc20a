//! Remote backend selection.
//!
//! The configuration carries two credential groups, B2 and S3. A group counts
//! as configured when any of its fields is present and non-empty; exactly one
//! group must be configured. Partially filled groups on both sides are
//! rejected rather than guessed at.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use utahfs_persistent::{MemoryObjectStore, ObjectStorage, StorageError, StorageResult};

use crate::error::{ConfigError, ConfigResult};

/// Raw `storage-provider` section of the configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageProviderConfig {
    pub b2_acct_id: Option<String>,
    pub b2_app_key: Option<String>,
    pub b2_bucket: Option<String>,
    pub b2_url: Option<String>,

    pub s3_app_id: Option<String>,
    pub s3_app_key: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_url: Option<String>,
    pub s3_region: Option<String>,

    /// Maximum attempts per backend request; values of 1 or less disable retries.
    pub retry: Option<i64>,
}

fn is_set(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|v| !v.is_empty())
}

fn value(field: &Option<String>) -> String {
    field.clone().unwrap_or_default()
}

impl StorageProviderConfig {
    pub fn has_b2(&self) -> bool {
        [&self.b2_acct_id, &self.b2_app_key, &self.b2_bucket, &self.b2_url]
            .into_iter()
            .any(is_set)
    }

    pub fn has_s3(&self) -> bool {
        [
            &self.s3_app_id,
            &self.s3_app_key,
            &self.s3_bucket,
            &self.s3_url,
            &self.s3_region,
        ]
        .into_iter()
        .any(is_set)
    }

    /// Parse the credential groups into exactly one [`Provider`].
    pub fn select(&self) -> ConfigResult<Provider> {
        match (self.has_b2(), self.has_s3()) {
            (false, false) => Err(ConfigError::NoProviderConfigured),
            (true, true) => Err(ConfigError::AmbiguousProvider),
            (true, false) => Ok(Provider::B2(B2Credentials {
                acct_id: value(&self.b2_acct_id),
                app_key: value(&self.b2_app_key),
                bucket: value(&self.b2_bucket),
                url: value(&self.b2_url),
            })),
            (false, true) => Ok(Provider::S3(S3Credentials {
                app_id: value(&self.s3_app_id),
                app_key: value(&self.s3_app_key),
                bucket: value(&self.s3_bucket),
                url: value(&self.s3_url),
                region: value(&self.s3_region),
            })),
        }
    }

    /// Retry bound as an attempt count; zero when unset or negative.
    pub fn retry_attempts(&self) -> u32 {
        self.retry
            .map(|r| u32::try_from(r).unwrap_or(if r < 0 { 0 } else { u32::MAX }))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for StorageProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProviderConfig")
            .field("b2_acct_id", &self.b2_acct_id)
            .field("b2_app_key", &self.b2_app_key.as_ref().map(|_| "[REDACTED]"))
            .field("b2_bucket", &self.b2_bucket)
            .field("b2_url", &self.b2_url)
            .field("s3_app_id", &self.s3_app_id)
            .field("s3_app_key", &self.s3_app_key.as_ref().map(|_| "[REDACTED]"))
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_url", &self.s3_url)
            .field("s3_region", &self.s3_region)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Backblaze B2 credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct B2Credentials {
    pub acct_id: String,
    pub app_key: String,
    pub bucket: String,
    pub url: String,
}

impl std::fmt::Debug for B2Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Credentials")
            .field("acct_id", &self.acct_id)
            .field("app_key", &"[REDACTED]")
            .field("bucket", &self.bucket)
            .field("url", &self.url)
            .finish()
    }
}

/// S3-compatible credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub app_id: String,
    pub app_key: String,
    pub bucket: String,
    pub url: String,
    pub region: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("app_id", &self.app_id)
            .field("app_key", &"[REDACTED]")
            .field("bucket", &self.bucket)
            .field("url", &self.url)
            .field("region", &self.region)
            .finish()
    }
}

/// The one remote backend a configuration selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    B2(B2Credentials),
    S3(S3Credentials),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::B2(_) => "b2",
            Provider::S3(_) => "s3",
        }
    }

    /// Returns the bucket the backend stores objects in.
    pub fn bucket(&self) -> &str {
        match self {
            Provider::B2(c) => &c.bucket,
            Provider::S3(c) => &c.bucket,
        }
    }
}

/// Opens a session with a remote backend.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Connect to `provider` and return its object storage.
    async fn connect(&self, provider: &Provider) -> StorageResult<Box<dyn ObjectStorage>>;
}

/// Connect through `connector`, reporting every failure as `BackendUnavailable`.
pub async fn connect(
    connector: &dyn BackendConnector,
    provider: &Provider,
) -> StorageResult<Box<dyn ObjectStorage>> {
    match connector.connect(provider).await {
        Ok(store) => {
            info!(provider = provider.name(), bucket = provider.bucket(), "connected to backend");
            Ok(store)
        }
        Err(e @ StorageError::BackendUnavailable { .. }) => Err(e),
        Err(e) => Err(StorageError::BackendUnavailable {
            reason: format!("connecting to {}: {}", provider.name(), e),
            transient: e.is_transient(),
        }),
    }
}

/// Connector that serves every provider from one shared in-memory store.
#[derive(Default)]
pub struct MemoryConnector {
    store: MemoryObjectStore,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: MemoryObjectStore) -> Self {
        Self {
            store,
            connects: AtomicUsize::new(0),
        }
    }

    /// Returns a handle to the shared store.
    pub fn store(&self) -> MemoryObjectStore {
        self.store.clone()
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, _provider: &Provider) -> StorageResult<Box<dyn ObjectStorage>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(self.store.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn b2_only() -> StorageProviderConfig {
        StorageProviderConfig {
            b2_acct_id: Some("acct".to_string()),
            b2_app_key: Some("key".to_string()),
            b2_bucket: Some("bucket".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_b2() {
        let provider = b2_only().select().unwrap();
        assert_eq!(provider.name(), "b2");
        assert_eq!(provider.bucket(), "bucket");
    }

    #[test]
    fn test_select_s3_partial() {
        let config = StorageProviderConfig {
            s3_region: Some("us-east-1".to_string()),
            ..Default::default()
        };
        let provider = config.select().unwrap();
        assert_eq!(provider.name(), "s3");
    }

    #[test]
    fn test_empty_strings_are_unset() {
        let config = StorageProviderConfig {
            b2_acct_id: Some(String::new()),
            s3_bucket: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(config.select(), Err(ConfigError::NoProviderConfigured)));
    }

    #[test]
    fn test_partial_groups_on_both_sides_are_ambiguous() {
        let config = StorageProviderConfig {
            b2_url: Some("https://b2".to_string()),
            s3_url: Some("https://s3".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.select(), Err(ConfigError::AmbiguousProvider)));
    }

    #[test]
    fn test_retry_attempts() {
        let mut config = b2_only();
        assert_eq!(config.retry_attempts(), 0);
        config.retry = Some(5);
        assert_eq!(config.retry_attempts(), 5);
        config.retry = Some(-3);
        assert_eq!(config.retry_attempts(), 0);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = b2_only();
        let rendered = format!("{:?} {:?}", config, config.select().unwrap());
        assert!(!rendered.contains("\"key\""));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_connect_failures_become_backend_unavailable() {
        struct Refusing;

        #[async_trait]
        impl BackendConnector for Refusing {
            async fn connect(&self, _: &Provider) -> StorageResult<Box<dyn ObjectStorage>> {
                Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        }

        let provider = b2_only().select().unwrap();
        let err = connect(&Refusing, &provider).await.err().unwrap();
        assert!(matches!(err, StorageError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_memory_connector_counts() {
        let connector = MemoryConnector::default();
        let provider = b2_only().select().unwrap();
        connect(&connector, &provider).await.unwrap();
        assert_eq!(connector.connect_count(), 1);
    }

    fn field() -> impl Strategy<Value = Option<String>> {
        prop_oneof![Just(None), Just(Some(String::new())), "[a-z]{1,8}".prop_map(Some)]
    }

    proptest! {
        #[test]
        fn prop_selection_matches_field_presence(
            b2 in proptest::collection::vec(field(), 4),
            s3 in proptest::collection::vec(field(), 5),
        ) {
            let config = StorageProviderConfig {
                b2_acct_id: b2[0].clone(),
                b2_app_key: b2[1].clone(),
                b2_bucket: b2[2].clone(),
                b2_url: b2[3].clone(),
                s3_app_id: s3[0].clone(),
                s3_app_key: s3[1].clone(),
                s3_bucket: s3[2].clone(),
                s3_url: s3[3].clone(),
                s3_region: s3[4].clone(),
                retry: None,
            };
            let has_b2 = b2.iter().any(is_set);
            let has_s3 = s3.iter().any(is_set);
            match config.select() {
                Err(ConfigError::NoProviderConfigured) => prop_assert!(!has_b2 && !has_s3),
                Err(ConfigError::AmbiguousProvider) => prop_assert!(has_b2 && has_s3),
                Ok(Provider::B2(_)) => prop_assert!(has_b2 && !has_s3),
                Ok(Provider::S3(_)) => prop_assert!(has_s3 && !has_b2),
                Err(e) => prop_assert!(false, "unexpected error {}", e),
            }
        }
    }
}
