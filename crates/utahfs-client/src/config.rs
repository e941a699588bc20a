//! Client configuration: YAML loading, defaulting and validation.
//!
//! Sizing fields that are absent or zero count as unset and take the
//! documented defaults. Defaulting never mutates the loaded configuration; it
//! returns a new value, and applying it twice changes nothing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ConfigError, ConfigResult};
use crate::provider::{Provider, StorageProviderConfig};

/// Directory created next to the mount point when `data-dir` is unset.
pub const DEFAULT_DATA_DIR_NAME: &str = ".utahfs";
/// Blocks held in the WAL before writes block on the backend.
pub const DEFAULT_MAX_WAL_SIZE: i64 = 64 * 512;
/// Blocks held in the in-memory cache.
pub const DEFAULT_CACHE_SIZE: i64 = 32 * 1024;
/// `cache-size` value that disables the cache.
pub const CACHE_DISABLED: i64 = -1;
/// Pointers in each file's skip list.
pub const DEFAULT_NUM_PTRS: i64 = 12;
/// Bytes of file data kept in each skip-list node.
pub const DEFAULT_DATA_SIZE: i64 = 32 * 1024;

const WAL_DIR_NAME: &str = "wal";
const PIN_FILE_NAME: &str = "pin.json";

/// Encryption password. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Password([REDACTED])")
    }
}

/// Client configuration as loaded from YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClientConfig {
    /// Directory holding the WAL and the pin file.
    pub data_dir: Option<PathBuf>,
    pub storage_provider: Option<StorageProviderConfig>,
    /// Maximum number of blocks in the WAL.
    pub max_wal_size: Option<i64>,
    /// Number of blocks in the LRU cache; [`CACHE_DISABLED`] turns it off.
    pub cache_size: Option<i64>,
    /// Mandatory.
    pub password: Option<Password>,
    pub num_ptrs: Option<i64>,
    pub data_size: Option<i64>,
}

fn or_default(value: Option<i64>, default: i64) -> Option<i64> {
    match value {
        None | Some(0) => Some(default),
        set => set,
    }
}

impl ClientConfig {
    /// Load a configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse a configuration from YAML text.
    pub fn from_yaml_str(raw: &str) -> ConfigResult<Self> {
        // An empty document parses as unit, not as an empty mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Returns a copy with every unset field given its default.
    pub fn with_defaults(&self, mount_path: &Path) -> Self {
        let data_dir = match &self.data_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => mount_path
                .parent()
                .unwrap_or(mount_path)
                .join(DEFAULT_DATA_DIR_NAME),
        };
        Self {
            data_dir: Some(data_dir),
            storage_provider: self.storage_provider.clone(),
            max_wal_size: or_default(self.max_wal_size, DEFAULT_MAX_WAL_SIZE),
            cache_size: or_default(self.cache_size, DEFAULT_CACHE_SIZE),
            password: self.password.clone(),
            num_ptrs: or_default(self.num_ptrs, DEFAULT_NUM_PTRS),
            data_size: or_default(self.data_size, DEFAULT_DATA_SIZE),
        }
    }

    /// Default and validate the configuration for a mount at `mount_path`.
    ///
    /// The password is checked first, then the provider is parsed. Sizing
    /// values are passed through; the layers reject the ones they cannot use.
    pub fn resolve(&self, mount_path: &Path) -> ConfigResult<ResolvedConfig> {
        let password = match &self.password {
            Some(p) if !p.is_empty() => p.clone(),
            _ => return Err(ConfigError::MissingCredential { what: "password" }),
        };
        let defaulted = self.with_defaults(mount_path);
        let provider_config = defaulted
            .storage_provider
            .as_ref()
            .ok_or(ConfigError::NoProviderConfigured)?;
        let provider = provider_config.select()?;

        let resolved = ResolvedConfig {
            data_dir: defaulted.data_dir.unwrap_or_default(),
            provider,
            retry_attempts: provider_config.retry_attempts(),
            max_wal_size: defaulted.max_wal_size.unwrap_or(DEFAULT_MAX_WAL_SIZE),
            cache_size: defaulted.cache_size.unwrap_or(DEFAULT_CACHE_SIZE),
            password,
            num_ptrs: defaulted.num_ptrs.unwrap_or(DEFAULT_NUM_PTRS),
            data_size: defaulted.data_size.unwrap_or(DEFAULT_DATA_SIZE),
        };
        debug!(
            data_dir = %resolved.data_dir.display(),
            provider = resolved.provider.name(),
            retry = resolved.retry_attempts,
            max_wal_size = resolved.max_wal_size,
            cache_size = resolved.cache_size,
            num_ptrs = resolved.num_ptrs,
            data_size = resolved.data_size,
            "resolved client configuration"
        );
        Ok(resolved)
    }
}

/// Fully specified configuration, ready for composition.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: PathBuf,
    pub provider: Provider,
    pub retry_attempts: u32,
    pub max_wal_size: i64,
    pub cache_size: i64,
    pub password: Password,
    pub num_ptrs: i64,
    pub data_size: i64,
}

impl ResolvedConfig {
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join(WAL_DIR_NAME)
    }

    pub fn pin_path(&self) -> PathBuf {
        self.data_dir.join(PIN_FILE_NAME)
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_size != CACHE_DISABLED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    const FULL: &str = r#"
data-dir: /var/lib/utahfs
storage-provider:
  s3-app-id: AKIA
  s3-app-key: secret
  s3-bucket: files
  s3-url: https://s3.example.com
  s3-region: us-west-2
  retry: 3
max-wal-size: 1024
cache-size: -1
password: hunter2
num-ptrs: 8
data-size: 4096
"#;

    fn mount() -> &'static Path {
        Path::new("/mnt/utahfs")
    }

    #[test]
    fn test_parse_full_document() {
        let config = ClientConfig::from_yaml_str(FULL).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/utahfs")));
        assert_eq!(config.max_wal_size, Some(1024));
        assert_eq!(config.cache_size, Some(CACHE_DISABLED));
        assert_eq!(config.password.as_ref().map(|p| p.expose()), Some("hunter2"));
        let provider = config.storage_provider.as_ref().unwrap();
        assert_eq!(provider.s3_region.as_deref(), Some("us-west-2"));
        assert_eq!(provider.retry, Some(3));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.num_ptrs, Some(8));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ClientConfig::from_file("/nonexistent/utahfs.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_bad_yaml_is_parse_error() {
        let err = ClientConfig::from_yaml_str("num-ptrs: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(ClientConfig::from_yaml_str("").unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default().with_defaults(mount());
        assert_eq!(config.data_dir, Some(PathBuf::from("/mnt/.utahfs")));
        assert_eq!(config.max_wal_size, Some(DEFAULT_MAX_WAL_SIZE));
        assert_eq!(config.cache_size, Some(DEFAULT_CACHE_SIZE));
        assert_eq!(config.num_ptrs, Some(DEFAULT_NUM_PTRS));
        assert_eq!(config.data_size, Some(DEFAULT_DATA_SIZE));
    }

    #[test]
    fn test_zero_counts_as_unset() {
        let config = ClientConfig {
            max_wal_size: Some(0),
            cache_size: Some(0),
            num_ptrs: Some(0),
            data_size: Some(0),
            ..Default::default()
        }
        .with_defaults(mount());
        assert_eq!(config.max_wal_size, Some(DEFAULT_MAX_WAL_SIZE));
        assert_eq!(config.cache_size, Some(DEFAULT_CACHE_SIZE));
        assert_eq!(config.num_ptrs, Some(DEFAULT_NUM_PTRS));
        assert_eq!(config.data_size, Some(DEFAULT_DATA_SIZE));
    }

    #[test]
    fn test_defaults_do_not_mutate_input() {
        let raw = ClientConfig::default();
        let _ = raw.with_defaults(mount());
        assert_eq!(raw, ClientConfig::default());
    }

    #[test]
    fn test_cache_sentinel_preserved() {
        let config = ClientConfig {
            cache_size: Some(CACHE_DISABLED),
            ..Default::default()
        }
        .with_defaults(mount());
        assert_eq!(config.cache_size, Some(CACHE_DISABLED));
    }

    #[test]
    fn test_resolve_full_document() {
        let resolved = ClientConfig::from_yaml_str(FULL)
            .unwrap()
            .resolve(mount())
            .unwrap();
        assert_eq!(resolved.provider.name(), "s3");
        assert_eq!(resolved.retry_attempts, 3);
        assert!(!resolved.cache_enabled());
        assert_eq!(resolved.wal_dir(), PathBuf::from("/var/lib/utahfs/wal"));
        assert_eq!(resolved.pin_path(), PathBuf::from("/var/lib/utahfs/pin.json"));
    }

    #[test]
    fn test_resolve_requires_password_before_provider() {
        let config = ClientConfig::default();
        assert!(matches!(
            config.resolve(mount()),
            Err(ConfigError::MissingCredential { what: "password" })
        ));
        let config = ClientConfig {
            password: Some(Password::new("")),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve(mount()),
            Err(ConfigError::MissingCredential { .. })
        ));
    }

    #[test]
    fn test_resolve_without_provider_section() {
        let config = ClientConfig {
            password: Some(Password::new("pw")),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve(mount()),
            Err(ConfigError::NoProviderConfigured)
        ));
    }

    #[test]
    fn test_password_debug_redacted() {
        let config = ClientConfig::from_yaml_str(FULL).unwrap();
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret"));
    }

    fn sizing() -> impl Strategy<Value = Option<i64>> {
        prop_oneof![Just(None), Just(Some(0)), Just(Some(-1)), (1i64..1_000_000).prop_map(Some)]
    }

    proptest! {
        #[test]
        fn prop_defaulting_is_idempotent(
            data_dir in proptest::option::of("/[a-z]{1,8}"),
            max_wal_size in sizing(),
            cache_size in sizing(),
            num_ptrs in sizing(),
            data_size in sizing(),
            mount_path in "/[a-z]{1,8}/[a-z]{1,8}",
        ) {
            let config = ClientConfig {
                data_dir: data_dir.map(PathBuf::from),
                max_wal_size,
                cache_size,
                num_ptrs,
                data_size,
                ..Default::default()
            };
            let mount_path = PathBuf::from(mount_path);
            let once = config.with_defaults(&mount_path);
            let twice = once.with_defaults(&mount_path);
            prop_assert_eq!(once, twice);
        }
    }
}
