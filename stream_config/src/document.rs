//! The raw configuration document and its typed accessors.

use observability_deps::tracing::debug;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// The root table every option path starts with.
pub const ROOT_NAMESPACE: &str = "keyspaces-cdc-streams";

/// Configuration failures. All of these are fatal at startup and never
/// retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {source}")]
    Parse {
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("configuration value is required: {path}")]
    MissingRequired { path: String },

    #[error("invalid value for {path}: {message}")]
    InvalidValue { path: String, message: String },

    #[error("cannot resolve stream: {message}")]
    StreamResolution { message: String },

    #[error("unknown target mapper {name:?}")]
    UnknownMapper { name: String },
}

impl ConfigError {
    pub fn invalid(path: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// A parsed configuration document with environment overrides applied
/// at read time.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    root: toml::Value,
}

impl ConfigDocument {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let root = contents
            .parse::<toml::Value>()
            .map_err(|source| ConfigError::Parse {
                source: Box::new(source),
            })?;
        Ok(Self { root })
    }

    /// A document with no file-sourced options; every read falls back to
    /// environment variables and defaults.
    pub fn empty() -> Self {
        Self {
            root: toml::Value::Table(Default::default()),
        }
    }

    /// The environment variable overriding `path`: root namespace
    /// stripped, separators replaced by underscores, upper-cased.
    pub fn env_var_name(path: &str) -> String {
        let stripped = path
            .strip_prefix(ROOT_NAMESPACE)
            .map(|rest| rest.trim_start_matches('.'))
            .unwrap_or(path);
        stripped.replace(['.', '-'], "_").to_ascii_uppercase()
    }

    fn env_override(path: &str) -> Option<String> {
        let name = Self::env_var_name(path);
        match std::env::var(&name) {
            Ok(value) => {
                debug!(env_var = %name, config_path = %path, "using environment override");
                Some(value)
            }
            Err(_) => None,
        }
    }

    /// Walks the dotted path through nested tables. The root namespace
    /// is a single segment despite containing dashes.
    fn lookup(&self, path: &str) -> Option<&toml::Value> {
        let rest = path.strip_prefix(ROOT_NAMESPACE)?;
        let rest = rest.trim_start_matches('.');
        let mut current = self.root.get(ROOT_NAMESPACE)?;
        if rest.is_empty() {
            return Some(current);
        }
        for segment in rest.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    pub fn get_string(&self, path: &str) -> Result<Option<String>, ConfigError> {
        if let Some(value) = Self::env_override(path) {
            return Ok(Some(value));
        }
        match self.lookup(path) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ConfigError::invalid(
                path,
                format!("expected a string, found {}", other.type_str()),
            )),
        }
    }

    pub fn require_string(&self, path: &str) -> Result<String, ConfigError> {
        self.get_string(path)?
            .ok_or_else(|| ConfigError::MissingRequired {
                path: path.to_string(),
            })
    }

    pub fn string_or(&self, path: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.get_string(path)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn get_bool(&self, path: &str) -> Result<Option<bool>, ConfigError> {
        if let Some(value) = Self::env_override(path) {
            return value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::invalid(path, format!("not a boolean: {value:?}")));
        }
        match self.lookup(path) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
            Some(other) => Err(ConfigError::invalid(
                path,
                format!("expected a boolean, found {}", other.type_str()),
            )),
        }
    }

    pub fn bool_or(&self, path: &str, default: bool) -> Result<bool, ConfigError> {
        Ok(self.get_bool(path)?.unwrap_or(default))
    }

    pub fn get_i64(&self, path: &str) -> Result<Option<i64>, ConfigError> {
        if let Some(value) = Self::env_override(path) {
            return value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::invalid(path, format!("not an integer: {value:?}")));
        }
        match self.lookup(path) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => Ok(Some(*i)),
            Some(other) => Err(ConfigError::invalid(
                path,
                format!("expected an integer, found {}", other.type_str()),
            )),
        }
    }

    pub fn i64_or(&self, path: &str, default: i64) -> Result<i64, ConfigError> {
        Ok(self.get_i64(path)?.unwrap_or(default))
    }

    /// A non-negative integer read as `usize`, e.g. retry budgets.
    pub fn usize_or(&self, path: &str, default: usize) -> Result<usize, ConfigError> {
        match self.get_i64(path)? {
            None => Ok(default),
            Some(v) => usize::try_from(v)
                .map_err(|_| ConfigError::invalid(path, format!("must be non-negative: {v}"))),
        }
    }

    /// A millisecond count read as a `Duration`.
    pub fn millis_or(&self, path: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get_i64(path)? {
            None => Ok(default),
            Some(v) if v >= 0 => Ok(Duration::from_millis(v as u64)),
            Some(v) => Err(ConfigError::invalid(path, format!("must be non-negative: {v}"))),
        }
    }

    /// A list of strings. Environment overrides are comma-separated.
    pub fn get_string_list(&self, path: &str) -> Result<Option<Vec<String>>, ConfigError> {
        if let Some(value) = Self::env_override(path) {
            return Ok(Some(
                value
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect(),
            ));
        }
        match self.lookup(path) {
            None => Ok(None),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s.clone()),
                    other => Err(ConfigError::invalid(
                        path,
                        format!("expected a list of strings, found {}", other.type_str()),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(ConfigError::invalid(
                path,
                format!("expected a list, found {}", other.type_str()),
            )),
        }
    }

    pub fn list_or(&self, path: &str, default: Vec<String>) -> Result<Vec<String>, ConfigError> {
        Ok(self.get_string_list(path)?.unwrap_or(default))
    }

    pub fn require_list(&self, path: &str) -> Result<Vec<String>, ConfigError> {
        self.get_string_list(path)?
            .ok_or_else(|| ConfigError::MissingRequired {
                path: path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        ["keyspaces-cdc-streams"]
        [ "keyspaces-cdc-streams".stream ]
        keyspace-name = "media"
        table-name = "movies"
        application-name = "movies-app"

        [ "keyspaces-cdc-streams".connector ]
        target-mapper = "ObjectStoreMapper"
        bucket = "b"
        prefix = "p"
        max-retries = 5
        include-fields = ["id", "title"]

        [ "keyspaces-cdc-streams".processor ]
        call-process-records-even-for-empty-record-list = false
    "#;

    #[test]
    fn test_env_var_naming() {
        assert_eq!(
            ConfigDocument::env_var_name("keyspaces-cdc-streams.connector.bucket"),
            "CONNECTOR_BUCKET"
        );
        assert_eq!(
            ConfigDocument::env_var_name(
                "keyspaces-cdc-streams.lease-management.lease-steal-after-millis"
            ),
            "LEASE_MANAGEMENT_LEASE_STEAL_AFTER_MILLIS"
        );
    }

    #[test]
    fn test_typed_accessors() {
        let doc = ConfigDocument::from_toml_str(SAMPLE).unwrap();

        assert_eq!(
            doc.require_string("keyspaces-cdc-streams.stream.keyspace-name")
                .unwrap(),
            "media"
        );
        assert_eq!(
            doc.get_string("keyspaces-cdc-streams.stream.stream-name")
                .unwrap(),
            None
        );
        assert_eq!(
            doc.usize_or("keyspaces-cdc-streams.connector.max-retries", 3)
                .unwrap(),
            5
        );
        assert_eq!(
            doc.usize_or("keyspaces-cdc-streams.connector.absent", 3)
                .unwrap(),
            3
        );
        assert_eq!(
            doc.get_bool(
                "keyspaces-cdc-streams.processor.call-process-records-even-for-empty-record-list"
            )
            .unwrap(),
            Some(false)
        );
        assert_eq!(
            doc.require_list("keyspaces-cdc-streams.connector.include-fields")
                .unwrap(),
            vec!["id".to_string(), "title".to_string()]
        );
    }

    #[test]
    fn test_missing_required() {
        let doc = ConfigDocument::from_toml_str(SAMPLE).unwrap();
        let err = doc
            .require_string("keyspaces-cdc-streams.connector.queue-address")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { path } if path.ends_with("queue-address")));
    }

    #[test]
    fn test_type_mismatch() {
        let doc = ConfigDocument::from_toml_str(SAMPLE).unwrap();
        assert!(doc
            .get_string("keyspaces-cdc-streams.connector.max-retries")
            .is_err());
        assert!(doc
            .get_i64("keyspaces-cdc-streams.connector.bucket")
            .is_err());
    }

    #[test]
    fn test_env_override_wins() {
        // Unique names per test: the process environment is global.
        std::env::set_var("CONNECTOR_OVERRIDE_BUCKET", "env-bucket");
        std::env::set_var("CONNECTOR_OVERRIDE_COUNT", "9");
        std::env::set_var("CONNECTOR_OVERRIDE_FIELDS", "a, b,c");

        let doc = ConfigDocument::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            doc.require_string("keyspaces-cdc-streams.connector.override-bucket")
                .unwrap(),
            "env-bucket"
        );
        assert_eq!(
            doc.i64_or("keyspaces-cdc-streams.connector.override-count", 1)
                .unwrap(),
            9
        );
        assert_eq!(
            doc.require_list("keyspaces-cdc-streams.connector.override-fields")
                .unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        std::env::set_var("CONNECTOR_OVERRIDE_BAD_COUNT", "twelve");
        let doc = ConfigDocument::from_toml_str(SAMPLE).unwrap();
        assert!(doc
            .get_i64("keyspaces-cdc-streams.connector.override-bad-count")
            .is_err());
    }

    #[test]
    fn test_parse_failure() {
        assert!(matches!(
            ConfigDocument::from_toml_str("= nonsense").unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
