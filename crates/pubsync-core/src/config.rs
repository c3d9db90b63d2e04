//! Configuration types for pubsync components.
//!
//! Two layers live here:
//!
//! - the sources file (`sources.toml`), which declares sources, schemas,
//!   mappings and file endpoints, loaded with [`load_sources_config`];
//! - [`SyncConfiguration`], the flat, immutable settings map one run is
//!   driven by. It is derived from a [`SourceEntry`] and resolved by the
//!   orchestrator before any I/O.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;
use crate::mapping::FieldMapping;
use crate::pager::PaginationDescriptor;
use crate::schema::SchemaDefinition;

/// Setting keys recognized by the orchestrator.
pub mod keys {
    pub const SOURCE: &str = "source";
    pub const SCHEMA: &str = "schema";
    pub const MAPPING: &str = "mapping";
    pub const SOURCE_ENDPOINT: &str = "sourceEndpoint";
    pub const ZAAKSYSTEEM_SEARCH_ENDPOINT: &str = "zaaksysteemSearchEndpoint";
    pub const SOURCE_QUERY: &str = "sourceQuery";
    pub const CATEGORY: &str = "category";
    pub const OIN: &str = "oin";
    pub const ORGANISATIE: &str = "organisatie";
    pub const PORTAL_URL: &str = "portalUrl";
    pub const AUTO_PUBLISH: &str = "autoPublish";
    pub const ALLOW_PDF_ONLY: &str = "allowPDFOnly";
    pub const EXTRACT_TEXT: &str = "extractTextFromDocuments";
    pub const FILE_ENDPOINT_REFERENCE: &str = "fileEndpointReference";

    /// Keys that must be present and non-empty. An endpoint key is checked separately.
    pub const REQUIRED: &[&str] = &[SOURCE, SCHEMA, MAPPING, OIN];

    /// Endpoint keys in order of preference.
    pub const ENDPOINTS: &[&str] = &[SOURCE_ENDPOINT, ZAAKSYSTEEM_SEARCH_ENDPOINT];
}

/// Immutable settings for one run.
///
/// # Examples
///
/// ```
/// use pubsync_core::SyncConfiguration;
///
/// let config = SyncConfiguration::from_pairs([
///     ("source", "openzaak"),
///     ("autoPublish", "true"),
/// ]);
/// assert_eq!(config.get("source"), Some("openzaak"));
/// assert!(config.flag("autoPublish"));
/// assert!(!config.flag("allowPDFOnly"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    settings: BTreeMap<String, String>,
}

impl SyncConfiguration {
    pub fn new(settings: BTreeMap<String, String>) -> Self {
        Self { settings }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            settings: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a setting, treating blank values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Returns a setting or `SyncError::MissingSetting`.
    pub fn require(&self, key: &str) -> Result<&str, SyncError> {
        self.get(key)
            .ok_or_else(|| SyncError::MissingSetting(key.to_string()))
    }

    /// Reads a boolean flag; absent flags are false.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        })
    }

    /// Returns the first configured endpoint key.
    pub fn endpoint(&self) -> Result<&str, SyncError> {
        keys::ENDPOINTS
            .iter()
            .find_map(|key| self.get(key))
            .ok_or_else(|| SyncError::MissingSetting(keys::SOURCE_ENDPOINT.to_string()))
    }

    /// Checks the required subset before any I/O.
    pub fn check_required(&self) -> Result<(), SyncError> {
        for key in keys::REQUIRED {
            self.require(key)?;
        }
        self.endpoint()?;
        Ok(())
    }

    /// Parses `sourceQuery` (`a=b&c=d`) into query pairs.
    pub fn extra_query(&self) -> Vec<(String, String)> {
        self.get(keys::SOURCE_QUERY)
            .map(|q| {
                url::form_urlencoded::parse(q.trim_start_matches('?').as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.settings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// HTTP client configuration for external API calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Multi-source synchronization configuration.
///
/// `concurrency` bounds how many *different* partitions the CLI syncs at once;
/// a single run is always sequential.
pub struct SyncConfig {
    pub concurrency: usize,
    /// Lifetime of a partition lock lease before another run may take it over.
    pub lock_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lock_ttl: Duration::from_secs(60 * 60),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Connection descriptor of an external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConnection {
    /// Set from the owning [`SourceEntry`] when the file is loaded.
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Static headers sent with every request (e.g. `Accept`).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: PaginationDescriptor,
}

impl SourceConnection {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
            headers: BTreeMap::new(),
            pagination: PaginationDescriptor::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_enabled() -> bool {
    true
}

/// One `[[sources]]` entry of the sources file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schema: String,
    pub mapping: String,
    #[serde(default)]
    pub category: Option<String>,
    pub connection: SourceConnection,
    /// Free-form run settings (`sourceEndpoint`, `oin`, `portalUrl`, flags...).
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl SourceEntry {
    /// Flattens this entry into the settings map of one run.
    ///
    /// Explicit `settings` win over the structural `schema`/`mapping`/`category`
    /// fields; `source` is always the entry name.
    pub fn to_configuration(&self) -> SyncConfiguration {
        let mut settings = BTreeMap::new();
        settings.insert(keys::SCHEMA.to_string(), self.schema.clone());
        settings.insert(keys::MAPPING.to_string(), self.mapping.clone());
        if let Some(category) = &self.category {
            settings.insert(keys::CATEGORY.to_string(), category.clone());
        }
        settings.extend(self.settings.clone());
        settings.insert(keys::SOURCE.to_string(), self.name.clone());
        SyncConfiguration::new(settings)
    }
}

/// The sources file.
///
/// ```toml
/// [endpoints]
/// openzaak-documents = "https://zaken.example.org/documenten/api/v1/enkelvoudiginformatieobjecten/{id}/download"
///
/// [[sources]]
/// name = "openzaak"
/// schema = "publication"
/// mapping = "zaak-to-publication"
/// category = "Woo-verzoek"
///
/// [sources.connection]
/// base_url = "https://zaken.example.org/zaken/api/v1/"
///
/// [sources.connection.pagination]
/// records_path = "results"
/// more = { kind = "next_token", path = "next" }
///
/// [sources.settings]
/// sourceEndpoint = "zaken"
/// oin = "00000001234567890000"
/// organisatie = "Gemeente Voorbeeld"
/// fileEndpointReference = "openzaak-documents"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaDefinition>,
    #[serde(default)]
    pub mappings: BTreeMap<String, FieldMapping>,
    /// Named download URL templates with an `{id}` placeholder.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

impl SourcesConfig {
    /// Returns enabled sources only.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Finds a source by name, regardless of its enabled flag.
    pub fn find_source(&self, name: &str) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Connection descriptors keyed by source name.
    pub fn connections(&self) -> BTreeMap<String, SourceConnection> {
        self.sources
            .iter()
            .map(|s| (s.name.clone(), s.connection.clone()))
            .collect()
    }

    fn normalize(&mut self) {
        for source in &mut self.sources {
            source.connection.name = source.name.clone();
        }
    }

    fn check_unique_names(&self) -> Result<(), SyncError> {
        let mut seen = std::collections::BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "duplicate source name `{}`",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

/// Default location of the sources file: `~/.config/pubsync/sources.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("pubsync").join("sources.toml"))
}

/// Parses a sources file from a string.
pub fn parse_sources_config(contents: &str) -> Result<SourcesConfig, SyncError> {
    let mut config: SourcesConfig = toml::from_str(contents)
        .map_err(|e| SyncError::Configuration(format!("invalid sources file: {}", e)))?;
    config.normalize();
    config.check_unique_names()?;
    Ok(config)
}

/// Loads the sources file from `path`, or from [`default_config_path`].
pub fn load_sources_config(path: Option<&Path>) -> Result<SourcesConfig, SyncError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| {
            SyncError::Configuration("cannot determine the configuration directory".to_string())
        })?,
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| {
        SyncError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })?;

    tracing::debug!(path = %path.display(), "Loaded sources file");
    parse_sources_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{MoreSignal, PaginationStyle};
    use std::io::Write;

    const SAMPLE: &str = r#"
        [endpoints]
        docs = "https://docs.example.org/{id}/download"

        [[sources]]
        name = "openzaak"
        schema = "publication"
        mapping = "zaak"
        category = "Woo-verzoek"

        [sources.connection]
        base_url = "https://zaken.example.org/api/"
        timeout_secs = 10

        [sources.connection.pagination]
        records_path = "results"
        more = { kind = "next_token", path = "next" }

        [sources.settings]
        sourceEndpoint = "zaken"
        oin = "0001"
        autoPublish = "true"

        [[sources]]
        name = "events"
        enabled = false
        schema = "publication"
        mapping = "event"

        [sources.connection]
        base_url = "https://events.example.org/"

        [schemas.publication]
        required = ["title"]

        [mappings.zaak.fields]
        title = "omschrijving"
    "#;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_db_and_sync_config_defaults() {
        assert_eq!(DbConfig::default().max_connections, 5);
        let sync = SyncConfig::default();
        assert_eq!(sync.concurrency, 4);
        assert_eq!(sync.lock_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_sources_config() {
        let config = parse_sources_config(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.enabled_sources().count(), 1);

        let openzaak = config.find_source("openzaak").unwrap();
        assert_eq!(openzaak.connection.name, "openzaak");
        assert_eq!(openzaak.connection.timeout(), Duration::from_secs(10));
        assert_eq!(openzaak.connection.pagination.style, PaginationStyle::Page);
        assert_eq!(
            openzaak.connection.pagination.more,
            MoreSignal::NextToken {
                path: "next".to_string()
            }
        );

        let events = config.find_source("events").unwrap();
        assert_eq!(events.connection.timeout_secs, 30);
        assert!(config.schemas.contains_key("publication"));
        assert!(config.mappings.contains_key("zaak"));
        assert_eq!(config.endpoints["docs"], "https://docs.example.org/{id}/download");
    }

    #[test]
    fn test_duplicate_source_names_rejected() {
        let contents = r#"
            [[sources]]
            name = "a"
            schema = "s"
            mapping = "m"
            [sources.connection]
            base_url = "https://a.example.org/"

            [[sources]]
            name = "a"
            schema = "s"
            mapping = "m"
            [sources.connection]
            base_url = "https://b.example.org/"
        "#;
        let err = parse_sources_config(contents).unwrap_err();
        assert!(err.to_string().contains("duplicate source name"));
    }

    #[test]
    fn test_to_configuration() {
        let config = parse_sources_config(SAMPLE).unwrap();
        let run = config.find_source("openzaak").unwrap().to_configuration();

        assert_eq!(run.get(keys::SOURCE), Some("openzaak"));
        assert_eq!(run.get(keys::SCHEMA), Some("publication"));
        assert_eq!(run.get(keys::CATEGORY), Some("Woo-verzoek"));
        assert_eq!(run.endpoint().unwrap(), "zaken");
        assert!(run.flag(keys::AUTO_PUBLISH));
        assert!(run.check_required().is_ok());
    }

    #[test]
    fn test_check_required_reports_missing_key() {
        let run = SyncConfiguration::from_pairs([
            ("source", "s"),
            ("schema", "publication"),
            ("mapping", "  "),
            ("oin", "0001"),
            ("sourceEndpoint", "zaken"),
        ]);
        match run.check_required() {
            Err(SyncError::MissingSetting(key)) => assert_eq!(key, "mapping"),
            other => panic!("expected MissingSetting, got {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_alias() {
        let run = SyncConfiguration::from_pairs([("zaaksysteemSearchEndpoint", "search")]);
        assert_eq!(run.endpoint().unwrap(), "search");

        let run = SyncConfiguration::default();
        assert!(matches!(run.endpoint(), Err(SyncError::MissingSetting(_))));
    }

    #[test]
    fn test_extra_query() {
        let run = SyncConfiguration::from_pairs([("sourceQuery", "?status=open&type=a%20b")]);
        assert_eq!(
            run.extra_query(),
            vec![
                ("status".to_string(), "open".to_string()),
                ("type".to_string(), "a b".to_string())
            ]
        );
    }

    #[test]
    fn test_load_sources_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_sources_config(Some(file.path())).unwrap();
        assert_eq!(config.sources.len(), 2);
    }

    #[test]
    fn test_load_sources_config_missing_file() {
        let err = load_sources_config(Some(Path::new("/nonexistent/sources.toml"))).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
