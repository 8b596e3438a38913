//! Configuration for the log agent.
//!
//! The config file (YAML by default, any format the `config` crate detects
//! from the extension) names the containers to watch, the keywords to look
//! for and where notifications go. A loaded [`AppConfig`] is immutable; a
//! reload builds a fresh snapshot and swaps it in whole.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::warn;

/// Errors from loading or validating the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    /// The file parsed but is not usable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawConfig")]
pub struct AppConfig {
    /// Containers to monitor, keyed by container name.
    pub containers: BTreeMap<String, ContainerConfig>,

    /// Keywords applied to every container.
    pub global_keywords: Vec<KeywordSpec>,

    /// Notification channels.
    pub notifications: NotificationsConfig,

    /// Application-wide settings.
    pub settings: Settings,
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let config: AppConfig = source.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate config text in the given format.
    pub fn from_text(text: &str, format: config::FileFormat) -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(config::File::from_str(text, format))
            .build()?;
        let config: AppConfig = source.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field rules the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.containers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one container has to be configured".to_string(),
            ));
        }

        let has_keywords = !self.global_keywords.is_empty()
            || self.containers.values().any(|c| !c.keywords.is_empty());
        if !has_keywords {
            return Err(ConfigError::Invalid(
                "no keywords configured; set keywords per container or globally".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a container name is selected for monitoring.
    pub fn is_selected(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    /// Selected container names, sorted.
    pub fn selected_containers(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    /// Per-container settings, if the container is selected.
    pub fn container(&self, name: &str) -> Option<&ContainerConfig> {
        self.containers.get(name)
    }
}

/// Per-container keywords and setting overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    #[serde(deserialize_with = "keyword_list")]
    pub keywords: Vec<KeywordSpec>,
    #[serde(deserialize_with = "keyword_list")]
    pub excluded_keywords: Vec<KeywordSpec>,
    pub notification_cooldown: Option<u64>,
    pub notification_title: Option<String>,
    pub ntfy_topic: Option<String>,
    pub ntfy_tags: Option<String>,
    pub ntfy_priority: Option<String>,
    pub webhook_url: Option<String>,
}

/// A keyword to search for.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum KeywordSpec {
    /// Case-insensitive substring. Bare numbers (`500`) count as text.
    Plain(#[serde(deserialize_with = "text_or_number")] String),

    /// Regular expression, optionally formatting the message from its named
    /// groups (`{group}` placeholders).
    Regex {
        regex: String,
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        notification_cooldown: Option<u64>,
    },

    /// Case-insensitive substring with per-keyword settings.
    Keyword {
        #[serde(deserialize_with = "text_or_number")]
        keyword: String,
        #[serde(default)]
        notification_cooldown: Option<u64>,
    },
}

impl KeywordSpec {
    /// The raw pattern text.
    pub fn pattern(&self) -> &str {
        match self {
            KeywordSpec::Plain(keyword) | KeywordSpec::Keyword { keyword, .. } => keyword,
            KeywordSpec::Regex { regex, .. } => regex,
        }
    }

    /// Per-keyword cooldown override in seconds.
    pub fn cooldown(&self) -> Option<u64> {
        match self {
            KeywordSpec::Plain(_) => None,
            KeywordSpec::Regex {
                notification_cooldown,
                ..
            }
            | KeywordSpec::Keyword {
                notification_cooldown,
                ..
            } => *notification_cooldown,
        }
    }
}

/// Notification channels.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub ntfy: Option<NtfyConfig>,
    pub webhook: Option<WebhookConfig>,
}

/// ntfy push settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NtfyConfig {
    pub url: String,
    pub topic: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_ntfy_priority")]
    pub priority: String,
    #[serde(default = "default_ntfy_tags")]
    pub tags: String,
}

fn default_ntfy_priority() -> String {
    "3".to_string()
}

fn default_ntfy_tags() -> String {
    "kite,mag".to_string()
}

/// Generic JSON webhook settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Application-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Group indented continuation lines into one log entry.
    pub multi_line_entries: bool,

    pub disable_start_message: bool,
    pub disable_shutdown_message: bool,
    pub disable_config_reload_message: bool,
    pub disable_container_event_message: bool,

    /// Watch the config file and apply changes without a restart.
    pub reload_config: bool,

    /// Minimum seconds between two notifications for the same keyword.
    pub notification_cooldown: u64,

    /// Title template, or `default`.
    pub notification_title: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            multi_line_entries: true,
            disable_start_message: false,
            disable_shutdown_message: false,
            disable_config_reload_message: false,
            disable_container_event_message: false,
            reload_config: true,
            notification_cooldown: 5,
            notification_title: "default".to_string(),
        }
    }
}

/// Keyword text written as a string or as a bare number.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        Str(String),
        Int(i64),
        UInt(u64),
        Float(f64),
    }

    Ok(match Text::deserialize(deserializer)? {
        Text::Str(s) => s,
        Text::Int(n) => n.to_string(),
        Text::UInt(n) => n.to_string(),
        Text::Float(n) => n.to_string(),
    })
}

/// A keyword list where an unusable entry is skipped instead of failing the
/// whole file.
fn keyword_list<'de, D>(deserializer: D) -> Result<Vec<KeywordSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entry {
        Valid(KeywordSpec),
        Invalid(IgnoredAny),
    }

    let entries = Vec::<Entry>::deserialize(deserializer)?;
    let total = entries.len();
    let keywords: Vec<KeywordSpec> = entries
        .into_iter()
        .filter_map(|entry| match entry {
            Entry::Valid(keyword) => Some(keyword),
            Entry::Invalid(_) => None,
        })
        .collect();

    if keywords.len() < total {
        warn!(skipped = total - keywords.len(), "Ignoring malformed keyword entries");
    }
    Ok(keywords)
}

// =============================================================================
// Raw file shape
// =============================================================================

/// Accepts the legacy list form (`containers: [web, db]`) as well as the map
/// form with optional bodies (`web:` with nothing under it).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawContainers {
    List(Vec<String>),
    Map(BTreeMap<String, Option<RawContainerEntry>>),
}

/// A container body may also be a bare keyword list.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawContainerEntry {
    Keywords(#[serde(deserialize_with = "keyword_list")] Vec<KeywordSpec>),
    Config(ContainerConfig),
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawGlobalKeywords {
    #[serde(deserialize_with = "keyword_list")]
    keywords: Vec<KeywordSpec>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    containers: Option<RawContainers>,
    global_keywords: RawGlobalKeywords,
    notifications: NotificationsConfig,
    settings: Settings,
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        let containers = match raw.containers {
            None => BTreeMap::new(),
            Some(RawContainers::List(names)) => names
                .into_iter()
                .map(|name| (name, ContainerConfig::default()))
                .collect(),
            Some(RawContainers::Map(entries)) => entries
                .into_iter()
                .map(|(name, entry)| {
                    let config = match entry {
                        None => ContainerConfig::default(),
                        Some(RawContainerEntry::Keywords(keywords)) => ContainerConfig {
                            keywords,
                            ..Default::default()
                        },
                        Some(RawContainerEntry::Config(config)) => config,
                    };
                    (name, config)
                })
                .collect(),
        };

        Self {
            containers,
            global_keywords: raw.global_keywords.keywords,
            notifications: raw.notifications,
            settings: raw.settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    const SAMPLE: &str = r#"
containers:
  web:
    keywords:
      - error
      - regex: 'took (?P<ms>\d+)ms'
        template: "slow request: {ms}ms"
    notification_cooldown: 10
  db: [deadlock]
global_keywords:
  keywords:
    - panic
notifications:
  ntfy:
    url: http://ntfy.local
    topic: alerts
settings:
  log_level: debug
  multi_line_entries: false
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_text(SAMPLE, FileFormat::Yaml).unwrap();

        assert_eq!(config.selected_containers(), vec!["db", "web"]);
        assert!(config.is_selected("web"));
        assert!(!config.is_selected("cache"));

        let web = config.container("web").unwrap();
        assert_eq!(web.keywords.len(), 2);
        assert_eq!(web.keywords[0], KeywordSpec::Plain("error".to_string()));
        assert_eq!(web.keywords[1].pattern(), r"took (?P<ms>\d+)ms");
        assert_eq!(web.notification_cooldown, Some(10));

        assert_eq!(
            config.container("db").unwrap().keywords,
            vec![KeywordSpec::Plain("deadlock".to_string())]
        );
        assert_eq!(config.global_keywords.len(), 1);

        let ntfy = config.notifications.ntfy.as_ref().unwrap();
        assert_eq!(ntfy.topic, "alerts");
        assert_eq!(ntfy.priority, "3");
        assert_eq!(ntfy.tags, "kite,mag");

        assert_eq!(config.settings.log_level, "debug");
        assert!(!config.settings.multi_line_entries);
        assert!(config.settings.reload_config);
    }

    #[test]
    fn test_legacy_container_list() {
        let text = r#"
containers: [web, db]
global_keywords:
  keywords: [error]
"#;
        let config = AppConfig::from_text(text, FileFormat::Yaml).unwrap();
        assert_eq!(config.selected_containers(), vec!["db", "web"]);
    }

    #[test]
    fn test_rejects_missing_containers() {
        let text = r#"
global_keywords:
  keywords: [error]
"#;
        let err = AppConfig::from_text(text, FileFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_missing_keywords() {
        let text = r#"
containers:
  web:
"#;
        let err = AppConfig::from_text(text, FileFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.containers.len(), 2);
    }

    #[test]
    fn test_numeric_keywords_are_text() {
        let text = "containers:\n  web:\n    keywords: [error, 500]\n  api: [404, {keyword: 503}]\n";
        let config = AppConfig::from_text(text, FileFormat::Yaml).unwrap();

        assert_eq!(
            config.container("web").unwrap().keywords,
            vec![
                KeywordSpec::Plain("error".to_string()),
                KeywordSpec::Plain("500".to_string()),
            ]
        );
        let api = &config.container("api").unwrap().keywords;
        assert_eq!(api[0], KeywordSpec::Plain("404".to_string()));
        assert_eq!(api[1].pattern(), "503");
    }

    #[test]
    fn test_malformed_keyword_entries_are_skipped() {
        let text = r#"
containers:
  web:
    keywords:
      - error
      - [nested, list]
      - regex: 'fatal.*'
      - unknown: field
global_keywords:
  keywords: [panic, [a, b]]
"#;
        let config = AppConfig::from_text(text, FileFormat::Yaml).unwrap();

        let web = &config.container("web").unwrap().keywords;
        assert_eq!(web.len(), 2);
        assert_eq!(web[0], KeywordSpec::Plain("error".to_string()));
        assert_eq!(web[1].pattern(), "fatal.*");
        assert_eq!(config.global_keywords, vec![KeywordSpec::Plain("panic".to_string())]);
    }
}
