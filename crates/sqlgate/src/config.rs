//! Declarative configuration of reachable databases and the audit policy.
//!
//! The YAML document is parsed into loosely typed `Raw*` structs and then
//! validated into [`GatewayConfig`] in one pass, so a malformed profile is
//! reported at load time rather than on first use.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    dialect::Dialect,
    error::{GatewayError, GatewayResult},
    policy::Tier,
    profile::{DatabaseProfile, DirectSettings, Endpoint, ProxiedSettings, Secret},
};

const DEFAULT_AUDIT_DIR: &str = "./logs/audit";
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Locations probed when no configuration path is given explicitly.
const CONFIG_CANDIDATES: [&str; 2] = ["config.yaml", "sqlgate/config.yaml"];

/// Validation failures raised while loading configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("databases.{alias}: 'mode' is required (direct or proxied)")]
    MissingMode { alias: String },
    #[error("databases.{alias}: mode must be 'direct' or 'proxied', got '{mode}'")]
    InvalidMode { alias: String, mode: String },
    #[error("databases.{alias}: missing required field '{field}'")]
    MissingField { alias: String, field: &'static str },
    #[error("databases.{alias}: 'port' must be a positive integer, got {port}")]
    InvalidPort { alias: String, port: i64 },
    #[error("databases.{alias}: unsupported database type '{dialect}' (expected one of {supported})")]
    UnsupportedDialect {
        alias: String,
        dialect: String,
        supported: String,
    },
    #[error("databases.{alias}: invalid permission '{value}' (expected readonly, write or full)")]
    InvalidPermission { alias: String, value: String },
    #[error("audit: {0}")]
    InvalidAudit(String),
}

/// Audit policy block of the configuration document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    pub retention_days: u32,
    pub hmac_key: Option<Vec<u8>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from(DEFAULT_AUDIT_DIR),
            retention_days: DEFAULT_RETENTION_DAYS,
            hmac_key: None,
        }
    }
}

impl AuditConfig {
    pub fn enabled_at(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }
}

/// A validated profile together with the tier granted to local callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredDatabase {
    pub profile: DatabaseProfile,
    pub permission: Tier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfig {
    pub databases: BTreeMap<String, ConfiguredDatabase>,
    pub default_db: Option<String>,
    pub audit: AuditConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    databases: BTreeMap<String, RawDatabase>,
    default_db: Option<String>,
    #[serde(default)]
    audit: RawAudit,
}

#[derive(Debug, Default, Deserialize)]
struct RawDatabase {
    mode: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    host: Option<String>,
    port: Option<i64>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    api_url: Option<String>,
    api_token: Option<String>,
    permission: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAudit {
    enabled: Option<bool>,
    log_dir: Option<String>,
    retention_days: Option<i64>,
    hmac_key: Option<String>,
}

impl GatewayConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&text, path.parent())
    }

    /// Parses a YAML document. Relative audit directories are resolved
    /// against `base_dir` when one is given.
    pub fn from_yaml_str(text: &str, base_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let raw: Option<RawConfig> =
            serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let raw = raw.unwrap_or_default();

        let mut databases = BTreeMap::new();
        for (alias, entry) in raw.databases {
            let configured = build_database(&alias, entry)?;
            databases.insert(alias, configured);
        }

        Ok(Self {
            databases,
            default_db: raw.default_db.filter(|alias| !alias.trim().is_empty()),
            audit: build_audit(raw.audit, base_dir)?,
        })
    }

    /// Picks the profile for `alias`, falling back to `default_db` and then to
    /// the only configured profile.
    pub fn resolve_profile(&self, alias: Option<&str>) -> GatewayResult<&DatabaseProfile> {
        let requested = alias
            .filter(|alias| !alias.trim().is_empty())
            .or(self.default_db.as_deref());

        let alias = match requested {
            Some(alias) => alias,
            None if self.databases.len() == 1 => {
                return Ok(&self
                    .databases
                    .values()
                    .next()
                    .ok_or(GatewayError::AliasRequired)?
                    .profile)
            }
            None => return Err(GatewayError::AliasRequired),
        };

        self.databases
            .get(alias)
            .map(|configured| &configured.profile)
            .ok_or_else(|| GatewayError::UnknownAlias(alias.to_string()))
    }
}

/// Finds the configuration file: the explicit path if given, otherwise the
/// first existing candidate relative to the working directory.
pub fn locate_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    CONFIG_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigError::NotFound(CONFIG_CANDIDATES.join(", ")))
}

fn build_database(alias: &str, raw: RawDatabase) -> Result<ConfiguredDatabase, ConfigError> {
    let mode = raw
        .mode
        .as_deref()
        .map(str::trim)
        .filter(|mode| !mode.is_empty())
        .ok_or_else(|| ConfigError::MissingMode {
            alias: alias.to_string(),
        })?
        .to_ascii_lowercase();

    let endpoint = match mode.as_str() {
        "direct" => Endpoint::Direct(build_direct(alias, &raw)?),
        // `api` is the older spelling of proxied mode.
        "proxied" | "api" => Endpoint::Proxied(ProxiedSettings {
            base_url: raw.api_url.clone().unwrap_or_default().trim().to_string(),
            token: Secret::new(raw.api_token.clone().unwrap_or_default()),
        }),
        _ => {
            return Err(ConfigError::InvalidMode {
                alias: alias.to_string(),
                mode,
            })
        }
    };

    let permission = match raw.permission.as_deref() {
        None => Tier::default(),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidPermission {
            alias: alias.to_string(),
            value: value.to_string(),
        })?,
    };

    let profile = DatabaseProfile {
        alias: alias.to_string(),
        endpoint,
    };
    profile.validate()?;

    Ok(ConfiguredDatabase {
        profile,
        permission,
    })
}

fn build_direct(alias: &str, raw: &RawDatabase) -> Result<DirectSettings, ConfigError> {
    let kind = raw
        .kind
        .as_deref()
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            alias: alias.to_string(),
            field: "type",
        })?;

    let dialect: Dialect = kind.parse().map_err(|_| ConfigError::UnsupportedDialect {
        alias: alias.to_string(),
        dialect: kind.to_string(),
        supported: Dialect::supported_names(),
    })?;

    let port = match raw.port {
        None => None,
        Some(port) if (1..=i64::from(u16::MAX)).contains(&port) => Some(port as u16),
        Some(port) => {
            return Err(ConfigError::InvalidPort {
                alias: alias.to_string(),
                port,
            })
        }
    };

    Ok(DirectSettings {
        dialect,
        host: trimmed(&raw.host),
        port,
        user: trimmed(&raw.user),
        password: raw.password.clone().map(Secret::new),
        database: trimmed(&raw.database),
    })
}

fn build_audit(raw: RawAudit, base_dir: Option<&Path>) -> Result<AuditConfig, ConfigError> {
    let mut log_dir = PathBuf::from(raw.log_dir.as_deref().unwrap_or(DEFAULT_AUDIT_DIR));
    if log_dir.is_relative() {
        if let Some(base) = base_dir.filter(|base| !base.as_os_str().is_empty()) {
            log_dir = base.join(log_dir);
        }
    }

    let retention_days = match raw.retention_days {
        None => DEFAULT_RETENTION_DAYS,
        Some(days) if (1..=i64::from(u32::MAX)).contains(&days) => days as u32,
        Some(days) => {
            return Err(ConfigError::InvalidAudit(format!(
                "retention_days must be a positive integer, got {days}"
            )))
        }
    };

    let hmac_key = match raw.hmac_key.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(encoded) => Some(
            STANDARD
                .decode(encoded)
                .map_err(|_| ConfigError::InvalidAudit("hmac_key must be base64".into()))?,
        ),
    };

    Ok(AuditConfig {
        enabled: raw.enabled.unwrap_or(false),
        log_dir,
        retention_days,
        hmac_key,
    })
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Mode;

    const SAMPLE: &str = r#"
databases:
  sales:
    mode: direct
    type: postgres
    host: pg.internal
    user: reporter
    password: s3cret
    database: sales
    permission: write
  local:
    mode: direct
    type: sqlite
    database: ./data/local.db
  upstream:
    mode: api
    api_url: https://gateway.example/
    api_token: tok-123
default_db: sales
audit:
  enabled: true
  log_dir: logs
  retention_days: 7
"#;

    #[test]
    fn loads_all_profiles_and_audit_policy() {
        let config = GatewayConfig::from_yaml_str(SAMPLE, Some(Path::new("/etc/sqlgate"))).unwrap();
        assert_eq!(config.databases.len(), 3);
        assert_eq!(config.default_db.as_deref(), Some("sales"));
        assert_eq!(config.databases["sales"].permission, Tier::Write);
        assert_eq!(config.databases["local"].permission, Tier::Readonly);
        assert_eq!(config.databases["upstream"].profile.mode(), Mode::Proxied);
        assert!(config.audit.enabled);
        assert_eq!(config.audit.retention_days, 7);
        assert_eq!(config.audit.log_dir, PathBuf::from("/etc/sqlgate/logs"));
    }

    #[test]
    fn resolves_default_then_sole_profile() {
        let config = GatewayConfig::from_yaml_str(SAMPLE, None).unwrap();
        assert_eq!(config.resolve_profile(None).unwrap().alias, "sales");
        assert_eq!(config.resolve_profile(Some("")).unwrap().alias, "sales");
        assert_eq!(config.resolve_profile(Some("local")).unwrap().alias, "local");
        assert!(matches!(
            config.resolve_profile(Some("missing")),
            Err(GatewayError::UnknownAlias(alias)) if alias == "missing"
        ));

        let single = GatewayConfig::from_yaml_str(
            "databases:\n  only:\n    mode: direct\n    type: sqlite\n    database: a.db\n",
            None,
        )
        .unwrap();
        assert_eq!(single.resolve_profile(None).unwrap().alias, "only");
    }

    #[test]
    fn several_profiles_without_default_require_an_alias() {
        let text = SAMPLE.replace("default_db: sales", "");
        let config = GatewayConfig::from_yaml_str(&text, None).unwrap();
        assert!(matches!(
            config.resolve_profile(None),
            Err(GatewayError::AliasRequired)
        ));
    }

    #[test]
    fn missing_host_is_reported_with_profile_and_field() {
        let text = "databases:\n  crm:\n    mode: direct\n    type: mysql\n    user: app\n    database: crm\n";
        let err = GatewayConfig::from_yaml_str(text, None).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingField {
                alias: "crm".into(),
                field: "host"
            }
        );
    }

    #[test]
    fn non_positive_port_is_rejected() {
        let text = "databases:\n  crm:\n    mode: direct\n    type: mysql\n    host: h\n    user: u\n    database: d\n    port: -1\n";
        let err = GatewayConfig::from_yaml_str(text, None).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidPort {
                alias: "crm".into(),
                port: -1
            }
        );
    }

    #[test]
    fn unsupported_dialect_and_mode_are_distinct_errors() {
        let text = "databases:\n  docs:\n    mode: direct\n    type: mongodb\n";
        let err = GatewayConfig::from_yaml_str(text, None).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedDialect { ref alias, .. } if alias == "docs"));

        let text = "databases:\n  docs:\n    mode: tunnel\n";
        let err = GatewayConfig::from_yaml_str(text, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMode { .. }));

        let text = "databases:\n  docs:\n    type: sqlite\n";
        let err = GatewayConfig::from_yaml_str(text, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMode { .. }));
    }

    #[test]
    fn invalid_permission_and_hmac_key_are_rejected() {
        let text = "databases:\n  a:\n    mode: direct\n    type: sqlite\n    database: a.db\n    permission: root\n";
        assert!(matches!(
            GatewayConfig::from_yaml_str(text, None),
            Err(ConfigError::InvalidPermission { .. })
        ));

        let text = "audit:\n  enabled: true\n  hmac_key: '%%%'\n";
        assert!(matches!(
            GatewayConfig::from_yaml_str(text, None),
            Err(ConfigError::InvalidAudit(_))
        ));
    }

    #[test]
    fn empty_document_is_an_empty_config() {
        let config = GatewayConfig::from_yaml_str("", None).unwrap();
        assert!(config.databases.is_empty());
        assert!(!config.audit.enabled);
        assert!(matches!(
            config.resolve_profile(None),
            Err(GatewayError::AliasRequired)
        ));
    }

    #[test]
    fn locate_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gw.yaml");
        fs::write(&path, "databases: {}\n").unwrap();
        assert_eq!(locate_config_file(Some(&path)).unwrap(), path);
        assert!(matches!(
            locate_config_file(Some(&dir.path().join("absent.yaml"))),
            Err(ConfigError::NotFound(_))
        ));
    }
}
