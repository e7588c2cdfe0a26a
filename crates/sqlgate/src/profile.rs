//! Resolved description of one reachable database target.

use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::{
    config::ConfigError,
    dialect::{Dialect, FieldRequirement},
};

/// Credential material that must never reach logs, audit records or errors.
#[derive(Clone, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Direct,
    Proxied,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Direct => "direct",
            Mode::Proxied => "proxied",
        }
    }
}

/// Connection fields for a backend the gateway talks to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSettings {
    pub dialect: Dialect,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<Secret>,
    /// Database name, or the file path for file-only dialects.
    pub database: Option<String>,
}

impl DirectSettings {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
        }
    }
}

/// Remote instance of this gateway that executes on our behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedSettings {
    pub base_url: String,
    pub token: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Direct(DirectSettings),
    Proxied(ProxiedSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseProfile {
    pub alias: String,
    pub endpoint: Endpoint,
}

impl DatabaseProfile {
    pub fn direct(alias: impl Into<String>, settings: DirectSettings) -> Self {
        Self {
            alias: alias.into(),
            endpoint: Endpoint::Direct(settings),
        }
    }

    pub fn proxied(
        alias: impl Into<String>,
        base_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            alias: alias.into(),
            endpoint: Endpoint::Proxied(ProxiedSettings {
                base_url: base_url.into(),
                token: Secret::new(token),
            }),
        }
    }

    /// Convenience constructor for an embedded database file.
    pub fn sqlite(alias: impl Into<String>, path: impl Into<String>) -> Self {
        let mut settings = DirectSettings::new(Dialect::Sqlite);
        settings.database = Some(path.into());
        Self::direct(alias, settings)
    }

    pub fn mode(&self) -> Mode {
        match self.endpoint {
            Endpoint::Direct(_) => Mode::Direct,
            Endpoint::Proxied(_) => Mode::Proxied,
        }
    }

    pub fn dialect(&self) -> Option<Dialect> {
        match &self.endpoint {
            Endpoint::Direct(settings) => Some(settings.dialect),
            Endpoint::Proxied(_) => None,
        }
    }

    /// Checks the field requirements of the profile's mode and dialect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = |field: &'static str| ConfigError::MissingField {
            alias: self.alias.clone(),
            field,
        };

        match &self.endpoint {
            Endpoint::Direct(settings) => match settings.dialect.spec().requirement {
                FieldRequirement::Network { database_required } => {
                    if is_blank(&settings.host) {
                        return Err(missing("host"));
                    }
                    if is_blank(&settings.user) {
                        return Err(missing("user"));
                    }
                    if database_required && is_blank(&settings.database) {
                        return Err(missing("database"));
                    }
                    if settings.port == Some(0) {
                        return Err(ConfigError::InvalidPort {
                            alias: self.alias.clone(),
                            port: 0,
                        });
                    }
                    Ok(())
                }
                FieldRequirement::FilePath => {
                    if is_blank(&settings.database) {
                        return Err(missing("database"));
                    }
                    Ok(())
                }
            },
            Endpoint::Proxied(settings) => {
                if settings.base_url.trim().is_empty() {
                    return Err(missing("api_url"));
                }
                if settings.token.is_blank() {
                    return Err(missing("api_token"));
                }
                Ok(())
            }
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
