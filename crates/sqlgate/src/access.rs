//! Credential grants and alias resolution for a calling identity.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    policy::Tier,
    profile::DatabaseProfile,
};

/// A profile granted to a credential at a given tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub profile: DatabaseProfile,
    pub tier: Tier,
}

/// Everything a credential may reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub credential_id: String,
    pub display_name: Option<String>,
    pub enabled: bool,
    /// Overall tier of the credential. Operations use the tier of the
    /// matching assignment instead.
    pub tier: Tier,
    pub default_alias: Option<String>,
    pub assignments: Vec<Assignment>,
}

/// Alias and tier listed for a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct GrantedDatabase {
    pub alias: String,
    pub permission: Tier,
}

impl AccessGrant {
    /// Grant that reaches every profile of a local configuration file at its
    /// configured permission.
    pub fn from_config(config: &GatewayConfig, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let assignments: Vec<Assignment> = config
            .databases
            .values()
            .map(|configured| Assignment {
                profile: configured.profile.clone(),
                tier: configured.permission,
            })
            .collect();
        let tier = assignments
            .iter()
            .map(|assignment| assignment.tier)
            .max()
            .unwrap_or_default();

        Self {
            credential_id: format!("config:{display_name}"),
            display_name: Some(display_name).filter(|name| !name.trim().is_empty()),
            enabled: true,
            tier,
            default_alias: config.default_db.clone(),
            assignments,
        }
    }

    pub fn granted_databases(&self) -> Vec<GrantedDatabase> {
        self.assignments
            .iter()
            .map(|assignment| GrantedDatabase {
                alias: assignment.profile.alias.clone(),
                permission: assignment.tier,
            })
            .collect()
    }

    fn assignment(&self, alias: &str) -> Option<&Assignment> {
        self.assignments
            .iter()
            .find(|assignment| assignment.profile.alias == alias)
    }
}

/// Picks the profile a call runs against and the tier it runs at.
///
/// Alias selection: the explicit alias, then the grant's default, then the
/// sole assignment. The chosen profile is validated before it is returned.
pub fn resolve<'g>(
    grant: &'g AccessGrant,
    alias: Option<&str>,
) -> GatewayResult<(&'g DatabaseProfile, Tier)> {
    if !grant.enabled {
        return Err(GatewayError::UnknownCredential);
    }
    if grant.assignments.is_empty() {
        return Err(GatewayError::NoDatabaseAssigned);
    }

    let explicit = alias.map(str::trim).filter(|alias| !alias.is_empty());
    let chosen = match explicit.or(grant.default_alias.as_deref()) {
        Some(alias) => alias,
        None if grant.assignments.len() == 1 => grant.assignments[0].profile.alias.as_str(),
        None => return Err(GatewayError::AliasRequired),
    };

    let assignment = grant
        .assignment(chosen)
        .ok_or_else(|| GatewayError::AliasNotGranted(chosen.to_string()))?;
    assignment.profile.validate()?;
    Ok((&assignment.profile, assignment.tier))
}

/// Lowercase hex SHA-256 of a bearer token, the form credentials are stored in.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lookup of grants by hashed credential.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn find_by_token_hash(&self, token_hash: &str) -> GatewayResult<Option<AccessGrant>>;
}

#[derive(Debug, Default)]
pub struct InMemoryGrantStore {
    grants: RwLock<HashMap<String, AccessGrant>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `grant` under the digest of `token`; the token itself is not kept.
    pub fn insert(&self, token: &str, grant: AccessGrant) {
        self.grants.write().insert(hash_token(token), grant);
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn find_by_token_hash(&self, token_hash: &str) -> GatewayResult<Option<AccessGrant>> {
        Ok(self.grants.read().get(token_hash).cloned())
    }
}
