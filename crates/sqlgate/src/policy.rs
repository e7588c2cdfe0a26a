//! Permission tiers and the per-operation authorization rules.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    classify::{classify, StatementClass},
    error::{GatewayError, GatewayResult},
    params::has_stacked_statement,
};

fn ensure_single_statement(sql: &str) -> GatewayResult<()> {
    if has_stacked_statement(sql) {
        return Err(GatewayError::StatementNotAllowed(
            "only a single statement may be submitted per call".into(),
        ));
    }
    Ok(())
}

/// Ordered permission level attached to a credential's database assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Readonly,
    Write,
    Full,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Readonly => "readonly",
            Tier::Write => "write",
            Tier::Full => "full",
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Readonly
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "readonly" => Ok(Tier::Readonly),
            "write" => Ok(Tier::Write),
            "full" => Ok(Tier::Full),
            other => Err(format!("invalid permission level: {other}")),
        }
    }
}

/// Allows a statement on the read path. `readonly` is the lowest tier, so any
/// tier may read; only the statement class is checked.
pub fn authorize_read(_tier: Tier, sql: &str) -> GatewayResult<()> {
    ensure_single_statement(sql)?;
    match classify(sql) {
        StatementClass::ReadOnly => Ok(()),
        _ => Err(GatewayError::StatementNotAllowed(
            "only SELECT/WITH queries are allowed on the query path".into(),
        )),
    }
}

/// Allows a statement on the write path, returning its class.
pub fn authorize_write(tier: Tier, sql: &str) -> GatewayResult<StatementClass> {
    if tier < Tier::Write {
        return Err(GatewayError::PermissionDenied(
            "write operations require permission=write or permission=full".into(),
        ));
    }
    ensure_single_statement(sql)?;
    let class = classify(sql);
    match class {
        StatementClass::Write { is_delete: true } if tier != Tier::Full => Err(
            GatewayError::PermissionDenied("DELETE is only allowed for permission=full".into()),
        ),
        StatementClass::Write { .. } => Ok(class),
        _ => Err(GatewayError::StatementNotAllowed(
            "only INSERT/UPDATE/DELETE statements are allowed on the execute path".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Tier; 3] = [Tier::Readonly, Tier::Write, Tier::Full];

    #[test]
    fn tiers_are_totally_ordered() {
        assert!(Tier::Readonly < Tier::Write);
        assert!(Tier::Write < Tier::Full);
        assert_eq!("FULL".parse::<Tier>(), Ok(Tier::Full));
        assert!("admin".parse::<Tier>().is_err());
    }

    #[test]
    fn reads_are_allowed_for_every_tier() {
        for tier in ALL {
            authorize_read(tier, "SELECT * FROM t").unwrap();
            authorize_read(tier, "with q as (select 1) select * from q").unwrap();
        }
    }

    #[test]
    fn read_path_rejects_non_queries() {
        for tier in ALL {
            let err = authorize_read(tier, "UPDATE t SET x = 1").unwrap_err();
            assert!(matches!(err, GatewayError::StatementNotAllowed(_)));
        }
    }

    #[test]
    fn stacked_statements_are_rejected_on_both_paths() {
        for tier in ALL {
            let err = authorize_read(tier, "SELECT 1; DELETE FROM t").unwrap_err();
            assert!(matches!(err, GatewayError::StatementNotAllowed(_)));
        }
        for tier in [Tier::Write, Tier::Full] {
            let err = authorize_write(tier, "UPDATE t SET v = v; DELETE FROM t").unwrap_err();
            assert!(matches!(err, GatewayError::StatementNotAllowed(_)));
        }
        authorize_read(Tier::Readonly, "SELECT ';' AS s;").unwrap();
        authorize_write(Tier::Write, "INSERT INTO t VALUES ('a;b');\n").unwrap();
    }

    #[test]
    fn delete_requires_full() {
        for tier in ALL {
            let result = authorize_write(tier, "DELETE FROM t");
            if tier == Tier::Full {
                assert_eq!(result.unwrap(), StatementClass::Write { is_delete: true });
            } else {
                assert!(matches!(result, Err(GatewayError::PermissionDenied(_))));
            }
        }
    }

    #[test]
    fn write_path_requires_write_tier_and_write_statement() {
        assert!(matches!(
            authorize_write(Tier::Readonly, "INSERT INTO t VALUES (1)"),
            Err(GatewayError::PermissionDenied(_))
        ));
        authorize_write(Tier::Write, "update t set x = 1").unwrap();
        for sql in ["SELECT 1", "DROP TABLE t", "  "] {
            assert!(matches!(
                authorize_write(Tier::Full, sql),
                Err(GatewayError::StatementNotAllowed(_))
            ));
        }
    }
}
