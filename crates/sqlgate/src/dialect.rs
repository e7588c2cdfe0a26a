//! Static registry of the relational backends the gateway understands.
//!
//! Every dialect-specific decision (default port, required connection fields,
//! which wire driver executes it, how its catalog is queried) is read from
//! [`DialectSpec`], so supporting another backend is a single table entry.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Mysql,
    Mariadb,
    Oracle,
    Mssql,
    Db2,
    Dm,
    Kingbase,
    Sqlite,
}

/// Which connection fields a dialect needs in direct mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRequirement {
    /// Network backend: host and user always, database name unless optional.
    Network { database_required: bool },
    /// Embedded backend addressed by a file path stored in `database`.
    FilePath,
}

/// Wire driver used to execute statements directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    Postgres,
    MySql,
    Sqlite,
}

impl Driver {
    pub fn scheme(&self) -> &'static str {
        match self {
            Driver::Postgres => "postgres",
            Driver::MySql => "mysql",
            Driver::Sqlite => "sqlite",
        }
    }
}

/// Shape of the metadata query used for schema introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogQuery {
    /// `information_schema.columns` restricted by a schema predicate.
    InformationSchema {
        schema_predicate: &'static str,
        text_casts: bool,
    },
    /// Oracle-style `user_tab_columns`.
    UserTabColumns,
    /// DB2 `SYSCAT.COLUMNS`.
    SysCat,
    /// No catalog-wide call; per-table introspection through the handle.
    TableInfo,
}

#[derive(Debug, Clone, Copy)]
pub struct DialectSpec {
    pub dialect: Dialect,
    pub name: &'static str,
    pub default_port: Option<u16>,
    pub requirement: FieldRequirement,
    pub driver: Option<Driver>,
    pub catalog: CatalogQuery,
}

const PG_CATALOG: CatalogQuery = CatalogQuery::InformationSchema {
    schema_predicate: "table_schema = 'public'",
    text_casts: true,
};

const MYSQL_CATALOG: CatalogQuery = CatalogQuery::InformationSchema {
    schema_predicate: "table_schema = DATABASE()",
    text_casts: false,
};

const NETWORK: FieldRequirement = FieldRequirement::Network {
    database_required: true,
};

static REGISTRY: [DialectSpec; 9] = [
    DialectSpec {
        dialect: Dialect::Postgres,
        name: "postgres",
        default_port: Some(5432),
        requirement: NETWORK,
        driver: Some(Driver::Postgres),
        catalog: PG_CATALOG,
    },
    DialectSpec {
        dialect: Dialect::Mysql,
        name: "mysql",
        default_port: Some(3306),
        requirement: NETWORK,
        driver: Some(Driver::MySql),
        catalog: MYSQL_CATALOG,
    },
    DialectSpec {
        dialect: Dialect::Mariadb,
        name: "mariadb",
        default_port: Some(3306),
        requirement: NETWORK,
        driver: Some(Driver::MySql),
        catalog: MYSQL_CATALOG,
    },
    DialectSpec {
        dialect: Dialect::Oracle,
        name: "oracle",
        default_port: Some(1521),
        requirement: NETWORK,
        driver: None,
        catalog: CatalogQuery::UserTabColumns,
    },
    DialectSpec {
        dialect: Dialect::Mssql,
        name: "mssql",
        default_port: Some(1433),
        requirement: NETWORK,
        driver: None,
        catalog: CatalogQuery::InformationSchema {
            schema_predicate: "TABLE_SCHEMA = 'dbo'",
            text_casts: false,
        },
    },
    DialectSpec {
        dialect: Dialect::Db2,
        name: "db2",
        default_port: Some(50000),
        requirement: NETWORK,
        driver: None,
        catalog: CatalogQuery::SysCat,
    },
    DialectSpec {
        dialect: Dialect::Dm,
        name: "dm",
        default_port: Some(5236),
        requirement: FieldRequirement::Network {
            database_required: false,
        },
        driver: None,
        catalog: CatalogQuery::UserTabColumns,
    },
    DialectSpec {
        dialect: Dialect::Kingbase,
        name: "kingbase",
        default_port: Some(54321),
        requirement: NETWORK,
        driver: Some(Driver::Postgres),
        catalog: PG_CATALOG,
    },
    DialectSpec {
        dialect: Dialect::Sqlite,
        name: "sqlite",
        default_port: None,
        requirement: FieldRequirement::FilePath,
        driver: Some(Driver::Sqlite),
        catalog: CatalogQuery::TableInfo,
    },
];

impl Dialect {
    pub fn spec(&self) -> &'static DialectSpec {
        // The registry is ordered like the enum.
        &REGISTRY[*self as usize]
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().name
    }

    pub fn default_port(&self) -> Option<u16> {
        self.spec().default_port
    }

    pub fn driver(&self) -> Option<Driver> {
        self.spec().driver
    }

    pub fn all() -> impl Iterator<Item = Dialect> {
        REGISTRY.iter().map(|spec| spec.dialect)
    }

    /// Comma separated list of accepted dialect names, for error messages.
    pub fn supported_names() -> String {
        REGISTRY
            .iter()
            .map(|spec| spec.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDialect(pub String);

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        REGISTRY
            .iter()
            .find(|spec| spec.name == wanted)
            .map(|spec| spec.dialect)
            .ok_or(UnknownDialect(wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_indexed_by_enum_order() {
        for dialect in Dialect::all() {
            assert_eq!(dialect.spec().dialect, dialect);
        }
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("Postgres".parse::<Dialect>(), Ok(Dialect::Postgres));
        assert_eq!(" sqlite ".parse::<Dialect>(), Ok(Dialect::Sqlite));
        assert_eq!(
            "mongodb".parse::<Dialect>(),
            Err(UnknownDialect("mongodb".into()))
        );
    }

    #[test]
    fn default_ports_follow_registry() {
        assert_eq!(Dialect::Postgres.default_port(), Some(5432));
        assert_eq!(Dialect::Mariadb.default_port(), Some(3306));
        assert_eq!(Dialect::Kingbase.default_port(), Some(54321));
        assert_eq!(Dialect::Sqlite.default_port(), None);
    }

    #[test]
    fn postgres_compatible_dialects_share_a_driver() {
        assert_eq!(Dialect::Kingbase.driver(), Some(Driver::Postgres));
        assert_eq!(Dialect::Mariadb.driver(), Some(Driver::MySql));
        assert_eq!(Dialect::Oracle.driver(), None);
    }
}
