//! Column metadata lookup across dialect catalogs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    dialect::CatalogQuery,
    engine::{EngineCache, JsonRow},
    error::{GatewayError, GatewayResult},
    params::Params,
    profile::{DatabaseProfile, Endpoint},
};

const TABLE_PARAM: &str = "table_name";

/// One column in canonical shape, whatever the backend called its fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    #[serde(rename = "db_alias", alias = "alias")]
    pub alias: String,
    pub table: Option<String>,
    pub columns: Vec<ColumnInfo>,
}

/// Builds the catalog statement for a query family. A table filter is bound
/// as `:table_name`.
pub fn catalog_statement(catalog: CatalogQuery, filter_table: bool) -> Option<String> {
    let sql = match catalog {
        CatalogQuery::InformationSchema {
            schema_predicate,
            text_casts,
        } => {
            let select = if text_casts {
                "SELECT table_name::text AS table_name, column_name::text AS column_name, \
                 data_type::text AS data_type"
            } else {
                "SELECT table_name, column_name, data_type"
            };
            let mut sql = format!("{select} FROM information_schema.columns WHERE {schema_predicate}");
            if filter_table {
                sql.push_str(" AND table_name = :table_name");
            }
            sql.push_str(" ORDER BY table_name, ordinal_position");
            sql
        }
        CatalogQuery::UserTabColumns => {
            let mut sql = String::from("SELECT table_name, column_name, data_type FROM user_tab_columns");
            if filter_table {
                sql.push_str(" WHERE table_name = :table_name");
            }
            sql.push_str(" ORDER BY table_name, column_id");
            sql
        }
        CatalogQuery::SysCat => {
            let mut sql = String::from(
                "SELECT TABNAME AS table_name, COLNAME AS column_name, TYPENAME AS data_type \
                 FROM SYSCAT.COLUMNS",
            );
            if filter_table {
                sql.push_str(" WHERE TABNAME = :table_name");
            }
            sql.push_str(" ORDER BY TABNAME, COLNO");
            sql
        }
        CatalogQuery::TableInfo => return None,
    };
    Some(sql)
}

/// Maps a catalog row onto [`ColumnInfo`]. Keys match case-insensitively and
/// ignore underscores, so `TABLE_NAME`, `tablename` and DB2's `TABNAME` agree.
pub fn normalize_row(row: &JsonRow) -> ColumnInfo {
    let mut column = ColumnInfo::default();
    for (key, value) in row {
        let slot = match canonical_key(key).as_str() {
            "tablename" | "tabname" => &mut column.table_name,
            "columnname" | "colname" => &mut column.column_name,
            "datatype" | "typename" => &mut column.data_type,
            _ => continue,
        };
        if slot.is_none() {
            *slot = text(value);
        }
    }
    column
}

fn canonical_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim_end().to_string()),
        other => Some(other.to_string()),
    }
}

/// Describes the columns of one table, or of every table when `table` is
/// absent. Embedded databases have no catalog-wide view and need a table.
pub async fn describe(
    engines: &EngineCache,
    profile: &DatabaseProfile,
    table: Option<&str>,
) -> GatewayResult<SchemaDescription> {
    let dialect = match &profile.endpoint {
        Endpoint::Direct(settings) => settings.dialect,
        Endpoint::Proxied(_) => {
            return Err(GatewayError::Internal(format!(
                "profile '{}' is proxied; describe it through the remote gateway",
                profile.alias
            )))
        }
    };
    let table = table.map(str::trim).filter(|t| !t.is_empty());

    let columns = match catalog_statement(dialect.spec().catalog, table.is_some()) {
        Some(sql) => {
            let mut params = Params::new();
            if let Some(table) = table {
                params.insert(TABLE_PARAM.into(), Value::String(table.to_string()));
            }
            let handle = engines.get_handle(profile)?;
            handle
                .fetch_rows(&sql, &params)
                .await?
                .iter()
                .map(normalize_row)
                .collect()
        }
        None => {
            let table = table.ok_or_else(|| {
                GatewayError::validation(format!("{dialect} schema lookups require a table name"))
            })?;
            let handle = engines.get_handle(profile)?;
            handle
                .table_columns(table)
                .await?
                .iter()
                .map(|row| ColumnInfo {
                    table_name: Some(table.to_string()),
                    column_name: row.get("name").and_then(text),
                    data_type: row.get("type").and_then(text),
                })
                .collect()
        }
    };

    Ok(SchemaDescription {
        alias: profile.alias.clone(),
        table: table.map(str::to_string),
        columns,
    })
}
