use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::identity::Identity;

/// The kind of object an [AccessRow] grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    BaseTable,
    TableFunction,
}

/// One rule in the access policy. A row grants `principal` (a user or a
/// group name) access to a table or path, optionally restricted to rows
/// satisfying `filter`. Rows past their expiration date are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessRow {
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_or_path: Option<String>,
    pub object_kind: ObjectKind,
    #[serde(default)]
    pub columns: Vec<String>,
    /// A sql filter expression restricting the visible rows,
    /// e.g. "p = '1' and not col3 = 'secret'".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<NaiveDate>,
}

/// A table reference or table function invocation extracted from a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSchemaTable {
    pub catalog: Option<String>,
    pub schema: Option<String>,
    /// Table name for base tables; the (first) path argument for table
    /// functions, empty for functions taking no path (e.g. generate_series).
    pub table_or_path: String,
    pub kind: ObjectKind,
    pub function_name: Option<String>,
    pub hive_partitioning: bool,
}

impl CatalogSchemaTable {
    /// Human readable name used in authorization failure messages.
    pub fn display_name(&self) -> String {
        match self.kind {
            ObjectKind::BaseTable => {
                let mut parts = vec![];
                if let Some(c) = &self.catalog {
                    parts.push(c.clone());
                }
                if let Some(s) = &self.schema {
                    parts.push(s.clone());
                }
                parts.push(self.table_or_path.clone());
                parts.join(".")
            }
            ObjectKind::TableFunction => match &self.function_name {
                Some(f) if self.table_or_path.is_empty() => f.clone(),
                Some(f) => format!("{f}('{}')", self.table_or_path),
                None => self.table_or_path.clone(),
            },
        }
    }
}

impl AccessRow {
    pub fn is_expired(&self) -> bool {
        self.expiration
            .is_some_and(|exp| exp < Utc::now().date_naive())
    }

    fn principal_matches(&self, identity: &Identity) -> bool {
        self.principal == identity.user || identity.groups.contains(&self.principal)
    }

    /// Whether this row grants `identity` access to `object`, per the lookup
    /// contract: base tables match on database, schema and table name (exact
    /// or glob-like prefix); table functions match on a path prefix or on
    /// the function name.
    pub fn matches(&self, identity: &Identity, object: &CatalogSchemaTable) -> bool {
        if self.is_expired() || !self.principal_matches(identity) {
            return false;
        }
        if self.object_kind != object.kind {
            return false;
        }
        match object.kind {
            ObjectKind::BaseTable => {
                self.database == object.catalog
                    && self.schema == object.schema
                    && self
                        .table_or_path
                        .as_deref()
                        .is_some_and(|t| table_name_matches(t, &object.table_or_path))
            }
            ObjectKind::TableFunction => {
                let path_match = self
                    .table_or_path
                    .as_deref()
                    .is_some_and(|p| !object.table_or_path.is_empty() && path_matches(p, &object.table_or_path));
                let function_match = match (&self.function_name, &object.function_name) {
                    (Some(rule), Some(actual)) => rule.eq_ignore_ascii_case(actual),
                    _ => false,
                };
                path_match || function_match
            }
        }
    }
}

/// Exact table name or glob-like prefix match, e.g. rule "sales_*" covers
/// "sales_2024".
fn table_name_matches(rule: &str, table: &str) -> bool {
    if let Some(prefix) = rule.strip_suffix('*') {
        table.starts_with(prefix)
    } else {
        rule == table
    }
}

/// A rule path covers a query path when they are equal, when the rule is a
/// directory prefix of the path, or when the rule is a glob matching it.
pub fn path_matches(rule: &str, path: &str) -> bool {
    if rule == path {
        return true;
    }
    if rule.contains('*') {
        return globset::Glob::new(rule)
            .map(|g| g.compile_matcher().is_match(path))
            .unwrap_or(false);
    }
    std::path::Path::new(path).starts_with(std::path::Path::new(rule))
}

/// Returns the first non-expired row granting `identity` access to `object`.
pub fn find_match<'a>(
    rows: &'a [AccessRow],
    identity: &Identity,
    object: &CatalogSchemaTable,
) -> Option<&'a AccessRow> {
    rows.iter().find(|row| row.matches(identity, object))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_function_row(principal: &str, path: &str) -> AccessRow {
        AccessRow {
            principal: principal.to_string(),
            database: None,
            schema: None,
            table_or_path: Some(path.to_string()),
            object_kind: ObjectKind::TableFunction,
            columns: vec![],
            filter: None,
            function_name: None,
            expiration: None,
        }
    }

    fn base_table_row(principal: &str, db: &str, schema: &str, table: &str) -> AccessRow {
        AccessRow {
            principal: principal.to_string(),
            database: Some(db.to_string()),
            schema: Some(schema.to_string()),
            table_or_path: Some(table.to_string()),
            object_kind: ObjectKind::BaseTable,
            columns: vec![],
            filter: None,
            function_name: None,
            expiration: None,
        }
    }

    fn base_table_object(db: &str, schema: &str, table: &str) -> CatalogSchemaTable {
        CatalogSchemaTable {
            catalog: Some(db.to_string()),
            schema: Some(schema.to_string()),
            table_or_path: table.to_string(),
            kind: ObjectKind::BaseTable,
            function_name: None,
            hive_partitioning: false,
        }
    }

    fn function_object(function: &str, path: &str) -> CatalogSchemaTable {
        CatalogSchemaTable {
            catalog: None,
            schema: None,
            table_or_path: path.to_string(),
            kind: ObjectKind::TableFunction,
            function_name: Some(function.to_string()),
            hive_partitioning: false,
        }
    }

    #[test]
    fn base_table_exact_and_glob_prefix() {
        let identity = Identity::new("alice");
        let row = base_table_row("alice", "memory", "main", "sales_*");
        assert!(row.matches(&identity, &base_table_object("memory", "main", "sales_2024")));
        assert!(!row.matches(&identity, &base_table_object("memory", "main", "inventory")));
        assert!(!row.matches(&identity, &base_table_object("memory", "other", "sales_2024")));

        let exact = base_table_row("alice", "memory", "main", "sales_2024");
        assert!(exact.matches(&identity, &base_table_object("memory", "main", "sales_2024")));
        assert!(!exact.matches(&identity, &base_table_object("memory", "main", "sales_2025")));
    }

    #[test]
    fn group_principal_matches() {
        let identity = Identity::new("bob").with_groups(["analysts"]);
        let row = base_table_row("analysts", "memory", "main", "sales_2024");
        assert!(row.matches(&identity, &base_table_object("memory", "main", "sales_2024")));

        let other = Identity::new("bob");
        assert!(!row.matches(&other, &base_table_object("memory", "main", "sales_2024")));
    }

    #[test]
    fn table_function_path_prefix_and_glob() {
        let identity = Identity::new("restricted");
        let glob = table_function_row("restricted", "example/hive_table/*/*/*.parquet");
        assert!(glob.matches(
            &identity,
            &function_object("read_parquet", "example/hive_table/*/*/*.parquet")
        ));
        assert!(glob.matches(
            &identity,
            &function_object("read_parquet", "example/hive_table/dt=2024-01-01/p=1/part.parquet")
        ));

        let prefix = table_function_row("restricted", "example/hive_table");
        assert!(prefix.matches(
            &identity,
            &function_object("read_parquet", "example/hive_table/dt=2024-01-01/p=1/part.parquet")
        ));
        assert!(!prefix.matches(
            &identity,
            &function_object("read_parquet", "example/other_table/part.parquet")
        ));
    }

    #[test]
    fn table_function_by_function_name() {
        let identity = Identity::new("restricted");
        let mut row = table_function_row("restricted", "unused");
        row.table_or_path = None;
        row.function_name = Some("generate_series".to_string());
        assert!(row.matches(&identity, &function_object("generate_series", "")));
        assert!(!row.matches(&identity, &function_object("read_parquet", "some/path")));
    }

    #[test]
    fn expired_rows_are_ignored() {
        let identity = Identity::new("alice");
        let mut row = base_table_row("alice", "memory", "main", "sales_2024");
        row.expiration = Some(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
        assert!(!row.matches(&identity, &base_table_object("memory", "main", "sales_2024")));
    }

    #[test]
    fn first_match_wins() {
        let identity = Identity::new("alice");
        let mut first = base_table_row("alice", "memory", "main", "sales_*");
        first.filter = Some("region = 'emea'".to_string());
        let second = base_table_row("alice", "memory", "main", "sales_2024");
        let rows = vec![first.clone(), second];
        let found = find_match(&rows, &identity, &base_table_object("memory", "main", "sales_2024"))
            .expect("row should match");
        assert_eq!(found.filter, first.filter);
    }

    #[test]
    fn access_row_document_roundtrip() {
        let raw = r#"{
            "principal": "restricted",
            "tableOrPath": "example/hive_table/*/*/*.parquet",
            "objectKind": "TABLE_FUNCTION",
            "filter": "p = '1'",
            "expiration": "2099-12-31"
        }"#;
        let row: AccessRow = serde_json::from_str(raw).unwrap();
        assert_eq!(row.object_kind, ObjectKind::TableFunction);
        assert!(!row.is_expired());
        assert_eq!(row.filter.as_deref(), Some("p = '1'"));
    }
}
