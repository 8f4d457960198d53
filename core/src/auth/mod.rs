pub mod policy;
pub mod token;

use sqlparser::ast::Statement;
use tracing::debug;

use crate::conf::AccessMode;
use crate::error::{Result, ServerError};
use crate::execute::ast_utils::{
    add_filter_to_base_table, add_filter_to_table_function, all_tables_or_paths,
    compile_filter_string, with_updated_database_schema,
};
use crate::execute::hive;
use crate::model::access::{find_match, AccessRow, CatalogSchemaTable, ObjectKind};
use crate::model::identity::Identity;
use policy::{AccessPolicySource, RemotePolicyStore, StaticPolicyStore};

/// Checks every referenced table, path and table function of a query
/// against the caller's access rows and weaves row filters back into the
/// statement, so the engine only ever sees a restricted query.
pub struct Authorizer {
    mode: AccessMode,
    static_store: StaticPolicyStore,
    remote_store: Option<RemotePolicyStore>,
}

impl Authorizer {
    pub fn new(
        mode: AccessMode,
        static_store: StaticPolicyStore,
        remote_store: Option<RemotePolicyStore>,
    ) -> Self {
        Self {
            mode,
            static_store,
            remote_store,
        }
    }

    pub fn groups_for(&self, user: &str) -> std::collections::HashSet<String> {
        self.static_store.groups_for(user)
    }

    /// Returns the statement rewritten for `identity`, or an authorization
    /// failure. In complete mode the caller is trusted and the statement is
    /// only stamped with the default catalog and schema.
    pub async fn authorize(
        &self,
        identity: &Identity,
        db: &str,
        schema: &str,
        mut statement: Statement,
    ) -> Result<Statement> {
        if self.mode == AccessMode::Complete {
            with_updated_database_schema(&mut statement, db, schema)?;
            return Ok(statement);
        }

        let refs = all_tables_or_paths(&statement, db, schema)?;
        if refs.is_empty() {
            return Err(ServerError::Unauthorized(
                "no table or path found in query".to_string(),
            ));
        }

        let rules = self.rules_for(identity).await?;
        let mut row_filter: Option<(&AccessRow, &CatalogSchemaTable)> = None;
        for object in &refs {
            let row = find_match(&rules, identity, object).ok_or_else(|| {
                ServerError::Unauthorized(format!(
                    "user {} has no access to {}",
                    identity.user,
                    object.display_name()
                ))
            })?;
            // Only the first filtered match is applied to the statement.
            if row_filter.is_none() && row.filter.is_some() {
                row_filter = Some((row, object));
            }
        }

        with_updated_database_schema(&mut statement, db, schema)?;

        if let Some((row, object)) = row_filter {
            let filter = row
                .filter
                .as_deref()
                .expect("row_filter only remembers rows with a filter");
            debug!(
                "applying row filter `{filter}` for {} on {}",
                identity.user,
                object.display_name()
            );
            let compiled = compile_filter_string(filter)?;
            match object.kind {
                ObjectKind::BaseTable => add_filter_to_base_table(&mut statement, &compiled)?,
                ObjectKind::TableFunction => {
                    let hive_types = if object.function_name.as_deref() == Some("read_parquet") {
                        hive::hive_types_for_path(&object.table_or_path)
                    } else {
                        None
                    };
                    add_filter_to_table_function(&mut statement, &compiled, hive_types.as_ref())?;
                }
            }
        }

        Ok(statement)
    }

    async fn rules_for(&self, identity: &Identity) -> Result<Vec<AccessRow>> {
        if identity.is_redirect() {
            match &self.remote_store {
                Some(remote) => remote.rules_for(identity).await,
                None => Err(ServerError::Unauthorized(
                    "redirect token presented but no resolve endpoint is configured".to_string(),
                )),
            }
        } else {
            self.static_store.rules_for(identity).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::ast_utils::{first_statement, parse_sql};
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    fn parse_one(sql: &str) -> Statement {
        first_statement(parse_sql(sql).unwrap()).unwrap()
    }

    fn function_rule(principal: &str, path: &str, filter: Option<&str>) -> AccessRow {
        AccessRow {
            principal: principal.to_string(),
            database: None,
            schema: None,
            table_or_path: Some(path.to_string()),
            object_kind: ObjectKind::TableFunction,
            columns: vec![],
            filter: filter.map(str::to_string),
            function_name: None,
            expiration: None,
        }
    }

    fn table_rule(principal: &str, table: &str, filter: Option<&str>) -> AccessRow {
        AccessRow {
            principal: principal.to_string(),
            database: Some("memory".to_string()),
            schema: Some("main".to_string()),
            table_or_path: Some(table.to_string()),
            object_kind: ObjectKind::BaseTable,
            columns: vec![],
            filter: filter.map(str::to_string),
            function_name: None,
            expiration: None,
        }
    }

    fn authorizer(rules: Vec<AccessRow>, mode: AccessMode) -> Authorizer {
        Authorizer::new(mode, StaticPolicyStore::new(rules, HashMap::new()), None)
    }

    fn make_hive_tree(root: &Path) {
        for (dt, p) in [("2024-01-01", "1"), ("2024-01-01", "2"), ("2024-01-02", "1")] {
            let dir = root.join(format!("dt={dt}")).join(format!("p={p}"));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("part-0.parquet"), b"").unwrap();
        }
    }

    #[tokio::test]
    async fn denies_without_matching_rule() {
        let auth = authorizer(vec![], AccessMode::Restricted);
        let stmt = parse_one("select * from secrets");
        let err = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized(_)));
        assert!(err.to_string().contains("memory.main.secrets"));
    }

    #[tokio::test]
    async fn query_without_references_is_denied() {
        let auth = authorizer(vec![], AccessMode::Restricted);
        let stmt = parse_one("select 1");
        assert!(matches!(
            auth.authorize(&Identity::new("alice"), "memory", "main", stmt)
                .await,
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn complete_mode_only_stamps() {
        let auth = authorizer(vec![], AccessMode::Complete);
        let stmt = parse_one("select * from secrets");
        let rewritten = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap();
        assert_eq!(rewritten.to_string(), "SELECT * FROM memory.main.secrets");
    }

    #[tokio::test]
    async fn hive_filter_rewrite_matches_reference_output() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("hive_table");
        make_hive_tree(&root);
        let glob = format!("{}/*/*/*.parquet", root.display());

        let auth = authorizer(
            vec![function_rule("restricted", &glob, Some("p = '1'"))],
            AccessMode::Restricted,
        );
        let stmt = parse_one(&format!("select * from read_parquet('{glob}')"));
        let rewritten = auth
            .authorize(&Identity::new("restricted"), "memory", "main", stmt)
            .await
            .unwrap();
        assert_eq!(
            rewritten.to_string(),
            format!(
                "SELECT * FROM read_parquet('{glob}', hive_partitioning = true, \
                 hive_types = {{'dt': DATE, 'p': VARCHAR}}) WHERE p = '1'"
            )
        );
    }

    #[tokio::test]
    async fn base_table_filter_is_applied() {
        let auth = authorizer(
            vec![table_rule("alice", "sales", Some("region = 'emea'"))],
            AccessMode::Restricted,
        );
        let stmt = parse_one("select * from sales");
        let rewritten = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap();
        assert_eq!(
            rewritten.to_string(),
            "SELECT * FROM memory.main.sales WHERE region = 'emea'"
        );
    }

    #[tokio::test]
    async fn only_first_filter_is_applied() {
        let auth = authorizer(
            vec![
                table_rule("alice", "sales", Some("region = 'emea'")),
                table_rule("alice", "costs", Some("region = 'apac'")),
            ],
            AccessMode::Restricted,
        );
        let stmt = parse_one("select * from sales join costs on sales.id = costs.id");
        let rewritten = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap();
        let rendered = rewritten.to_string();
        assert!(rendered.contains("region = 'emea'"), "got {rendered}");
        assert!(!rendered.contains("apac"), "got {rendered}");
    }

    #[tokio::test]
    async fn projection_subqueries_cannot_bypass_authorization() {
        let auth = authorizer(
            vec![table_rule("alice", "sales", None)],
            AccessMode::Restricted,
        );
        let stmt = parse_one("select (select s from secrets) as x from sales");
        let err = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("secrets"), "got: {err}");
    }

    #[tokio::test]
    async fn all_references_must_be_granted() {
        let auth = authorizer(
            vec![table_rule("alice", "sales", None)],
            AccessMode::Restricted,
        );
        let stmt = parse_one("select * from sales join costs on sales.id = costs.id");
        let err = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("costs"));
    }

    #[tokio::test]
    async fn function_access_by_name() {
        let mut rule = function_rule("alice", "", None);
        rule.table_or_path = None;
        rule.function_name = Some("generate_series".to_string());
        let auth = authorizer(vec![rule], AccessMode::Restricted);
        let stmt = parse_one("select * from generate_series(10)");
        let rewritten = auth
            .authorize(&Identity::new("alice"), "memory", "main", stmt)
            .await
            .unwrap();
        assert_eq!(rewritten.to_string(), "SELECT * FROM generate_series(10)");
    }

    #[tokio::test]
    async fn redirect_without_resolver_is_denied() {
        let auth = authorizer(
            vec![table_rule("alice", "sales", None)],
            AccessMode::Restricted,
        );
        let identity = Identity::new("alice").with_claim("token_type", "redirect");
        let stmt = parse_one("select * from sales");
        assert!(matches!(
            auth.authorize(&identity, "memory", "main", stmt).await,
            Err(ServerError::Unauthorized(_))
        ));
    }
}
