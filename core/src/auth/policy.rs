use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::model::access::AccessRow;
use crate::model::identity::Identity;

/// Supplies the access rows in force for a caller. Matching against
/// individual objects happens in [crate::model::access::find_match].
#[async_trait]
pub trait AccessPolicySource: Send + Sync {
    async fn rules_for(&self, identity: &Identity) -> Result<Vec<AccessRow>>;
}

/// Policy rows loaded from configuration at startup, together with the
/// user to groups mapping used to build identities.
pub struct StaticPolicyStore {
    rows: Vec<AccessRow>,
    user_groups: HashMap<String, Vec<String>>,
}

impl StaticPolicyStore {
    pub fn new(rows: Vec<AccessRow>, user_groups: HashMap<String, Vec<String>>) -> Self {
        Self { rows, user_groups }
    }

    pub fn groups_for(&self, user: &str) -> HashSet<String> {
        self.user_groups
            .get(user)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AccessPolicySource for StaticPolicyStore {
    async fn rules_for(&self, _identity: &Identity) -> Result<Vec<AccessRow>> {
        Ok(self.rows.clone())
    }
}

/// The document served by the resolve endpoint for federated callers.
#[derive(Debug, Deserialize)]
pub struct ResolvedPolicyDocument {
    #[serde(default)]
    pub tables: Vec<AccessRow>,
    #[serde(default)]
    pub functions: Vec<AccessRow>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Fetches access rows from the resolve endpoint on every authorization
/// decision, forwarding the caller's original bearer token. Any transport
/// failure, non-success status or malformed document denies access; the
/// store never fails open.
pub struct RemotePolicyStore {
    client: reqwest::Client,
    resolve_url: String,
}

impl RemotePolicyStore {
    pub fn new(resolve_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            resolve_url,
        }
    }
}

#[async_trait]
impl AccessPolicySource for RemotePolicyStore {
    async fn rules_for(&self, identity: &Identity) -> Result<Vec<AccessRow>> {
        let bearer = identity.bearer_token().ok_or_else(|| {
            ServerError::Unauthorized("redirect token carries no bearer to forward".to_string())
        })?;
        let response = self
            .client
            .get(&self.resolve_url)
            .bearer_auth(bearer)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServerError::Unauthorized(format!(
                "resolve endpoint returned status {}",
                response.status()
            )));
        }
        let document: ResolvedPolicyDocument = response.json().await.map_err(|e| {
            ServerError::Unauthorized(format!("resolve endpoint returned invalid document: {e}"))
        })?;
        debug!(
            "resolved {} table rules and {} function rules (version {:?})",
            document.tables.len(),
            document.functions.len(),
            document.version
        );
        Ok(document
            .tables
            .into_iter()
            .chain(document.functions)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::access::ObjectKind;

    #[test]
    fn resolve_document_parses() {
        let raw = r#"{
            "tables": [{
                "principal": "alice",
                "database": "memory",
                "schema": "main",
                "tableOrPath": "sales_2024",
                "objectKind": "BASE_TABLE"
            }],
            "functions": [{
                "principal": "alice",
                "functionName": "generate_series",
                "objectKind": "TABLE_FUNCTION"
            }],
            "version": "7"
        }"#;
        let doc: ResolvedPolicyDocument = serde_json::from_str(raw).unwrap();
        assert_eq!(doc.tables.len(), 1);
        assert_eq!(doc.functions.len(), 1);
        assert_eq!(doc.version.as_deref(), Some("7"));
        assert_eq!(doc.functions[0].object_kind, ObjectKind::TableFunction);
    }

    #[tokio::test]
    async fn unreachable_resolve_denies() {
        let store = RemotePolicyStore::new("http://127.0.0.1:1/resolve".to_string());
        let identity = Identity::new("federated")
            .with_claim("token_type", "redirect")
            .with_claim("token", "tok");
        assert!(matches!(
            store.rules_for(&identity).await,
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn missing_bearer_denies() {
        let store = RemotePolicyStore::new("http://127.0.0.1:1/resolve".to_string());
        let identity = Identity::new("federated");
        assert!(matches!(
            store.rules_for(&identity).await,
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn static_store_returns_configured_rows() {
        let rows = vec![AccessRow {
            principal: "alice".to_string(),
            database: None,
            schema: None,
            table_or_path: Some("x".to_string()),
            object_kind: ObjectKind::TableFunction,
            columns: vec![],
            filter: None,
            function_name: None,
            expiration: None,
        }];
        let store = StaticPolicyStore::new(rows.clone(), HashMap::new());
        let fetched = store.rules_for(&Identity::new("anyone")).await.unwrap();
        assert_eq!(fetched, rows);
    }
}
