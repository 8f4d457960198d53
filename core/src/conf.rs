use std::{collections::HashMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::access::AccessRow;

/// Default maximum number of rows per produced record batch when the client
/// does not send a `fetch-size` header.
pub const DEFAULT_FETCH_SIZE: usize = 8192;

/// Default number of files grouped into a single shard during split planning.
pub const DEFAULT_SPLIT_SIZE: usize = 1;

/// Controls whether queries are rewritten against the access policy before
/// execution. In `Complete` mode the caller is trusted and queries run as
/// written (after default catalog/schema stamping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Complete,
    #[default]
    Restricted,
}

/// A statically configured user. Passwords are stored as hex encoded
/// SHA-256 digests, never in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

/// Holds all settings which control server behavior. Loaded once at startup
/// from the JSON file named by the MALLARD_CONFIG environment variable, with
/// a handful of env overrides for deployment convenience. Panics if the
/// configured file cannot be read or parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfigSettings {
    /// Static password store checked during the flight handshake.
    pub users: Vec<UserCredential>,
    /// Static access policy rows evaluated for every restricted query.
    pub access_rules: Vec<AccessRow>,
    /// Group membership used when matching rule principals.
    pub user_groups: HashMap<String, Vec<String>>,
    /// Base login URL of the federated auth service. The resolve URL is
    /// derived from it by replacing a trailing `/login` with `/resolve`.
    pub login_url: Option<String>,
    /// Directory under which ingested parquet files are written.
    pub warehouse_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub access_mode: AccessMode,
    /// HS256 signing secret for issued bearer tokens. Generated fresh each
    /// run when not configured, which invalidates tokens across restarts.
    pub jwt_secret: Option<String>,
    pub default_fetch_size: usize,
    /// Default catalog and schema substituted for unqualified table names
    /// when the client sends no `database`/`schema` headers.
    pub default_database: String,
    pub default_schema: String,
}

impl Default for ServerConfigSettings {
    fn default() -> Self {
        Self {
            users: vec![],
            access_rules: vec![],
            user_groups: HashMap::new(),
            login_url: None,
            warehouse_path: PathBuf::from("warehouse"),
            host: "0.0.0.0".to_string(),
            port: 50051,
            access_mode: AccessMode::default(),
            jwt_secret: None,
            default_fetch_size: DEFAULT_FETCH_SIZE,
            default_database: "memory".to_string(),
            default_schema: "main".to_string(),
        }
    }
}

impl ServerConfigSettings {
    pub fn init() -> Self {
        let mut conf = match env::var("MALLARD_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .unwrap_or_else(|e| panic!("Unable to read config file {path}: {e}"));
                serde_json::from_str(&raw)
                    .unwrap_or_else(|e| panic!("Unable to parse config file {path}: {e}"))
            }
            Err(_) => Self::default(),
        };

        if let Ok(warehouse) = env::var("MALLARD_WAREHOUSE_PATH") {
            conf.warehouse_path = PathBuf::from(warehouse);
        }
        if let Ok(port) = env::var("MALLARD_PORT") {
            conf.port = port
                .parse()
                .expect("Unable to parse MALLARD_PORT as a port number!");
        }
        conf
    }

    pub fn flight_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The configured signing secret, or a fresh per-run secret.
    pub fn jwt_secret_or_generated(&self) -> String {
        self.jwt_secret
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
    }

    /// Derives the resolve endpoint from the configured login URL.
    pub fn resolve_url(&self) -> Option<String> {
        self.login_url.as_ref().map(|login| {
            match login.strip_suffix("/login") {
                Some(base) => format!("{base}/resolve"),
                None => format!("{}/resolve", login.trim_end_matches('/')),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let raw = r#"{
            "users": [{"username": "admin", "password": "8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918"}],
            "access-rules": [{
                "principal": "restricted",
                "tableOrPath": "example/hive_table/*/*/*.parquet",
                "objectKind": "TABLE_FUNCTION",
                "filter": "p = '1'"
            }],
            "user-groups": {"admin": ["admins"]},
            "login-url": "https://auth.example.com/api/login",
            "warehouse-path": "/tmp/warehouse",
            "port": 59307,
            "access-mode": "restricted"
        }"#;
        let conf: ServerConfigSettings = serde_json::from_str(raw).unwrap();
        assert_eq!(conf.port, 59307);
        assert_eq!(conf.access_mode, AccessMode::Restricted);
        assert_eq!(conf.users[0].username, "admin");
        assert_eq!(
            conf.access_rules[0].table_or_path.as_deref(),
            Some("example/hive_table/*/*/*.parquet")
        );
        assert_eq!(
            conf.resolve_url().as_deref(),
            Some("https://auth.example.com/api/resolve")
        );
        assert_eq!(conf.user_groups["admin"], vec!["admins".to_string()]);
    }

    #[test]
    fn defaults_when_keys_missing() {
        let conf: ServerConfigSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.port, 50051);
        assert_eq!(conf.access_mode, AccessMode::Restricted);
        assert_eq!(conf.default_fetch_size, DEFAULT_FETCH_SIZE);
        assert!(conf.resolve_url().is_none());
    }

    #[test]
    fn generated_secret_is_per_call() {
        let conf = ServerConfigSettings::default();
        assert_ne!(conf.jwt_secret_or_generated(), conf.jwt_secret_or_generated());
    }
}
