use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// The authenticated caller of a single RPC. Derived from the verified
/// bearer token plus configured group membership and immutable for the
/// duration of the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub groups: HashSet<String>,
    /// Claims copied verbatim from the validated token, e.g. `token_type`.
    /// The raw bearer is kept under the `token` key so it can be forwarded
    /// to the resolve endpoint for federated authorization.
    pub verified_claims: HashMap<String, String>,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: HashSet::new(),
            verified_claims: HashMap::new(),
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.verified_claims.insert(key.into(), value.into());
        self
    }

    /// True when the token instructs the server to resolve access rules
    /// remotely rather than from static configuration.
    pub fn is_redirect(&self) -> bool {
        self.verified_claims
            .get("token_type")
            .is_some_and(|t| t == "redirect")
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.verified_claims.get("token").map(String::as_str)
    }
}
