use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ServerError};

/// The payload packed into every flight ticket issued by this server.
/// Tickets are stateless: they identify what to execute, never a pinned
/// server resource. The `query_id` ties all endpoints of one FlightInfo to
/// a single cancellable running-query handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TicketPayload {
    /// An ad-hoc statement, already rewritten by the authorizer.
    Statement {
        query_id: Uuid,
        sql: String,
        fetch_size: Option<usize>,
    },
    /// One shard of a split plan; `sql` reads a single file subset.
    SplitShard {
        query_id: Uuid,
        sql: String,
        fetch_size: Option<usize>,
    },
    /// Executes a server-resident prepared statement.
    Prepared {
        query_id: Uuid,
        handle: Uuid,
        fetch_size: Option<usize>,
    },
}

impl TicketPayload {
    pub fn query_id(&self) -> Uuid {
        match self {
            TicketPayload::Statement { query_id, .. }
            | TicketPayload::SplitShard { query_id, .. }
            | TicketPayload::Prepared { query_id, .. } => *query_id,
        }
    }

    pub fn fetch_size(&self) -> Option<usize> {
        match self {
            TicketPayload::Statement { fetch_size, .. }
            | TicketPayload::SplitShard { fetch_size, .. }
            | TicketPayload::Prepared { fetch_size, .. } => *fetch_size,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|_| ServerError::InvalidQuery("Passed Ticket is not valid!".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_statement() {
        let ticket = TicketPayload::Statement {
            query_id: Uuid::new_v4(),
            sql: "SELECT * FROM generate_series(10)".to_string(),
            fetch_size: Some(10),
        };
        let decoded = TicketPayload::decode(&ticket.encode().unwrap()).unwrap();
        assert_eq!(decoded, ticket);
        assert_eq!(decoded.fetch_size(), Some(10));
    }

    #[test]
    fn roundtrip_prepared() {
        let ticket = TicketPayload::Prepared {
            query_id: Uuid::new_v4(),
            handle: Uuid::new_v4(),
            fetch_size: None,
        };
        let decoded = TicketPayload::decode(&ticket.encode().unwrap()).unwrap();
        assert_eq!(decoded, ticket);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(TicketPayload::decode(b"not json").is_err());
    }
}
