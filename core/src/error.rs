use std::{error::Error, fmt, result};

use tonic::Status;

pub type Result<T, E = ServerError> = result::Result<T, E>;

#[derive(Debug)]
pub enum ServerError {
    Unauthenticated(String),
    Unauthorized(String),
    InvalidQuery(String),
    InvalidHeader(String),
    UnknownHandle(String),
    NotFound(String),
    Conflict(String),
    Cancelled,
    Engine(String),
    Internal(String),
}

impl Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::Unauthenticated(s) => write!(f, "unauthenticated: {}", s),
            ServerError::Unauthorized(s) => write!(f, "unauthorized: {}", s),
            ServerError::InvalidQuery(s) => write!(f, "invalid query: {}", s),
            ServerError::InvalidHeader(s) => write!(f, "invalid header: {}", s),
            ServerError::UnknownHandle(s) => write!(f, "unknown handle: {}", s),
            ServerError::NotFound(s) => write!(f, "not found: {}", s),
            ServerError::Conflict(s) => write!(f, "conflict: {}", s),
            ServerError::Cancelled => write!(f, "query was cancelled"),
            ServerError::Engine(s) => write!(f, "engine error: {}", s),
            ServerError::Internal(s) => write!(f, "unexpected internal error: {}", s),
        }
    }
}

/// Maps each error kind onto the gRPC status surfaced to flight clients.
impl From<ServerError> for Status {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Unauthenticated(s) => Status::unauthenticated(s),
            ServerError::Unauthorized(s) => Status::permission_denied(s),
            ServerError::InvalidQuery(s) => Status::invalid_argument(s),
            ServerError::InvalidHeader(s) => Status::invalid_argument(s),
            ServerError::UnknownHandle(s) => Status::invalid_argument(s),
            ServerError::NotFound(s) => Status::not_found(s),
            ServerError::Conflict(s) => Status::already_exists(s),
            ServerError::Cancelled => Status::cancelled("query was cancelled"),
            ServerError::Engine(s) => Status::internal(s),
            ServerError::Internal(s) => Status::internal(s),
        }
    }
}

impl From<duckdb::Error> for ServerError {
    fn from(e: duckdb::Error) -> Self {
        ServerError::Engine(e.to_string())
    }
}

impl From<r2d2::Error> for ServerError {
    fn from(e: r2d2::Error) -> Self {
        ServerError::Engine(e.to_string())
    }
}

impl From<sqlparser::parser::ParserError> for ServerError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        ServerError::InvalidQuery(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ServerError::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => ServerError::Conflict(e.to_string()),
            _ => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<arrow::error::ArrowError> for ServerError {
    fn from(e: arrow::error::ArrowError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<parquet::errors::ParquetError> for ServerError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(e: reqwest::Error) -> Self {
        // Resolve endpoint failures must deny, never allow.
        ServerError::Unauthorized(format!("resolve request failed: {e}"))
    }
}

impl From<deltalake::DeltaTableError> for ServerError {
    fn from(e: deltalake::DeltaTableError) -> Self {
        match e {
            deltalake::DeltaTableError::NotATable(s) => ServerError::NotFound(s),
            deltalake::DeltaTableError::InvalidTableLocation(s) => ServerError::NotFound(s),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ServerError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        ServerError::Unauthenticated(e.to_string())
    }
}
