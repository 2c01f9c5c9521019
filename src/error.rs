use std::path::PathBuf;

use crate::doc_id::DocId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("text index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("invalid path expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("{0:?} is not an integer value; document ids must be integers")]
    InvalidDocId(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("no such index: {0}")]
    UnknownIndex(String),

    #[error("invalid query for {index}: {reason}")]
    InvalidQuery { index: String, reason: String },

    #[error("index {0} does not support sorting")]
    Unsortable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("conflicting {index:?} declarations in {catalog:?}: {reason}")]
    ConflictingIndex {
        catalog: String,
        index: String,
        reason: String,
    },

    #[error("no index factory named {0:?}")]
    UnknownFactory(String),

    #[error("cannot find resource for oid {0}")]
    ResourceNotFound(DocId),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("queue processor not engaged")]
    QueueNotEngaged,

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

/// Coarse failure category, for surfaces that report errors to humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Configuration,
    QuerySyntax,
    Conflict,
    Storage,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceNotFound(_)
            | Error::NotFound { .. }
            | Error::UnknownIndex(_) => ErrorKind::NotFound,
            Error::Config(_)
            | Error::ConflictingIndex { .. }
            | Error::UnknownFactory(_)
            | Error::DataDir(_) => ErrorKind::Configuration,
            Error::InvalidDocId(_)
            | Error::InvalidPath { .. }
            | Error::InvalidQuery { .. }
            | Error::Unsortable(_)
            | Error::Regex(_) => ErrorKind::QuerySyntax,
            Error::Conflict(_) | Error::QueueNotEngaged => ErrorKind::Conflict,
            Error::Io(_)
            | Error::Redb(_)
            | Error::RedbStorage(_)
            | Error::RedbTransaction(_)
            | Error::RedbTable(_)
            | Error::RedbCommit(_)
            | Error::RedbDatabase(_)
            | Error::Json(_)
            | Error::Tantivy(_) => ErrorKind::Storage,
        }
    }
}
