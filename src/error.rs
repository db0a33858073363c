use crate::model::body::BlockId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("branch offset {offset} does not fit in a short branch")]
    BranchOutOfRange { offset: i64 },
    #[error("branch target {0:?} is never placed in the method body")]
    UnresolvedBranchTarget(BlockId),
    #[error("invalid body for method {method}: {reason}")]
    InvalidBody { method: String, reason: String },
    #[error("encoding capacity exceeded: {0}")]
    Encoding(String),
    #[error("key file {} not found", .0.display())]
    KeyFileNotFound(PathBuf),
    #[error("assembly could not be signed: {0}")]
    SigningFailed(String),
    #[error("debug symbols could not be written: {0}")]
    DebugSymbols(String),
    #[error("PE layout: {0}")]
    Pe(String),
    #[error("binary encoding: {0}")]
    Scroll(#[from] scroll::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
