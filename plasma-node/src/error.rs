//! Error types for the child chain

use thiserror::Error;

/// Result type for chain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical encoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Underlying RLP structure is malformed
    #[error("RLP error: {0}")]
    Rlp(String),

    /// Item count outside the accepted range
    #[error("Unexpected item count: expected at most {expected}, got {got}")]
    ItemCount {
        /// Maximum number of items
        expected: usize,
        /// Items found
        got: usize,
    },

    /// Fixed-width field has the wrong length
    #[error("Field {field} must be {expected} bytes, got {got}")]
    FieldLength {
        /// Field name
        field: &'static str,
        /// Declared width
        expected: usize,
        /// Actual width
        got: usize,
    },

    /// Numeric field is not minimal big-endian or does not fit
    #[error("Field {0} is not a canonical integer")]
    NonCanonicalInteger(&'static str),

    /// A scalar field holds a nested list
    #[error("Field {0} must be a byte string, found a list")]
    UnexpectedList(&'static str),

    /// Bytes follow the top-level item
    #[error("{0} trailing bytes after encoded item")]
    TrailingBytes(usize),
}

impl From<ethers::utils::rlp::DecoderError> for DecodeError {
    fn from(err: ethers::utils::rlp::DecoderError) -> Self {
        DecodeError::Rlp(err.to_string())
    }
}

/// Transaction and block validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Structurally invalid transaction
    #[error("Malformed transaction: {0}")]
    Malformed(String),

    /// Both inputs (or two transactions in a block) spend the same position
    #[error("Duplicate input {0}")]
    DuplicateInput(String),

    /// Outputs plus fee exceed the resolved input amounts
    #[error("Insufficient funds: inputs {inputs}, outputs plus fee {spent}")]
    InsufficientFunds {
        /// Sum of resolved input amounts
        inputs: String,
        /// Sum of outputs plus fee
        spent: String,
    },

    /// Input does not resolve to a committed output
    #[error("Unknown input {0}")]
    UnknownInput(String),

    /// Input signature does not recover to the output owner
    #[error("Invalid signature for input {0}")]
    InvalidSignature(usize),

    /// Input was consumed by an earlier committed block
    #[error("Input {0} already spent")]
    SpentInput(String),

    /// Block root is not the one the root chain committed for its number
    #[error("Root not committed on the root chain: {0}")]
    UncommittedRoot(String),

    /// Header root differs from the recomputed Merkle root
    #[error("Merkle root mismatch: header {header}, computed {computed}")]
    RootMismatch {
        /// Root carried in the header
        header: String,
        /// Root recomputed from transactions
        computed: String,
    },
}

/// Chain errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Peer message JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Canonical decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transaction rejected by validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Block failed validation and was not committed
    #[error("Invalid block {number}: {reason}")]
    InvalidBlock {
        /// Header number of the rejected block
        number: u64,
        /// Underlying validation failure
        reason: ValidationError,
    },

    /// Block not found
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Root chain RPC or contract failure
    #[error("Root chain error: {0}")]
    RootChain(String),

    /// Peer or socket failure
    #[error("Network error: {0}")]
    Network(String),

    /// Signing failure
    #[error("Signature error: {0}")]
    SignatureError(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
