//! Signal schemas and the DBC parser
//!
//! `schema` holds the per-signal bit codec, `message` groups signals into a
//! message, `database` indexes messages, and `dbc` turns DBC text into all of
//! the above.

pub mod database;
pub mod dbc;
pub mod message;
pub mod schema;

// Re-export key types for convenience
pub use database::{
    buffer_size_to_data_length_code, DatabaseSchema, DatabaseStats,
    DATA_LENGTH_CODE_TO_NUM_BYTES, INVALID_DATA_LENGTH_CODE,
};
pub use dbc::{DbcErrorKind, DbcParseError};
pub use message::MessageSchema;
pub use schema::{
    subaru_checksum, ChecksumFn, Multiplexer, SignalRole, SignalSchema, ValueDescription,
};
