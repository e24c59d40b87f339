//! Frame database and the DBC adapter
//!
//! The database is the decoder's only input besides the frame itself. The DBC
//! adapter turns a file into an already-validated database.

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{
    ByteOrder, DatabaseStats, FrameDatabase, FrameDefinition, MultiplexerInfo, SignalDescriptor,
    ValueType,
};
