//! # TideSync Protocol
//!
//! Data model and wire types for TideSync.
//!
//! This crate provides:
//! - `SyncValue` and type coercion between driver values and column types
//! - `Timestamp` decoding from integer, hex-string and byte-array forms
//! - Table schemas and the changes-table projection used for row transfer
//! - `SyncSetup`, filters, parameters and scope records
//! - Batch part format shared by batch files, snapshots and HTTP payloads
//! - Protocol messages and pluggable serializers (JSON, CBOR)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod changes;
mod conflict;
mod error;
mod messages;
mod row;
mod schema;
mod scope;
mod serializer;
mod setup;
mod timestamp;
mod value;

pub use batch::{BatchPart, BatchPartInfo, BatchSummary};
pub use changes::{ChangesTable, ChangesTableBuilder};
pub use conflict::{
    ConflictAction, ConflictKind, ConflictResolutionPolicy, RowConflict, SyncSide,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ChangesRequest, ChangesResponse, ErrorKind, ErrorResponse, HttpStep, MoreChangesRequest,
    MoreChangesResponse, ScopeRequest, ScopeResponse, HEADER_PROTOCOL_VERSION, HEADER_SCOPE_NAME,
    HEADER_SERIALIZER, HEADER_TOKEN, PROTOCOL_VERSION,
};
pub use row::{RowState, SyncRow};
pub use schema::{SyncColumn, SyncDirection, SyncRelation, SyncSet, SyncTable};
pub use scope::{ServerHistoryScope, ServerScopeInfo, SyncScope, SyncType, DEFAULT_SCOPE_NAME};
pub use serializer::SerializerKind;
pub use setup::{FilterParameter, SetupTable, SyncFilter, SyncParameter, SyncParameters, SyncSetup};
pub use timestamp::{RawTimestamp, Timestamp, TimestampEncoding, TimestampError};
pub use value::{DataType, SyncValue};
