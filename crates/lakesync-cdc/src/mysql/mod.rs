//! MySQL source
//!
//! Row-based binlog streaming and chunked table snapshots over `mysql_async`.
//!
//! Server requirements: `binlog_format = ROW`, `binlog_row_image = FULL`, and
//! a user with `REPLICATION SLAVE`, `REPLICATION CLIENT` and `SELECT`.

pub mod schema;
pub mod snapshot;
pub mod source;
pub mod type_mapper;

pub use schema::*;
pub use snapshot::*;
pub use source::*;
pub use type_mapper::*;
