//! PostgreSQL metadata storage
//!
//! A watermark store backed by a dedicated metadata database.

pub mod watermark;

pub use watermark::*;
