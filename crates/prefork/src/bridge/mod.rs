//! IPC bridge between the pool (parent) and its worker processes.
//!
//! # Architecture
//!
//! - **protocol**: Wire types (CompletionRecord, JobEnvelope, UnitId) and sizes
//! - **codec**: 512-byte packet framing for jobs and completion records
//! - **transport**: Unix socket pairs for job dispatch and the result channel

pub mod codec;
pub mod protocol;
pub mod transport;
