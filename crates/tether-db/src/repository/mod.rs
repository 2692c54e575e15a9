//! # Repository Pattern
//!
//! Each repository owns the SQL for one table and is handed out by
//! [`Database`](crate::Database):
//!
//! - [`kv`] - `kv_store`, the cache backing store
//! - [`operations`] - `sync_operations`, the mutation queue

pub mod kv;
pub mod operations;
