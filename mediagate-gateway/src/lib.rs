//! Mediagate HTTP gateway.
//!
//! This crate contains the HTTP transport layer: the request router with
//! its cache-aside dispatch, the streaming byte relay, the snapshot
//! archiver, HTTP-backed provider adapters, and the admin server.

pub mod admin;
pub mod backup;
pub mod dispatch;
pub mod metrics;
pub mod providers;
pub mod relay;
pub mod service;
pub mod timeout;
