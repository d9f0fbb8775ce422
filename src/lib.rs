//! Audit Pipeline Library
//!
//! This crate provides an asynchronous, bounded audit-logging pipeline for
//! HTTP services: events are built from request/response pairs, snapshots are
//! truncated to a size ceiling, and persistence runs off the request path.

pub mod audit;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
