//! # CrewFlow Integrations
//!
//! OAuth integration lifecycle management for CrewFlow: authorization flow
//! initiation, callback handling, encrypted token storage, automatic refresh
//! with single-flight protection, error classification, connection recovery,
//! and a background token maintenance scheduler, fronted by an HTTP API.

pub mod auth;
pub mod classify;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod maintenance;
pub mod oauth;
pub mod recovery;
pub mod registry;
pub mod security;
pub mod server;
pub mod store;
pub mod telemetry;
