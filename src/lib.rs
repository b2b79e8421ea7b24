//! routesync - keeps a Caddy server's routes in sync with a registry of apps
//!
//! This library provides:
//! - A typed, lossless model of Caddy's `apps.http.servers` configuration
//! - A client for Caddy's admin API (fetch and replace of the server map)
//! - A reconciler that routes each registered app's domain to its port
//! - A SQLite registry of apps, domains and ports
//! - A JSON API to manage apps and trigger syncs

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod reconcile;
pub mod transport;
pub mod tree;
