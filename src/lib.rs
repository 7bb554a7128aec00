//! Caddy UI - A web console for managing Caddy reverse-proxy routes
//!
//! This library provides:
//! - A SQLite store of users and proxy configurations
//! - Session login with bcrypt passwords and JWT cookies
//! - A client for Caddy's JSON admin API
//! - A reconciler that keeps Caddy's routes equal to the enabled records
//! - The HTTP server for the JSON API and the embedded dashboard

pub mod api;
pub mod auth;
pub mod caddy;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod error;
pub mod sync;
