//! trigger-relay HTTP server.
//!
//! A thin axum adapter over the scheduling engine, plus configuration loading
//! and the Postgres-backed repositories.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
