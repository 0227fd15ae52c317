//! CIS-2 token event ingestion engine for block-explorer backends.
//!
//! Turns a stream of smart-contract execution events into a consistent,
//! queryable materialized view: token supplies, account balances, and the
//! versioned module-to-contract linkage. The embedding service supplies the
//! node plumbing (a [`indexer::source::BlockData`] stream) and a PostgreSQL
//! pool; [`indexer::import::run_import`] does the rest.

pub mod config;
pub mod db;
pub mod indexer;
pub mod modules;
pub mod pipeline;
