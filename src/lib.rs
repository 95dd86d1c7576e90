//! ctxflow - queue-driven worker engine for multi-stage context pipelines.
//!
//! Workers claim pending contexts from a shared store, run each through the
//! pipeline of stages configured for its template, and persist status,
//! results, and retry bookkeeping. Several workers can share one store;
//! claims are exclusive.

pub mod claim_lock;
pub mod cli;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod poller;
pub mod repository;
pub mod schema;
pub mod stage;
pub mod store;
pub mod worker;
