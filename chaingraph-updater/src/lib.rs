//! The chaingraph delta updater.
//!
//! Advances a transformed (analytics) keyspace to a higher raw height one
//! bounded batch at a time: project raw blocks into per-transaction deltas,
//! fold them, allocate ids for newly seen addresses, attach fiat vectors,
//! and commit everything through one grouped, idempotent write followed by
//! a status/history row.

pub mod cli;
pub mod config;
pub mod testing;
pub mod updater;
