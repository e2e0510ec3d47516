//! Moderation orchestration-and-aggregation plane: a Job Orchestrator that
//! fans a job out to a dynamically discovered worker fleet, and a Result
//! Aggregator that folds the partial verdicts into one exactly-once
//! completion event. See `SPEC_FULL.md` for the full component design.

pub mod aggregation_store;
pub mod aggregator;
pub mod broker;
pub mod config;
pub mod error;
pub mod fleet_registry;
pub mod job_store;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod verdict;
