//! Extraction worker — claims extraction jobs from a shared queue and runs
//! them against the document and blob stores.

pub mod blob;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod extraction;
pub mod jobs;
pub mod store;
pub mod telemetry;
