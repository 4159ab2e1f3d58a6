pub mod auth;
pub mod catalog;
pub mod config;
pub mod contacts;
pub mod crm;
pub mod drain;
pub mod filters;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

#[cfg(test)]
mod pipeline_tests;
