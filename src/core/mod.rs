//! Engine internals: rules, persistence, audit trail and configuration

pub mod audit;
pub mod config;
pub mod error;
pub mod rules;
pub mod store;
pub mod validation;

#[cfg(feature = "async")]
pub mod async_engine;
