//! Core library for the `armonite` distributed load generator.
//!
//! The crate provides the building blocks wired together by the binary:
//! the embedded message bus, test-plan and ramp-up domain types, the
//! coordinator's registry/aggregation/run-lifecycle machinery, and the
//! agent's load-execution engine. The primary user-facing interface is
//! the `armonite` command-line application.

pub mod agent;
pub mod args;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod persist;
pub mod plan;
pub mod protocol;
pub mod run;
