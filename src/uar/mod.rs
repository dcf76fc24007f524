//! Universal agent runtime: run lifecycle, step engine and event streaming.

pub mod api;
pub mod defaults;
pub mod domain;
pub mod persistence;
pub mod runtime;
pub mod telemetry;
