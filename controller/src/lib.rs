pub mod activities;
pub mod analyser;
pub mod cache;
pub mod candidate;
pub mod config;
pub mod drain;
pub mod error;
pub mod events;
pub mod index;
pub mod metrics;
pub mod replace;
pub mod retry;
pub mod scheduler;
pub mod scope;
pub mod simulator;
pub mod telemetry;
