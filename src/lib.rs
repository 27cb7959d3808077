//! Floodgate - Admission Control Engine
//!
//! This crate implements a multi-partition rate limiting decision engine.
//! Quotas are tracked per IP address, API client, organization, endpoint,
//! or globally, with counters held in a shared store so decisions remain
//! correct across a horizontally-scaled fleet.

pub mod limiter;
pub mod store;
pub mod config;
pub mod error;
pub mod telemetry;
