//! Fluxguard - Admission Control and Rate Limiting
//!
//! This crate implements request admission control with two limiting
//! algorithms, a bucketed sliding-window counter and a token bucket. Both run
//! over a keyed state store that is either local to the process or shared
//! between service instances through Redis.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;
