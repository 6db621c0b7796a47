//! Runtime integration profiler.
//!
//! Consumes fixed-width records emitted by connect/openat/libpq probes,
//! attributes them to opted-in applications and writes one deduplicated
//! integration manifest per application.

pub mod agent;
pub mod clock;
pub mod config;
pub mod export;
pub mod pid;
pub mod sink;
pub mod tracer;
