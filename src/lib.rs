//! Keyrate - Key-Based Distributed Rate Limiting
//!
//! This crate implements token bucket rate limiting for replicated workers
//! that share nothing but a key-value store with compare-and-swap writes.
//! Buckets are keyed by rule and caller key; every update is an optimistic
//! read-transform-write, and a per-bucket refill gate ensures only one worker
//! refills a bucket per interval.

pub mod config;
pub mod error;
pub mod filter;
pub mod ratelimit;
pub mod scheduler;
pub mod store;
pub mod worker;
