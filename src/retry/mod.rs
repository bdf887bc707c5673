// src/retry/mod.rs
mod strategy;

pub use strategy::{RetryState, RetryStrategy};
