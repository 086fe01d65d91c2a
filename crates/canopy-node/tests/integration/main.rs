//! Integration test entry point for canopy-node.
//!
//! Run with: cargo test --test integration

mod harness;

mod departure;
mod distribution;
mod topology;
