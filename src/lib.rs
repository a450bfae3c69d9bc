//! aerobench - Aerospike + YCSB benchmark driver built on a fan-out executor

pub mod benchmark;
pub mod cli;
pub mod config;
pub mod error;
pub mod fanout;
pub mod hosts;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod packages;
pub mod retry;
pub mod state;
pub mod templates;
