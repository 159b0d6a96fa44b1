pub mod api;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod models;
pub mod outbox;
pub mod pipeline;
pub mod pool;
pub mod rate_limiter;
pub mod recovery;
pub mod repository;
pub mod scheduler;
pub mod senders;
pub mod trace;
pub mod utils;

pub use error::{Error, Result};
