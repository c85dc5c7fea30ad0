//! Shared types used across the saga crates.

pub mod types;

pub use types::SagaId;
