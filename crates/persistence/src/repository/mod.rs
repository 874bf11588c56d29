//! Repository implementations for database operations

pub mod jobs;

pub use jobs::*;
