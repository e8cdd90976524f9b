//! Run state storage backends.

pub mod json;

pub use json::JsonRunRepository;
