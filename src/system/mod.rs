//! Host system queries

pub mod resources;

pub use resources::{available_cores, inference_threads};
