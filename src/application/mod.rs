//! Application services: the renderer seam and the batch runner.

pub mod batch;
pub mod error;
pub mod render;
