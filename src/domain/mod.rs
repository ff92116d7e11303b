//! Domain types shared by the renderer seam, the worker session and the CLI.

pub mod error;
pub mod render;
