//! Rendering seam between callers and whatever produces page images.
//!
//! Callers depend on [`Renderer`]; the worker-backed implementation lives in
//! [`crate::infra::worker`].

mod types;

pub use types::{RenderError, Renderer};
