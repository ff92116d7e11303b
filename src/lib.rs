//! Render web pages to images through a long-lived headless browser worker.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
