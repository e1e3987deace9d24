//! Streamwatch agent: configuration loading and the HTTP API

pub mod api;
pub mod config;
