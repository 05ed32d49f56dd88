//! Client for the backend REST API
//!
//! The tunnel core only needs a handful of backend operations: tunnel record
//! CRUD, relay token issuance and the mesh peer registry. This crate wraps
//! them behind a typed, bearer-authenticated client.

pub mod client;
pub mod models;

pub use client::{ApiClient, ApiConfig, ApiError};
pub use models::*;
