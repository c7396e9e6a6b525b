//! HTTP request layer

pub mod client_http;

pub use client_http::{create_client_router, SharedNode};
