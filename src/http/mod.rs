//! HTTP layer for the manifest proxy.
//!
//! Serves cached `package.json` lookups as JSON, plus health and metrics
//! endpoints, over axum.

pub mod handler;
