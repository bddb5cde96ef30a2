//! Duet API - HTTP client for the pairing backend's REST API.
//!
//! Only the end-to-end encryption endpoints live here: the public key
//! directory and the shared-key exchange store. The client handles bearer
//! authentication, timeouts and exponential backoff on transient failures.

pub mod client;
pub mod endpoints;
pub mod response;

// Re-export key types
pub use client::{ApiClient, RetryConfig};
pub use endpoints::e2ee::{PartnerKeyStatus, SharedKeyStatus};
pub use response::ApiResponse;
