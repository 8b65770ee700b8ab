//! Network plumbing shared by the registry client and the downloader.
//!
//! - [`HttpClient`]: `reqwest` clients built from [`Settings`](crate::Settings)
//! - [`RetryPolicy`]: bounded exponential backoff with a retryable-kind list

mod client;
mod retry;

pub use client::{check_status, HttpClient};
pub use retry::{retry_async, RetryPolicy, RetryStats};
