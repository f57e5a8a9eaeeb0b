/// Adapter capability the lifecycle drives
pub mod adapter;

/// Example adapter that fetches a resource over HTTP with reqwest
#[cfg(feature = "http")]
pub mod http;
