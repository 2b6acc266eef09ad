// keg-net/src/lib.rs
//! Fetching of source tarballs, bottles and HEAD checkouts into the keg
//! download cache.

pub mod head;
pub mod http;
pub mod validation;

pub use head::{checkout_head, HeadCheckout};
pub use http::{build_http_client, fetch_artifact, fetch_artifact_blocking};
pub use validation::{validate_url, ArtifactLocation};
