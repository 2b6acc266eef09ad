// keg-core/src/build/mod.rs
// Build execution for formulae: environment, step helpers and the executor.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use keg_aio::json_io::write_json_sync;
use keg_common::error::Result;
use keg_common::state::InstallKind;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod env;
pub mod executor;
pub mod steps;

pub use env::BuildEnvironment;
pub use executor::BuildExecutor;

pub const RECEIPT_FILE_NAME: &str = "INSTALL_RECEIPT.json";

/// Per-keg receipt, kept next to the installed files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub install_kind: InstallKind,
    pub installed_at: DateTime<Utc>,
    pub installed_on_request: bool,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_sha256: String,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
}

pub fn write_receipt(keg_path: &Path, receipt: &InstallReceipt) -> Result<PathBuf> {
    let receipt_path = keg_path.join(RECEIPT_FILE_NAME);
    debug!("Writing install receipt: {}", receipt_path.display());
    write_json_sync(&receipt_path, receipt)?;
    Ok(receipt_path)
}
