// keg-common/src/model/platform.rs
use std::fmt;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Bottle platform identifier, e.g. `arm64_sonoma`, `big_sur`, `x86_64_linux`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformTag(String);

impl PlatformTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0.contains("unknown")
    }

    /// Detects the tag of the running host.
    pub fn current() -> Self {
        Self(detect_current_platform())
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps a macOS product version (`14.5`, `10.15.7`) to its release codename.
pub fn macos_codename(product_version: &str) -> Option<&'static str> {
    let mut parts = product_version.trim().split('.');
    let major = parts.next()?;
    let name = match major {
        "15" => "sequoia",
        "14" => "sonoma",
        "13" => "ventura",
        "12" => "monterey",
        "11" => "big_sur",
        "10" => match parts.next()? {
            "15" => "catalina",
            "14" => "mojave",
            "13" => "high_sierra",
            _ => return None,
        },
        _ => return None,
    };
    Some(name)
}

fn detect_current_platform() -> String {
    if cfg!(target_os = "macos") {
        let arch = if std::env::consts::ARCH == "aarch64" {
            "arm64"
        } else {
            std::env::consts::ARCH
        };
        let output = Command::new("/usr/bin/sw_vers")
            .arg("-productVersion")
            .output();
        match output {
            Ok(out) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout);
                match macos_codename(&version) {
                    Some(name) if arch == "arm64" => return format!("{arch}_{name}"),
                    Some(name) => return name.to_string(),
                    None => warn!("Unrecognised macOS version '{}'", version.trim()),
                }
            }
            Ok(out) => warn!("'sw_vers -productVersion' exited with {}", out.status),
            Err(e) => warn!("Failed to execute '/usr/bin/sw_vers': {}", e),
        }
        return "unknown_macos".to_string();
    }
    if cfg!(target_os = "linux") {
        let tag = if std::env::consts::ARCH == "aarch64" {
            "arm64_linux"
        } else {
            "x86_64_linux"
        };
        debug!("Detected platform tag {}", tag);
        return tag.to_string();
    }
    "unknown".to_string()
}
