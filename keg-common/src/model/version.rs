// keg-common/src/model/version.rs
use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{KegError, Result};

/// Parses a formula version, padding short versions (`1.11` -> `1.11.0`) and
/// tolerating a leading `v`.
pub fn parse_version_lenient(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded).map_err(|e| {
        KegError::ParseError("version", format!("invalid version '{raw}': {e}"))
    })
}

/// A version requirement as written on the command line (`name@1.11`) or in a
/// dependency declaration (`>=0.29, <1`).
///
/// A bare version is a prefix pin: `7.0` matches `7.0.x`, `7.0.33` matches
/// exactly that version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    req: VersionReq,
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KegError::ParseError(
                "version constraint",
                "empty version constraint".to_string(),
            ));
        }
        let candidate = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            format!("={trimmed}")
        } else {
            trimmed.to_string()
        };
        let req = VersionReq::parse(&candidate).map_err(|e| {
            KegError::ParseError(
                "version constraint",
                format!("invalid version constraint '{raw}': {e}"),
            )
        })?;
        Ok(Self {
            raw: trimmed.to_string(),
            req,
        })
    }

    /// Constraint that only `version` satisfies.
    pub fn exact(version: &Version) -> Self {
        let raw = version.to_string();
        Self {
            req: VersionReq::parse(&format!("={raw}")).unwrap_or(VersionReq::STAR),
            raw,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionConstraint {
    type Err = KegError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
