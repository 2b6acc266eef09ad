// keg-net/src/validation.rs
use std::path::{Path, PathBuf};

use keg_common::error::{KegError, Result};
use url::Url;

/// Where an artifact can be fetched from once its URL has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Remote(Url),
    Local(PathBuf),
}

/// Validates an artifact URL. Remote artifacts must use https; `file://` URLs
/// and absolute paths name local files.
pub fn validate_url(url_str: &str) -> Result<ArtifactLocation> {
    if Path::new(url_str).is_absolute() {
        return Ok(ArtifactLocation::Local(PathBuf::from(url_str)));
    }
    let url = Url::parse(url_str)
        .map_err(|e| KegError::ValidationError(format!("Failed to parse URL '{url_str}': {e}")))?;
    match url.scheme() {
        "https" => Ok(ArtifactLocation::Remote(url)),
        "file" => url
            .to_file_path()
            .map(ArtifactLocation::Local)
            .map_err(|_| KegError::ValidationError(format!("Invalid file URL '{url_str}'"))),
        other => Err(KegError::ValidationError(format!(
            "Invalid URL scheme for '{url_str}': Must be https or file, but got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_and_local_locations_are_accepted() {
        assert!(matches!(
            validate_url("https://pecl.php.net/get/amqp-1.11.0.tgz").unwrap(),
            ArtifactLocation::Remote(_)
        ));
        assert_eq!(
            validate_url("file:///srv/bottles/x.tar.gz").unwrap(),
            ArtifactLocation::Local(PathBuf::from("/srv/bottles/x.tar.gz"))
        );
        assert_eq!(
            validate_url("/srv/bottles/x.tar.gz").unwrap(),
            ArtifactLocation::Local(PathBuf::from("/srv/bottles/x.tar.gz"))
        );
    }

    #[test]
    fn plain_http_and_garbage_are_rejected() {
        assert!(matches!(
            validate_url("http://pecl.php.net/get/amqp-1.11.0.tgz"),
            Err(KegError::ValidationError(_))
        ));
        assert!(validate_url("not a url").is_err());
    }
}
