//! Container image references.
//!
//! Images are produced by an external build pipeline and consumed here as
//! opaque identifiers. Parsing only checks the shape so that an obviously
//! malformed reference fails at configuration time rather than at pull time.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageVersion {
    /// `repo:tag`
    Tag(String),
    /// `repo@sha256:<64 hex>`
    Digest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry host, e.g. `123456789012.dkr.ecr.ca-central-1.amazonaws.com`.
    pub registry: Option<String>,
    pub repository: String,
    pub version: ImageVersion,
    /// The reference exactly as supplied.
    raw: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("empty image reference")]
    Empty,
    #[error("invalid image reference {0:?}: {1}")]
    Invalid(String, &'static str),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ImageError> {
        let raw = reference.trim();
        if raw.is_empty() {
            return Err(ImageError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(ImageError::Invalid(raw.to_string(), "contains whitespace"));
        }

        let (name, version) = if let Some((name, digest)) = raw.split_once('@') {
            let hex = digest
                .strip_prefix("sha256:")
                .ok_or_else(|| ImageError::Invalid(raw.to_string(), "digest must be sha256"))?;
            if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ImageError::Invalid(raw.to_string(), "digest must be 64 hex chars"));
            }
            (name, ImageVersion::Digest(digest.to_string()))
        } else {
            // A ':' after the last '/' is a tag; before it, a registry port.
            let last_slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
            match raw[last_slash..].rfind(':') {
                Some(i) => {
                    let split = last_slash + i;
                    let tag = &raw[split + 1..];
                    if tag.is_empty() {
                        return Err(ImageError::Invalid(raw.to_string(), "empty tag"));
                    }
                    (&raw[..split], ImageVersion::Tag(tag.to_string()))
                }
                None => (raw, ImageVersion::Tag("latest".to_string())),
            }
        };

        if name.is_empty() || name.ends_with('/') {
            return Err(ImageError::Invalid(raw.to_string(), "missing repository"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => {
                (Some(host.to_string()), rest.to_string())
            }
            _ => (None, name.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            version,
            raw: raw.to_string(),
        })
    }

    /// The reference as supplied; this is what gets written to outputs.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.version, ImageVersion::Digest(_))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
