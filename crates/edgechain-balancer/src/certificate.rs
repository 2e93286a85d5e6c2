//! Certificate references and the stores that resolve them.
//!
//! Certificates are issued and rotated elsewhere. The balancer only holds a
//! reference and asks a [`CertificateStore`] whether it can be bound; the
//! certificate contents are never inspected.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Opaque certificate identity, e.g. an ARN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateRef(String);

impl CertificateRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CertificateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a store reports back for a bindable certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCertificate {
    pub reference: CertificateRef,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("malformed certificate reference {0:?}")]
    Malformed(String),

    #[error("certificate {reference} lives in {found}, balancer is in {expected}")]
    WrongRegion {
        reference: String,
        expected: String,
        found: String,
    },

    #[error("certificate not found: {0}")]
    NotFound(String),

    #[error("certificate store unavailable: {0}")]
    Unavailable(String),
}

impl CertificateError {
    /// Failures that may clear up on retry (store throttling or lag).
    pub fn is_transient(&self) -> bool {
        matches!(self, CertificateError::Unavailable(_))
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            CertificateError::Malformed(r) | CertificateError::NotFound(r) => Some(r),
            CertificateError::WrongRegion { reference, .. } => Some(reference),
            CertificateError::Unavailable(_) => None,
        }
    }
}

pub trait CertificateStore: Send + Sync {
    fn resolve(&self, reference: &CertificateRef) -> Result<ResolvedCertificate, CertificateError>;
}

/// Validates ARN-shaped references for a region:
/// `arn:<partition>:acm:<region>:<account>:certificate/<id>`.
///
/// When constructed with [`with_known`](Self::with_known), well-formed
/// references outside the known set are reported as not found.
#[derive(Debug, Clone)]
pub struct ArnCertificateStore {
    region: String,
    pattern: Regex,
    known: Option<HashSet<String>>,
}

impl ArnCertificateStore {
    pub fn new(region: &str) -> Self {
        let pattern = Regex::new(
            r"^arn:(aws|aws-cn|aws-us-gov):acm:([a-z]{2}(?:-[a-z]+)+-\d):(\d{12}):certificate/([0-9a-fA-F-]{8,})$",
        )
        .expect("certificate ARN pattern is valid");
        Self {
            region: region.to_string(),
            pattern,
            known: None,
        }
    }

    pub fn with_known<I, S>(mut self, known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known = Some(known.into_iter().map(Into::into).collect());
        self
    }
}

impl CertificateStore for ArnCertificateStore {
    fn resolve(&self, reference: &CertificateRef) -> Result<ResolvedCertificate, CertificateError> {
        let raw = reference.as_str();
        let caps = self
            .pattern
            .captures(raw)
            .ok_or_else(|| CertificateError::Malformed(raw.to_string()))?;
        let region = &caps[2];
        if region != self.region {
            return Err(CertificateError::WrongRegion {
                reference: raw.to_string(),
                expected: self.region.clone(),
                found: region.to_string(),
            });
        }
        if let Some(known) = &self.known
            && !known.contains(raw)
        {
            return Err(CertificateError::NotFound(raw.to_string()));
        }
        debug!(certificate = raw, "certificate resolved");
        Ok(ResolvedCertificate {
            reference: reference.clone(),
            region: Some(region.to_string()),
        })
    }
}

/// In-memory store of bindable references, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticCertificateStore {
    certs: Arc<RwLock<HashSet<String>>>,
}

impl StaticCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &str) {
        self.certs.write().expect("certificate lock").insert(reference.to_string());
    }

    pub fn remove(&self, reference: &str) -> bool {
        self.certs.write().expect("certificate lock").remove(reference)
    }
}

impl CertificateStore for StaticCertificateStore {
    fn resolve(&self, reference: &CertificateRef) -> Result<ResolvedCertificate, CertificateError> {
        let certs = self.certs.read().expect("certificate lock");
        if certs.contains(reference.as_str()) {
            Ok(ResolvedCertificate {
                reference: reference.clone(),
                region: None,
            })
        } else {
            Err(CertificateError::NotFound(reference.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str =
        "arn:aws:acm:ca-central-1:123456789012:certificate/0f6c1a52-8d3e-4b7a-9c21-5e4f7a3b2d10";

    #[test]
    fn arn_store_accepts_regional_arn() {
        let store = ArnCertificateStore::new("ca-central-1");
        let resolved = store.resolve(&CertificateRef::new(ARN)).unwrap();
        assert_eq!(resolved.region.as_deref(), Some("ca-central-1"));
    }

    #[test]
    fn arn_store_rejects_malformed() {
        let store = ArnCertificateStore::new("ca-central-1");
        for bad in ["", "not-an-arn", "arn:aws:iam::123456789012:server-certificate/x"] {
            assert_eq!(
                store.resolve(&CertificateRef::new(bad)),
                Err(CertificateError::Malformed(bad.to_string()))
            );
        }
    }

    #[test]
    fn arn_store_rejects_other_region() {
        let store = ArnCertificateStore::new("us-east-1");
        assert!(matches!(
            store.resolve(&CertificateRef::new(ARN)),
            Err(CertificateError::WrongRegion { .. })
        ));
    }

    #[test]
    fn arn_store_known_set() {
        let store = ArnCertificateStore::new("ca-central-1").with_known([ARN]);
        assert!(store.resolve(&CertificateRef::new(ARN)).is_ok());

        let other = ARN.replace("0f6c1a52", "11111111");
        assert_eq!(
            store.resolve(&CertificateRef::new(other.clone())),
            Err(CertificateError::NotFound(other))
        );
    }

    #[test]
    fn static_store_insert_remove() {
        let store = StaticCertificateStore::new();
        store.insert("cert-1");
        assert!(store.resolve(&CertificateRef::new("cert-1")).is_ok());
        assert!(store.remove("cert-1"));
        assert!(store.resolve(&CertificateRef::new("cert-1")).is_err());
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(CertificateError::Unavailable("throttled".into()).is_transient());
        assert!(!CertificateError::NotFound("x".into()).is_transient());
    }
}
