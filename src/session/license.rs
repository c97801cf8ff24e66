//! License policy definitions
//!
//! A policy decides whether a session's feature controls are active. The
//! engine awaits it during the handshake, so implementations may call out to
//! a license service.

use async_trait::async_trait;

use super::Session;
use crate::protocol::LicenseStatus;

/// Decides the license status of a session after its handshake
#[async_trait]
pub trait LicensePolicy: Send + Sync {
    /// Evaluate the license for the session's reported identity
    async fn evaluate(&self, session: &Session) -> LicenseStatus;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Grants every session the same key
#[derive(Debug, Clone)]
pub struct AlwaysValid {
    pub key: String,
}

impl AlwaysValid {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl LicensePolicy for AlwaysValid {
    async fn evaluate(&self, _session: &Session) -> LicenseStatus {
        LicenseStatus::valid(self.key.clone())
    }

    fn name(&self) -> &str {
        "always-valid"
    }
}

/// Grants sessions whose reported domain is on the list
#[derive(Debug, Clone)]
pub struct DomainAllowlist {
    pub key: String,
    pub domains: Vec<String>,
}

impl DomainAllowlist {
    pub fn new(key: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            key: key.into(),
            domains,
        }
    }

    fn allows(&self, domain: &str) -> bool {
        self.domains
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
    }
}

#[async_trait]
impl LicensePolicy for DomainAllowlist {
    async fn evaluate(&self, session: &Session) -> LicenseStatus {
        match session.domain.as_deref() {
            Some(domain) if self.allows(domain) => LicenseStatus::valid(self.key.clone()),
            Some(_) => LicenseStatus::invalid(self.key.clone(), "domain not licensed"),
            None => LicenseStatus::invalid(self.key.clone(), "domain not reported"),
        }
    }

    fn name(&self) -> &str {
        "domain-allowlist"
    }
}

/// Refuses every session
#[derive(Debug, Clone)]
pub struct Revoked {
    pub key: String,
    pub reason: String,
}

impl Revoked {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LicensePolicy for Revoked {
    async fn evaluate(&self, _session: &Session) -> LicenseStatus {
        LicenseStatus::invalid(self.key.clone(), self.reason.clone())
    }

    fn name(&self) -> &str {
        "revoked"
    }
}
