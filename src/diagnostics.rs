// ABOUTME: Diagnostics accumulator for non-fatal warnings during deploy and stop.
// ABOUTME: Collects warnings that shouldn't fail an operation but should be shown to users.

/// Collects non-fatal warnings during deployment operations.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!("{}", warning.message);
        self.warnings.push(warning);
    }

    /// Get all collected warnings.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Check if any warnings were collected.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn has(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

/// A non-fatal warning collected during deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Services did not reach their desired replicas in time.
    pub fn health_timeout(message: impl Into<String>) -> Self {
        Self::new(WarningKind::HealthTimeout, message)
    }

    /// No DNS credential; the user has to create the record by hand.
    pub fn manual_dns(message: impl Into<String>) -> Self {
        Self::new(WarningKind::ManualDns, message)
    }

    /// Origin certificate could not be issued; the proxy manages TLS instead.
    pub fn certificate_fallback(message: impl Into<String>) -> Self {
        Self::new(WarningKind::CertificateFallback, message)
    }

    /// A secondary cleanup step failed after the primary operation succeeded.
    pub fn cleanup_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::CleanupFailed, message)
    }
}

/// Categories of warnings that can occur during deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    HealthTimeout,
    ManualDns,
    CertificateFallback,
    CleanupFailed,
}
