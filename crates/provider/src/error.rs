/// Vendor errors classified at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum VendorError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Billing problem: {0}")]
    Billing(String),

    #[error("Rate limited")]
    RateLimit { retry_after_ms: Option<u64> },

    #[error("Vendor overloaded")]
    Overloaded,

    #[error("Vendor unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl VendorError {
    /// Classify an HTTP status per the observed vendor taxonomy.
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        match status {
            401 | 403 => VendorError::Auth(body),
            400 if body.contains("credit balance") => VendorError::Billing(body),
            429 => VendorError::RateLimit {
                retry_after_ms: retry_after
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(|secs| secs * 1000),
            },
            529 => VendorError::Overloaded,
            _ => VendorError::Http { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VendorError::RateLimit { .. } | VendorError::Overloaded | VendorError::Unreachable(_)
        )
    }

    /// Unreachable errors get a single retry; the rest of the retryable
    /// kinds get the full retry budget.
    pub fn max_retries(&self) -> u32 {
        match self {
            VendorError::Unreachable(_) => 1,
            VendorError::RateLimit { .. } | VendorError::Overloaded => 2,
            _ => 0,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            VendorError::RateLimit { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }

    /// Stable kind name for logs and CLI reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            VendorError::Auth(_) => "auth",
            VendorError::Billing(_) => "billing",
            VendorError::RateLimit { .. } => "rate-limit",
            VendorError::Overloaded => "overloaded",
            VendorError::Unreachable(_) => "unreachable",
            VendorError::Http { .. } => "http",
            VendorError::Malformed(_) => "malformed",
        }
    }
}
