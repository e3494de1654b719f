pub mod command;
pub mod identity;
pub mod rate_limit;
pub mod sanitize;
pub mod validate;

pub use command::validate_command;
pub use identity::{IdentityGuard, IdentityReport, IDENTITY_FILES};
pub use rate_limit::AuthRateLimiter;
pub use sanitize::{redact_secrets, sanitize_external, security_footer, Sanitized};
pub use validate::{validate_code, validate_write_path, PathPolicy};

/// A rejected operation, with a structured reason suitable for decision
/// logs and blocker records.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SafetyError {
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    #[error("path denied: {path}: {reason}")]
    PathDenied { path: String, reason: String },

    #[error("code denied: {0}")]
    CodeDenied(String),

    #[error("command denied: {0}")]
    CommandDenied(String),
}

/// Constant-time comparison for shared secrets. Both inputs are hashed
/// first so length never leaks through the comparison.
pub fn constant_time_secret_eq(a: &str, b: &str) -> bool {
    use sha2::{Digest, Sha256};
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in ha.iter().zip(hb.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_eq() {
        assert!(constant_time_secret_eq("hunter2", "hunter2"));
        assert!(!constant_time_secret_eq("hunter2", "hunter3"));
        assert!(!constant_time_secret_eq("short", "a-much-longer-secret"));
    }
}
