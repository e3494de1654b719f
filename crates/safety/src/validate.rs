use std::path::{Component, Path};

use crate::identity::is_identity_file;
use crate::SafetyError;

/// File names no LLM-proposed action may ever touch.
const DENIED_FILE_NAMES: &[&str] = &[
    ".env",
    ".env.local",
    ".env.production",
    ".env.development",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    "requirements.txt",
    "Pipfile.lock",
];

/// Path prefixes that are never valid mutation targets: dependency stores
/// and the core's own source tree.
const DENIED_PREFIXES: &[&str] = &[
    "node_modules",
    ".git",
    "vendor",
    "target",
    "sneebly",
    ".sneebly",
];

/// Code fragments that indicate a proposed change is trying to smuggle a
/// write into denied territory or read the environment dynamically.
const DENIED_CODE_PATTERNS: &[&str] = &[
    "writeFileSync('.env",
    "writeFileSync(\".env",
    "writeFile('.env",
    "writeFile(\".env",
    "process.env[",
    "require('child_process')",
    "require(\"child_process\")",
    "rm -rf",
];

/// Glob-based write policy from the agent configuration. Paths matching a
/// safe glob are eligible for auto-approval; protected globs always deny.
pub struct PathPolicy {
    safe: Vec<glob::Pattern>,
    protected: Vec<glob::Pattern>,
}

impl PathPolicy {
    pub fn new(safe: &[String], protected: &[String]) -> Self {
        Self {
            safe: safe
                .iter()
                .filter_map(|g| glob::Pattern::new(g).ok())
                .collect(),
            protected: protected
                .iter()
                .filter_map(|g| glob::Pattern::new(g).ok())
                .collect(),
        }
    }

    /// True when the path may skip owner review and go straight to the
    /// approved queue.
    pub fn is_safe(&self, path: &str) -> bool {
        if validate_write_path(path).is_err() {
            return false;
        }
        if self.protected.iter().any(|g| g.matches(path)) {
            return false;
        }
        self.safe.iter().any(|g| g.matches(path))
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.iter().any(|g| g.matches(path))
    }
}

/// Validate a relative path an LLM proposes to create or modify.
pub fn validate_write_path(path: &str) -> Result<(), SafetyError> {
    let p = Path::new(path);

    for component in p.components() {
        if matches!(component, Component::ParentDir) {
            return Err(SafetyError::PathDenied {
                path: path.to_string(),
                reason: "path traversal".to_string(),
            });
        }
    }

    if p.is_absolute() {
        return Err(SafetyError::PathDenied {
            path: path.to_string(),
            reason: "absolute path".to_string(),
        });
    }

    if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
        if is_identity_file(name) {
            return Err(SafetyError::PathDenied {
                path: path.to_string(),
                reason: "identity file".to_string(),
            });
        }
        if DENIED_FILE_NAMES.iter().any(|d| name.eq_ignore_ascii_case(d)) {
            return Err(SafetyError::PathDenied {
                path: path.to_string(),
                reason: "denied file name".to_string(),
            });
        }
    }

    if let Some(Component::Normal(first)) = p.components().next() {
        if let Some(first) = first.to_str() {
            if DENIED_PREFIXES.iter().any(|d| first.eq_ignore_ascii_case(d)) {
                return Err(SafetyError::PathDenied {
                    path: path.to_string(),
                    reason: "denied path prefix".to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Scan proposed code for patterns that reach into denied territory.
pub fn validate_code(code: &str) -> Result<(), SafetyError> {
    for pattern in DENIED_CODE_PATTERNS {
        if code.contains(pattern) {
            return Err(SafetyError::CodeDenied(format!(
                "proposed code contains denied pattern: {pattern}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_rejected() {
        assert!(validate_write_path("../etc/passwd").is_err());
        assert!(validate_write_path("routes/../../secrets").is_err());
    }

    #[test]
    fn test_identity_file_rejected() {
        assert!(validate_write_path("SOUL.md").is_err());
        assert!(validate_write_path("identity/GOALS.md").is_err());
    }

    #[test]
    fn test_manifest_and_env_rejected() {
        assert!(validate_write_path(".env").is_err());
        assert!(validate_write_path("package.json").is_err());
        assert!(validate_write_path("sub/package-lock.json").is_err());
    }

    #[test]
    fn test_denied_prefixes() {
        assert!(validate_write_path("node_modules/lodash/index.js").is_err());
        assert!(validate_write_path("sneebly/core.js").is_err());
        assert!(validate_write_path(".sneebly/blockers.json").is_err());
    }

    #[test]
    fn test_normal_paths_allowed() {
        assert!(validate_write_path("routes/users.js").is_ok());
        assert!(validate_write_path("public/css/site.css").is_ok());
    }

    #[test]
    fn test_denied_code_patterns() {
        assert!(validate_code("fs.writeFileSync('.env', data)").is_err());
        assert!(validate_code("const v = process.env[name];").is_err());
        assert!(validate_code("const port = process.env.PORT;").is_ok());
    }

    #[test]
    fn test_path_policy_globs() {
        let policy = PathPolicy::new(
            &["routes/**".to_string(), "public/**".to_string()],
            &["routes/admin/**".to_string()],
        );
        assert!(policy.is_safe("routes/users.js"));
        assert!(policy.is_safe("public/app.js"));
        assert!(!policy.is_safe("routes/admin/keys.js"));
        assert!(!policy.is_safe("lib/db.js"));
        assert!(!policy.is_safe("../routes/users.js"));
    }
}
