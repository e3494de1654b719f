pub mod runtime;
pub mod syntax;

use std::path::{Path, PathBuf};

use chrono::Utc;

use sneebly_safety::SafetyError;

use crate::paths::DataPaths;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("no match for old code in {file}")]
    NoMatch { file: String },

    #[error("ambiguous match in {file}: {count} locations")]
    AmbiguousMatch { file: String, count: usize },

    #[error("file already exists: {file}")]
    AlreadyExists { file: String },

    #[error("file not found: {file}")]
    NotFound { file: String },

    #[error("syntax check failed in {file}: {issue}")]
    Syntax {
        file: String,
        issue: syntax::SyntaxIssue,
    },

    #[error("io error on {file}: {source}")]
    Io {
        file: String,
        source: std::io::Error,
    },
}

/// Snapshot taken before a file is touched. `existed == false` marks a
/// create, whose rollback is deletion.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: String,
    pub file_path: String,
    pub backup_path: Option<PathBuf>,
    pub existed: bool,
}

/// One element of a change set.
#[derive(Debug, Clone)]
pub enum FileOp {
    Change {
        file_path: String,
        old_code: String,
        new_code: String,
    },
    Append {
        file_path: String,
        content: String,
    },
    Create {
        file_path: String,
        content: String,
    },
}

impl FileOp {
    pub fn file_path(&self) -> &str {
        match self {
            FileOp::Change { file_path, .. }
            | FileOp::Append { file_path, .. }
            | FileOp::Create { file_path, .. } => file_path,
        }
    }

    fn proposed_code(&self) -> &str {
        match self {
            FileOp::Change { new_code, .. } => new_code,
            FileOp::Append { content, .. } | FileOp::Create { content, .. } => content,
        }
    }
}

/// Outcome of an applied change set. Carries the backup records so the
/// caller can still roll the whole set back if a later verification step
/// fails.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub records: Vec<BackupRecord>,
    pub files: Vec<String>,
}

impl Receipt {
    pub fn backup_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

/// Primitive mutation operations with safety preconditions. Every entry
/// point re-checks the path policy and the identity deny list before
/// touching disk.
pub struct CodeEngine {
    project_root: PathBuf,
    backups_dir: PathBuf,
}

impl CodeEngine {
    pub fn new(project_root: &Path, paths: &DataPaths) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            backups_dir: paths.backups(),
        }
    }

    /// Validate a relative path and resolve it inside the project root.
    fn guard(&self, rel: &str) -> Result<PathBuf, EngineError> {
        sneebly_safety::validate_write_path(rel)?;
        Ok(self.project_root.join(rel))
    }

    fn io_err(file: &str, source: std::io::Error) -> EngineError {
        EngineError::Io {
            file: file.to_string(),
            source,
        }
    }

    /// Copy the target to a timestamped backup path and return the record.
    pub fn backup(&self, rel: &str) -> Result<BackupRecord, EngineError> {
        let abs = self.guard(rel)?;
        let id = uuid::Uuid::new_v4().to_string();

        if !abs.exists() {
            return Ok(BackupRecord {
                id,
                file_path: rel.to_string(),
                backup_path: None,
                existed: false,
            });
        }

        std::fs::create_dir_all(&self.backups_dir).map_err(|e| Self::io_err(rel, e))?;
        let flat = rel.replace(['/', '\\'], "__");
        let ts = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let backup_path = self.backups_dir.join(format!("{flat}.{ts}.bak"));
        std::fs::copy(&abs, &backup_path).map_err(|e| Self::io_err(rel, e))?;

        Ok(BackupRecord {
            id,
            file_path: rel.to_string(),
            backup_path: Some(backup_path),
            existed: true,
        })
    }

    /// Exact-substring replacement, falling back to a fuzzy trimmed-line
    /// match. The fuzzy path requires at least two lines and exactly one
    /// match location; the original (indented) text is replaced so
    /// indentation survives.
    pub fn apply(&self, rel: &str, old_code: &str, new_code: &str) -> Result<(), EngineError> {
        sneebly_safety::validate_code(new_code).map_err(EngineError::Safety)?;
        let abs = self.guard(rel)?;
        let content = std::fs::read_to_string(&abs).map_err(|_| EngineError::NotFound {
            file: rel.to_string(),
        })?;

        let new_content = if content.contains(old_code) {
            let count = content.matches(old_code).count();
            if count > 1 {
                return Err(EngineError::AmbiguousMatch {
                    file: rel.to_string(),
                    count,
                });
            }
            content.replacen(old_code, new_code, 1)
        } else {
            let (start, end) = find_fuzzy(&content, old_code).map_err(|e| match e {
                FuzzyFailure::NoMatch => EngineError::NoMatch {
                    file: rel.to_string(),
                },
                FuzzyFailure::Ambiguous(count) => EngineError::AmbiguousMatch {
                    file: rel.to_string(),
                    count,
                },
            })?;
            format!("{}{}{}", &content[..start], new_code, &content[end..])
        };

        std::fs::write(&abs, new_content).map_err(|e| Self::io_err(rel, e))?;
        Ok(())
    }

    pub fn append(&self, rel: &str, content: &str) -> Result<(), EngineError> {
        sneebly_safety::validate_code(content).map_err(EngineError::Safety)?;
        let abs = self.guard(rel)?;
        let mut existing = std::fs::read_to_string(&abs).map_err(|_| EngineError::NotFound {
            file: rel.to_string(),
        })?;
        if !existing.ends_with('\n') && !existing.is_empty() {
            existing.push('\n');
        }
        existing.push_str(content);
        std::fs::write(&abs, existing).map_err(|e| Self::io_err(rel, e))?;
        Ok(())
    }

    /// Write a new file; an existing target is rejected. Parent
    /// directories are created as needed.
    pub fn create(&self, rel: &str, content: &str) -> Result<(), EngineError> {
        sneebly_safety::validate_code(content).map_err(EngineError::Safety)?;
        let abs = self.guard(rel)?;
        if abs.exists() {
            return Err(EngineError::AlreadyExists {
                file: rel.to_string(),
            });
        }
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_err(rel, e))?;
        }
        std::fs::write(&abs, content).map_err(|e| Self::io_err(rel, e))?;
        Ok(())
    }

    /// Restore every record: overwrite from backup, or delete files that
    /// did not exist before the transaction.
    pub fn rollback(&self, records: &[BackupRecord]) -> Result<(), EngineError> {
        for record in records {
            let abs = self.guard(&record.file_path)?;
            match (&record.backup_path, record.existed) {
                (Some(backup), true) => {
                    std::fs::copy(backup, &abs)
                        .map_err(|e| Self::io_err(&record.file_path, e))?;
                }
                (_, false) => {
                    if abs.exists() {
                        std::fs::remove_file(&abs)
                            .map_err(|e| Self::io_err(&record.file_path, e))?;
                    }
                }
                (None, true) => {}
            }
        }
        Ok(())
    }

    /// Atomic multi-file change set: back up every target strictly before
    /// the first apply, apply in order, syntax-check each file after its
    /// apply. Any failure reverts everything.
    pub fn apply_transaction(&self, ops: &[FileOp]) -> Result<Receipt, EngineError> {
        // Validate everything up front so a doomed set never mutates disk.
        for op in ops {
            self.guard(op.file_path())?;
            sneebly_safety::validate_code(op.proposed_code())?;
        }

        let mut backups = vec![];
        for op in ops {
            backups.push(self.backup(op.file_path())?);
        }

        for op in ops {
            let result = match op {
                FileOp::Change {
                    file_path,
                    old_code,
                    new_code,
                } => self.apply(file_path, old_code, new_code),
                FileOp::Append { file_path, content } => self.append(file_path, content),
                FileOp::Create { file_path, content } => self.create(file_path, content),
            }
            .and_then(|_| self.check_syntax(op.file_path()));

            if let Err(e) = result {
                self.rollback(&backups)?;
                return Err(e);
            }
        }

        Ok(Receipt {
            records: backups,
            files: ops.iter().map(|op| op.file_path().to_string()).collect(),
        })
    }

    fn check_syntax(&self, rel: &str) -> Result<(), EngineError> {
        let abs = self.guard(rel)?;
        if !syntax::is_checkable(&abs) {
            return Ok(());
        }
        let content = std::fs::read_to_string(&abs).map_err(|e| Self::io_err(rel, e))?;
        syntax::verify_balanced(&content).map_err(|issue| EngineError::Syntax {
            file: rel.to_string(),
            issue,
        })
    }
}

enum FuzzyFailure {
    NoMatch,
    Ambiguous(usize),
}

/// Trimmed-line window match. Returns the byte range of the matched
/// original text.
fn find_fuzzy(content: &str, old_code: &str) -> Result<(usize, usize), FuzzyFailure> {
    let old_lines: Vec<&str> = old_code.lines().map(str::trim).collect();
    if old_lines.len() < 2 {
        return Err(FuzzyFailure::NoMatch);
    }

    // Line start offsets, plus a sentinel at EOF.
    let mut offsets = vec![0usize];
    for (i, b) in content.bytes().enumerate() {
        if b == b'\n' {
            offsets.push(i + 1);
        }
    }
    let file_lines: Vec<&str> = content.lines().collect();
    if file_lines.len() < old_lines.len() {
        return Err(FuzzyFailure::NoMatch);
    }

    let mut matches = vec![];
    for start in 0..=(file_lines.len() - old_lines.len()) {
        if old_lines
            .iter()
            .enumerate()
            .all(|(i, old)| file_lines[start + i].trim() == *old)
        {
            matches.push(start);
        }
    }

    match matches.len() {
        0 => Err(FuzzyFailure::NoMatch),
        1 => {
            let start_line = matches[0];
            let start = offsets[start_line];
            let end = start + content[start..]
                .lines()
                .take(old_lines.len())
                .map(|l| l.len() + 1)
                .sum::<usize>()
                .min(content.len() - start);
            // Drop the trailing newline from the range so the replacement
            // does not eat it.
            let end = if end > start && content.as_bytes().get(end - 1) == Some(&b'\n') {
                end - 1
            } else {
                end
            };
            Ok((start, end))
        }
        n => Err(FuzzyFailure::Ambiguous(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn setup() -> (tempfile::TempDir, CodeEngine) {
        let dir = tempfile::tempdir().unwrap();
        let data = DataPaths::new(&dir.path().join(".sneebly"));
        data.ensure_layout().unwrap();
        let engine = CodeEngine::new(dir.path(), &data);
        (dir, engine)
    }

    fn sha(path: &Path) -> String {
        hex::encode(Sha256::digest(std::fs::read(path).unwrap()))
    }

    #[test]
    fn test_exact_apply() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        std::fs::write(dir.path().join("routes/a.js"), "const a = 1;\n").unwrap();
        engine.apply("routes/a.js", "const a = 1;", "const a = 2;").unwrap();
        let content = std::fs::read_to_string(dir.path().join("routes/a.js")).unwrap();
        assert_eq!(content, "const a = 2;\n");
    }

    #[test]
    fn test_fuzzy_apply_preserves_indentation() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        let original = "function f() {\n    let a = 1;\n    return a;\n}\n";
        std::fs::write(dir.path().join("routes/a.js"), original).unwrap();
        // The spec's old code has different indentation than the file.
        engine
            .apply(
                "routes/a.js",
                "let a = 1;\nreturn a;",
                "    let a = 2;\n    return a;",
            )
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("routes/a.js")).unwrap();
        assert_eq!(content, "function f() {\n    let a = 2;\n    return a;\n}\n");
    }

    #[test]
    fn test_fuzzy_rejects_single_line() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        std::fs::write(dir.path().join("routes/a.js"), "  let a = 1;\n").unwrap();
        let err = engine.apply("routes/a.js", "let a = 1;", "let a = 2;");
        // Exact match fails (indentation differs) and fuzzy needs >= 2 lines.
        assert!(matches!(err, Err(EngineError::NoMatch { .. })));
    }

    #[test]
    fn test_fuzzy_rejects_ambiguous() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        let original = "  a();\n  b();\nx\n  a();\n  b();\n";
        std::fs::write(dir.path().join("routes/a.js"), original).unwrap();
        let err = engine.apply("routes/a.js", "a();\nb();", "c();");
        assert!(matches!(err, Err(EngineError::AmbiguousMatch { count: 2, .. })));
    }

    #[test]
    fn test_create_rejects_existing() {
        let (dir, engine) = setup();
        engine.create("routes/new.js", "let x = 1;\n").unwrap();
        assert!(dir.path().join("routes/new.js").exists());
        assert!(matches!(
            engine.create("routes/new.js", "dup"),
            Err(EngineError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_identity_file_never_touched() {
        let (_dir, engine) = setup();
        assert!(matches!(
            engine.create("SOUL.md", "new soul"),
            Err(EngineError::Safety(_))
        ));
        assert!(matches!(
            engine.backup("../outside.js"),
            Err(EngineError::Safety(_))
        ));
    }

    #[test]
    fn test_apply_rollback_restores_sha() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        let target = dir.path().join("routes/a.js");
        std::fs::write(&target, "const a = 1;\n").unwrap();
        let before = sha(&target);

        let record = engine.backup("routes/a.js").unwrap();
        engine.apply("routes/a.js", "const a = 1;", "const a = 2;").unwrap();
        assert_ne!(sha(&target), before);

        engine.rollback(&[record]).unwrap();
        assert_eq!(sha(&target), before);
    }

    #[test]
    fn test_transaction_atomicity_on_syntax_failure() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        let a = dir.path().join("routes/a.js");
        let b = dir.path().join("routes/b.js");
        std::fs::write(&a, "const a = 1;\n").unwrap();
        std::fs::write(&b, "const b = 1;\n").unwrap();
        let sha_a = sha(&a);
        let sha_b = sha(&b);

        let ops = vec![
            FileOp::Change {
                file_path: "routes/a.js".to_string(),
                old_code: "const a = 1;".to_string(),
                new_code: "const a = 2;".to_string(),
            },
            FileOp::Change {
                file_path: "routes/b.js".to_string(),
                old_code: "const b = 1;".to_string(),
                new_code: "const b = {;".to_string(),
            },
        ];

        let err = engine.apply_transaction(&ops);
        assert!(matches!(err, Err(EngineError::Syntax { .. })));
        // Both files bit-identical to their pre-transaction state.
        assert_eq!(sha(&a), sha_a);
        assert_eq!(sha(&b), sha_b);
    }

    #[test]
    fn test_transaction_rollback_deletes_created_files() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        std::fs::write(dir.path().join("routes/a.js"), "const a = 1;\n").unwrap();

        let ops = vec![
            FileOp::Create {
                file_path: "routes/new.js".to_string(),
                content: "let ok = 1;\n".to_string(),
            },
            FileOp::Change {
                file_path: "routes/a.js".to_string(),
                old_code: "does not appear".to_string(),
                new_code: "irrelevant".to_string(),
            },
        ];

        assert!(engine.apply_transaction(&ops).is_err());
        assert!(!dir.path().join("routes/new.js").exists());
    }

    #[test]
    fn test_transaction_success_produces_backups() {
        let (dir, engine) = setup();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        std::fs::write(dir.path().join("routes/a.js"), "const a = 1;\n").unwrap();

        let receipt = engine
            .apply_transaction(&[FileOp::Change {
                file_path: "routes/a.js".to_string(),
                old_code: "const a = 1;".to_string(),
                new_code: "const a = 2;".to_string(),
            }])
            .unwrap();
        assert_eq!(receipt.backup_ids().len(), 1);
        let backups: Vec<_> = std::fs::read_dir(dir.path().join(".sneebly/backups"))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
