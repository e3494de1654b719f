use std::collections::HashMap;
use std::path::Path;

/// Files above this size are narrowed to a window before prompting.
pub const WINDOW_THRESHOLD_CHARS: usize = 20_000;
const WINDOW_LINES: usize = 140;
const RELATED_FILE_MAX_CHARS: usize = 2_000;
const RELATED_TOTAL_MAX_CHARS: usize = 6_000;

/// Identifier-like tokens too common to carry signal.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "this", "that", "with", "from", "are", "was", "then", "when", "should",
    "must", "have", "has", "will", "page", "file", "code", "function", "return", "const", "let",
    "var", "new", "error", "add", "fix", "update", "change", "true", "false", "null", "undefined",
];

/// Extract a ~140-line window centred on the most relevant location, scored
/// by rare identifiers from the spec text with inverse-frequency weighting.
/// Small files come back whole.
pub fn focus_window(content: &str, spec_text: &str) -> String {
    if content.chars().count() <= WINDOW_THRESHOLD_CHARS {
        return content.to_string();
    }

    let lines: Vec<&str> = content.lines().collect();
    let identifiers = spec_identifiers(spec_text);

    // File-wide occurrence counts give the inverse-frequency weights.
    let mut file_counts: HashMap<&str, usize> = HashMap::new();
    for ident in &identifiers {
        let count = lines.iter().filter(|l| l.contains(ident.as_str())).count();
        if count > 0 {
            file_counts.insert(ident, count);
        }
    }

    let mut best_line = 0usize;
    let mut best_score = 0.0f64;
    for (i, line) in lines.iter().enumerate() {
        let score: f64 = file_counts
            .iter()
            .filter(|(ident, _)| line.contains(*ident))
            .map(|(_, count)| 1.0 / *count as f64)
            .sum();
        if score > best_score {
            best_score = score;
            best_line = i;
        }
    }

    // Route-style specs with no identifier hits bias toward the first
    // handler definition.
    if best_score == 0.0 && looks_route_shaped(spec_text) {
        if let Some(handler_line) = first_handler_line(&lines) {
            best_line = handler_line;
        }
    }

    let half = WINDOW_LINES / 2;
    let start = best_line.saturating_sub(half);
    let end = (best_line + half).min(lines.len());
    lines[start..end].join("\n")
}

fn spec_identifiers(spec_text: &str) -> Vec<String> {
    let ident_re = regex::Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").unwrap();
    let mut seen = std::collections::HashSet::new();
    ident_re
        .find_iter(spec_text)
        .map(|m| m.as_str().to_string())
        .filter(|ident| !STOP_WORDS.contains(&ident.to_lowercase().as_str()))
        .filter(|ident| seen.insert(ident.clone()))
        .collect()
}

fn looks_route_shaped(spec_text: &str) -> bool {
    let lower = spec_text.to_lowercase();
    ["route", "endpoint", "handler", "/api"]
        .iter()
        .any(|kw| lower.contains(kw))
}

fn first_handler_line(lines: &[&str]) -> Option<usize> {
    let handler_re =
        regex::Regex::new(r"(app|router)\.(get|post|put|delete|patch|use)\s*\(").unwrap();
    lines.iter().position(|l| handler_re.is_match(l))
}

/// Resolve relative imports in the window plus explicit related files,
/// reading each up to 2000 chars, capped at 6000 chars total.
pub fn related_context(
    project_root: &Path,
    target_rel: &str,
    window: &str,
    related_files: &[String],
) -> String {
    let import_re = regex::Regex::new(
        r#"(?:require\(\s*['"](\.\.?/[^'"]+)['"]\s*\)|from\s+['"](\.\.?/[^'"]+)['"])"#,
    )
    .unwrap();

    let target_dir = Path::new(target_rel)
        .parent()
        .unwrap_or_else(|| Path::new(""));

    let mut candidates: Vec<String> = vec![];
    for capture in import_re.captures_iter(window) {
        let import = capture
            .get(1)
            .or_else(|| capture.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let joined = target_dir.join(import);
        candidates.push(joined.to_string_lossy().replace('\\', "/"));
    }
    candidates.extend(related_files.iter().cloned());

    let mut blocks = vec![];
    let mut total = 0usize;
    let mut seen = std::collections::HashSet::new();

    for candidate in candidates {
        if total >= RELATED_TOTAL_MAX_CHARS {
            break;
        }
        let Some((resolved_rel, content)) = read_candidate(project_root, &candidate) else {
            continue;
        };
        if !seen.insert(resolved_rel.clone()) {
            continue;
        }
        let excerpt: String = content
            .chars()
            .take(RELATED_FILE_MAX_CHARS.min(RELATED_TOTAL_MAX_CHARS - total))
            .collect();
        total += excerpt.chars().count();
        blocks.push(format!("// ---- {resolved_rel} ----\n{excerpt}"));
    }

    blocks.join("\n\n")
}

/// Try the path as-is, then with `.js`, then as a directory index.
fn read_candidate(project_root: &Path, rel: &str) -> Option<(String, String)> {
    // Normalise `./` segments; reject anything escaping the root.
    let mut normal = vec![];
    for part in rel.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                normal.pop()?;
            }
            other => normal.push(other),
        }
    }
    let clean = normal.join("/");

    for suffix in ["", ".js", "/index.js"] {
        let candidate_rel = format!("{clean}{suffix}");
        let path = project_root.join(&candidate_rel);
        if path.is_file() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                return Some((candidate_rel, content));
            }
        }
    }
    None
}
