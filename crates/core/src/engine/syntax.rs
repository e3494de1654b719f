use std::path::Path;

/// Structural verification for curly-brace languages. Not a parser: a
/// depth-tracking scan over `{} () []` that understands strings, template
/// interpolation, and comments well enough to catch truncated or mangled
/// LLM edits before they reach the host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyntaxIssue {
    #[error("unexpected closing '{close}' at line {line}")]
    NegativeDepth { close: char, line: usize },

    #[error("mismatched '{close}' at line {line}, expected '{expected}'")]
    Mismatched {
        close: char,
        expected: char,
        line: usize,
    },

    #[error("unclosed string starting at line {line}")]
    UnclosedString { line: usize },

    #[error("unclosed block comment starting at line {line}")]
    UnclosedComment { line: usize },

    #[error("{count} unclosed delimiter(s) at end of file")]
    UnclosedDelimiters { count: usize },
}

/// File types the balancer understands.
pub fn is_checkable(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" | "json" | "css")
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Code,
    Single { start_line: usize },
    Double { start_line: usize },
    Backtick { start_line: usize },
    LineComment,
    BlockComment { start_line: usize },
}

fn closer_for(open: char) -> char {
    match open {
        '{' => '}',
        '(' => ')',
        '[' => ']',
        _ => unreachable!(),
    }
}

/// Sentinel pushed for a `${` template interpolation so its closing brace
/// returns the scanner to the enclosing backtick string.
const INTERP: char = '$';

pub fn verify_balanced(content: &str) -> Result<(), SyntaxIssue> {
    let mut modes: Vec<Mode> = vec![Mode::Code];
    let mut stack: Vec<char> = vec![];
    let mut line = 1usize;

    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '\n' {
            line += 1;
        }

        match *modes.last().unwrap_or(&Mode::Code) {
            Mode::Code => match c {
                '\'' => modes.push(Mode::Single { start_line: line }),
                '"' => modes.push(Mode::Double { start_line: line }),
                '`' => modes.push(Mode::Backtick { start_line: line }),
                '/' if next == Some('/') => {
                    modes.push(Mode::LineComment);
                    i += 1;
                }
                '/' if next == Some('*') => {
                    modes.push(Mode::BlockComment { start_line: line });
                    i += 1;
                }
                '{' | '(' | '[' => stack.push(c),
                '}' if stack.last() == Some(&INTERP) => {
                    // End of a template interpolation.
                    stack.pop();
                    modes.pop();
                }
                '}' | ')' | ']' => match stack.pop() {
                    None => return Err(SyntaxIssue::NegativeDepth { close: c, line }),
                    Some(open) => {
                        let expected = closer_for(open);
                        if expected != c {
                            return Err(SyntaxIssue::Mismatched {
                                close: c,
                                expected,
                                line,
                            });
                        }
                    }
                },
                _ => {}
            },
            Mode::Single { start_line } => match c {
                '\\' => i += 1,
                '\'' => {
                    modes.pop();
                }
                '\n' => return Err(SyntaxIssue::UnclosedString { line: start_line }),
                _ => {}
            },
            Mode::Double { start_line } => match c {
                '\\' => i += 1,
                '"' => {
                    modes.pop();
                }
                '\n' => return Err(SyntaxIssue::UnclosedString { line: start_line }),
                _ => {}
            },
            Mode::Backtick { .. } => match c {
                '\\' => i += 1,
                '`' => {
                    modes.pop();
                }
                '$' if next == Some('{') => {
                    stack.push(INTERP);
                    modes.push(Mode::Code);
                    i += 1;
                }
                _ => {}
            },
            Mode::LineComment => {
                if c == '\n' {
                    modes.pop();
                }
            }
            Mode::BlockComment { .. } => {
                if c == '*' && next == Some('/') {
                    modes.pop();
                    i += 1;
                }
            }
        }

        i += 1;
    }

    match modes.last() {
        Some(Mode::Single { start_line })
        | Some(Mode::Double { start_line })
        | Some(Mode::Backtick { start_line }) => {
            return Err(SyntaxIssue::UnclosedString { line: *start_line })
        }
        Some(Mode::BlockComment { start_line }) => {
            return Err(SyntaxIssue::UnclosedComment { line: *start_line })
        }
        _ => {}
    }

    if !stack.is_empty() {
        return Err(SyntaxIssue::UnclosedDelimiters { count: stack.len() });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_code() {
        let code = "function f(a) {\n  return [a, { b: 1 }];\n}\n";
        assert!(verify_balanced(code).is_ok());
    }

    #[test]
    fn test_negative_depth() {
        let err = verify_balanced("}\n{").unwrap_err();
        assert!(matches!(err, SyntaxIssue::NegativeDepth { close: '}', line: 1 }));
    }

    #[test]
    fn test_mismatched_pair() {
        let err = verify_balanced("(]").unwrap_err();
        assert!(matches!(err, SyntaxIssue::Mismatched { .. }));
    }

    #[test]
    fn test_residual_depth() {
        let err = verify_balanced("function f() { if (x) {").unwrap_err();
        assert!(matches!(err, SyntaxIssue::UnclosedDelimiters { count: 2 }));
    }

    #[test]
    fn test_braces_in_strings_ignored() {
        assert!(verify_balanced("const s = \"{[(\";\nconst t = '}})';\n").is_ok());
    }

    #[test]
    fn test_template_interpolation() {
        let code = "const s = `hello ${user.name} and ${items.map(i => `${i}`)}`;";
        assert!(verify_balanced(code).is_ok());
    }

    #[test]
    fn test_unbalanced_inside_interpolation() {
        let code = "const s = `x ${f(a}`;";
        assert!(verify_balanced(code).is_err());
    }

    #[test]
    fn test_comments_ignored() {
        let code = "// unmatched { ( [\nlet a = 1; /* } ) ] */ let b = 2;\n";
        assert!(verify_balanced(code).is_ok());
    }

    #[test]
    fn test_unclosed_block_comment() {
        let err = verify_balanced("let a = 1;\n/* comment").unwrap_err();
        assert!(matches!(err, SyntaxIssue::UnclosedComment { line: _ } if true));
    }

    #[test]
    fn test_unclosed_string() {
        let err = verify_balanced("const s = 'oops\nconst t = 1;").unwrap_err();
        assert!(matches!(err, SyntaxIssue::UnclosedString { .. }));
    }

    #[test]
    fn test_escaped_quotes() {
        assert!(verify_balanced(r#"const s = "she said \"hi\" {";"#).is_ok());
    }

    #[test]
    fn test_multiline_template_ok() {
        assert!(verify_balanced("const s = `line1\nline2 {`;").is_ok());
    }

    #[test]
    fn test_is_checkable() {
        assert!(is_checkable(Path::new("routes/users.js")));
        assert!(is_checkable(Path::new("app.tsx")));
        assert!(!is_checkable(Path::new("views/home.ejs")));
        assert!(!is_checkable(Path::new("README.md")));
    }
}
