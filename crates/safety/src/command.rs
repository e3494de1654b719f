use crate::SafetyError;

/// Allowed executables and, per executable, the argument-string prefixes a
/// call may use. An empty prefix admits any metacharacter-free arguments.
const WHITELIST: &[(&str, &[&str])] = &[
    ("npm", &["install", "ci", "run build", "run lint", "run test", "test", "ls"]),
    ("npx", &["eslint", "prettier", "tsc"]),
    ("git", &["status", "diff", "log", "show", "add", "commit", "rev-parse", "ls-files"]),
    ("curl", &["-s", "-i", "-f", "http://localhost", "https://localhost"]),
    ("node", &["--check"]),
    ("ls", &[""]),
    ("cat", &[""]),
    ("head", &[""]),
    ("tail", &[""]),
    ("wc", &[""]),
    ("grep", &[""]),
    ("which", &[""]),
];

/// Characters forbidden outside quotes: everything that could chain,
/// substitute, or redirect.
const FORBIDDEN_BARE: &[char] = &['`', '$', '(', ')', '{', '}', '|', ';', '&', '<', '>', '!'];

/// Characters forbidden even inside quotes.
const FORBIDDEN_QUOTED: &[char] = &['`', '$'];

/// Validate a single shell invocation against the whitelist and the
/// metacharacter policy. Commands are never chained; callers issue one
/// invocation per call.
pub fn validate_command(command: &str) -> Result<(), SafetyError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(SafetyError::CommandDenied("empty command".to_string()));
    }

    scan_metacharacters(command)?;

    let (program, args) = match command.split_once(char::is_whitespace) {
        Some((p, a)) => (p, a.trim()),
        None => (command, ""),
    };

    // Strip a leading path so `/usr/bin/git` resolves like `git`.
    let program = program.rsplit('/').next().unwrap_or(program);

    let prefixes = WHITELIST
        .iter()
        .find(|(name, _)| *name == program)
        .map(|(_, prefixes)| *prefixes)
        .ok_or_else(|| {
            SafetyError::CommandDenied(format!("executable not whitelisted: {program}"))
        })?;

    if prefixes.iter().any(|p| args.starts_with(p)) {
        Ok(())
    } else {
        Err(SafetyError::CommandDenied(format!(
            "arguments not allowed for {program}: {args}"
        )))
    }
}

/// Quote-aware scan. Outside balanced single/double quotes every character
/// in FORBIDDEN_BARE rejects; inside quotes backtick and dollar reject.
/// Unbalanced quotes reject.
fn scan_metacharacters(command: &str) -> Result<(), SafetyError> {
    #[derive(PartialEq)]
    enum QuoteState {
        None,
        Single,
        Double,
    }

    let mut state = QuoteState::None;
    for c in command.chars() {
        match state {
            QuoteState::None => match c {
                '\'' => state = QuoteState::Single,
                '"' => state = QuoteState::Double,
                _ if FORBIDDEN_BARE.contains(&c) => {
                    return Err(SafetyError::CommandDenied(format!(
                        "forbidden character outside quotes: {c}"
                    )));
                }
                _ => {}
            },
            QuoteState::Single => match c {
                '\'' => state = QuoteState::None,
                _ if FORBIDDEN_QUOTED.contains(&c) => {
                    return Err(SafetyError::CommandDenied(format!(
                        "forbidden character inside quotes: {c}"
                    )));
                }
                _ => {}
            },
            QuoteState::Double => match c {
                '"' => state = QuoteState::None,
                _ if FORBIDDEN_QUOTED.contains(&c) => {
                    return Err(SafetyError::CommandDenied(format!(
                        "forbidden character inside quotes: {c}"
                    )));
                }
                _ => {}
            },
        }
    }

    if state != QuoteState::None {
        return Err(SafetyError::CommandDenied(
            "unbalanced quotes".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelisted_commands() {
        assert!(validate_command("npm run lint").is_ok());
        assert!(validate_command("git status").is_ok());
        assert!(validate_command("ls -la routes").is_ok());
        assert!(validate_command("npx tsc --noEmit").is_ok());
        assert!(validate_command("/usr/bin/git diff").is_ok());
    }

    #[test]
    fn test_unlisted_executable_rejected() {
        assert!(validate_command("rm -rf /").is_err());
        assert!(validate_command("bash script.sh").is_err());
        assert!(validate_command("python exploit.py").is_err());
    }

    #[test]
    fn test_prefix_enforced() {
        assert!(validate_command("npm publish").is_err());
        assert!(validate_command("git push --force").is_err());
        assert!(validate_command("curl -s http://localhost:5000/health").is_ok());
        assert!(validate_command("curl -X POST http://evil.example").is_err());
    }

    #[test]
    fn test_metacharacters_rejected() {
        for cmd in [
            "git status; rm -rf /",
            "ls `whoami`",
            "cat file | grep x",
            "npm test && echo done",
            "ls $(pwd)",
            "echo {a,b}",
            "cat < input",
            "ls > out",
            "git log !!",
        ] {
            assert!(validate_command(cmd).is_err(), "should reject: {cmd}");
        }
    }

    #[test]
    fn test_quoted_dollar_and_backtick_rejected() {
        assert!(validate_command("grep '$HOME' file.txt").is_err());
        assert!(validate_command("grep \"`id`\" file.txt").is_err());
    }

    #[test]
    fn test_quoted_ordinary_metachars_allowed() {
        assert!(validate_command("grep 'foo(bar)' routes/users.js").is_ok());
        assert!(validate_command("grep \"a;b\" notes.txt").is_ok());
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(validate_command("grep 'oops file.txt").is_err());
        assert!(validate_command("cat \"half").is_err());
    }
}
