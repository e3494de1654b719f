use std::path::Path;

/// Identity files in prompt order. The composition is fixed: identity,
/// then memory tail, then the security footer, then the subagent
/// definition.
const PROMPT_ORDER: &[&str] = &[
    "SOUL.md",
    "IDENTITY.md",
    "AGENTS.md",
    "TOOLS.md",
    "USER.md",
    "GOALS.md",
];

pub const MEMORY_TAIL_MAX: usize = 4000;

pub fn assemble_system_prompt(
    identity_dir: &Path,
    memory_tail: &str,
    subagent_definition: &str,
) -> String {
    let mut sections = vec![];

    for name in PROMPT_ORDER {
        let path = identity_dir.join(name);
        if let Ok(content) = std::fs::read_to_string(&path) {
            let title = name.trim_end_matches(".md");
            sections.push(format!("# {title}\n\n{}", content.trim()));
        }
    }

    if !memory_tail.is_empty() {
        let tail: String = if memory_tail.chars().count() > MEMORY_TAIL_MAX {
            let skip = memory_tail.chars().count() - MEMORY_TAIL_MAX;
            memory_tail.chars().skip(skip).collect()
        } else {
            memory_tail.to_string()
        };
        sections.push(format!("# MEMORY\n\n{}", tail.trim()));
    }

    sections.push(sneebly_safety::security_footer().to_string());
    sections.push(format!("# SUBAGENT\n\n{subagent_definition}"));

    sections.join("\n\n")
}
