//! Path normalization, scope containment, and command tokenization safety
//! primitives shared by the planner and the factory.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shell-operator tokens that must never appear bare in a tokenized
/// acceptance or verify command.
pub const SHELL_OPERATOR_TOKENS: &[&str] =
    &["|", "||", "&&", ";", ">", ">>", "<", "<<"];

/// Glob metacharacters disallowed in `allowed_files` / `context_files`.
pub const GLOB_CHARS: &[char] = &['*', '?', '['];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is absolute: {0}")]
    Absolute(String),
    #[error("path has a drive letter: {0}")]
    DriveLetter(String),
    #[error("path is empty")]
    Empty,
    #[error("path escapes the root: {0}")]
    Escapes(String),
    #[error("path contains a NUL byte: {0}")]
    NulByte(String),
    #[error("path contains a control character: {0}")]
    ControlChar(String),
    #[error("path contains a glob metacharacter: {0}")]
    GlobChar(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,
    #[error("unparseable command: {0}")]
    Unparseable(String),
    #[error("disallowed shell operator token `{token}` in command: {command}")]
    ShellOperator { token: String, command: String },
}

/// Normalize a candidate relative path to canonical POSIX form.
///
/// Rules: backslashes become `/`, leading `./` is dropped, `.` segments are
/// collapsed, and interior `..` segments are resolved only when doing so
/// does not escape the root. Absolute paths, drive-letter prefixes, empty
/// strings, paths normalizing to `.` or starting with `..`, NUL bytes,
/// control characters, and glob metacharacters are all rejected.
pub fn normalize_rel_path(raw: &str) -> Result<String, PathError> {
    if raw.is_empty() {
        return Err(PathError::Empty);
    }
    if raw.contains('\0') {
        return Err(PathError::NulByte(raw.to_string()));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(PathError::ControlChar(raw.to_string()));
    }
    if raw.chars().any(|c| GLOB_CHARS.contains(&c)) {
        return Err(PathError::GlobChar(raw.to_string()));
    }

    let slashed = raw.replace('\\', "/");

    if slashed.starts_with('/') {
        return Err(PathError::Absolute(raw.to_string()));
    }
    if has_drive_letter(&slashed) {
        return Err(PathError::DriveLetter(raw.to_string()));
    }

    let mut out: Vec<&str> = Vec::new();
    for seg in slashed.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                if out.pop().is_none() {
                    return Err(PathError::Escapes(raw.to_string()));
                }
            }
            s => out.push(s),
        }
    }

    if out.is_empty() {
        return Err(PathError::Escapes(raw.to_string()));
    }

    Ok(out.join("/"))
}

fn has_drive_letter(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Join `base` and a candidate relative path `rel`, returning the joined
/// path only after `normalize_rel_path` proves `rel` does not traverse
/// outside `base`.
pub fn safe_join(base: &Path, rel: &str) -> Result<PathBuf, PathError> {
    let normalized = normalize_rel_path(rel)?;
    Ok(base.join(normalized))
}

/// Whether any path string in `paths` contains a glob metacharacter.
pub fn any_has_glob_char<'a, I: IntoIterator<Item = &'a str>>(paths: I) -> bool {
    paths
        .into_iter()
        .any(|p| p.chars().any(|c| GLOB_CHARS.contains(&c)))
}

/// Tokenize a command string using POSIX shell-lexing rules (quoting,
/// escaping) without invoking a shell. Rejects any command containing a
/// bare shell-operator token post-lexing.
pub fn tokenize_command(command: &str) -> Result<Vec<String>, CommandError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CommandError::Empty);
    }
    let tokens =
        shlex::split(trimmed).ok_or_else(|| CommandError::Unparseable(command.to_string()))?;
    if tokens.is_empty() {
        return Err(CommandError::Empty);
    }
    for tok in &tokens {
        if SHELL_OPERATOR_TOKENS.contains(&tok.as_str()) {
            return Err(CommandError::ShellOperator {
                token: tok.clone(),
                command: command.to_string(),
            });
        }
    }
    Ok(tokens)
}

/// Normalize a command string the way E105 needs to compare two commands
/// for equality: shlex-split then rejoin on a single space, so leading /
/// trailing whitespace, double spaces, and a `./` prefix don't matter.
pub fn normalize_command_for_comparison(command: &str) -> Option<String> {
    let tokens = shlex::split(command.trim())?;
    let normalized: Vec<String> = tokens
        .into_iter()
        .map(|t| {
            if let Ok(p) = normalize_rel_path(&t) {
                p
            } else {
                t
            }
        })
        .collect();
    Some(normalized.join(" "))
}

/// Strip a single leading/trailing markdown code fence (```` ```json ... ``` ````
/// or plain ` ``` ... ``` `) from an LLM response, if present.
pub fn strip_markdown_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let without_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed.to_string(),
    };
    let without_close = without_open.strip_suffix("```").unwrap_or(without_open);
    without_close.trim().to_string()
}

/// Reject any payload larger than 10 MiB before attempting to parse it.
pub const MAX_JSON_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

pub fn guard_payload_size(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() > MAX_JSON_PAYLOAD_BYTES {
        return Err("too large".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_backslashes_and_dot_segments() {
        assert_eq!(normalize_rel_path("a\\b\\./c.txt").unwrap(), "a/b/c.txt");
    }

    #[test]
    fn resolves_interior_dotdot_without_escaping() {
        assert_eq!(normalize_rel_path("a/b/../c.txt").unwrap(), "a/c.txt");
    }

    #[test]
    fn rejects_escaping_dotdot() {
        assert_eq!(
            normalize_rel_path("../secret.txt"),
            Err(PathError::Escapes("../secret.txt".to_string()))
        );
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(matches!(
            normalize_rel_path("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
    }

    #[test]
    fn rejects_drive_letter() {
        assert!(matches!(
            normalize_rel_path("C:\\Windows\\System32"),
            Err(PathError::DriveLetter(_))
        ));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(normalize_rel_path(""), Err(PathError::Empty));
    }

    #[test]
    fn rejects_glob_chars() {
        assert!(matches!(
            normalize_rel_path("src/*.rs"),
            Err(PathError::GlobChar(_))
        ));
    }

    #[test]
    fn safe_join_stays_within_root() {
        let base = Path::new("/repo");
        let joined = safe_join(base, "src/lib.rs").unwrap();
        assert_eq!(joined, Path::new("/repo/src/lib.rs"));
    }

    #[test]
    fn tokenize_rejects_bare_shell_operator() {
        let err = tokenize_command("echo hi && rm -rf /").unwrap_err();
        assert!(matches!(err, CommandError::ShellOperator { .. }));
    }

    #[test]
    fn tokenize_allows_quoted_operator_lookalikes() {
        let tokens = tokenize_command("echo 'a && b'").unwrap();
        assert_eq!(tokens, vec!["echo", "a && b"]);
    }

    #[test]
    fn normalize_command_ignores_whitespace_and_dot_prefix() {
        let a = normalize_command_for_comparison("bash  ./scripts/verify.sh").unwrap();
        let b = normalize_command_for_comparison("bash scripts/verify.sh").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn strip_fences_removes_json_fence() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_markdown_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn strip_fences_noop_without_fence() {
        assert_eq!(strip_markdown_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn payload_guard_rejects_oversized() {
        let big = vec![0u8; MAX_JSON_PAYLOAD_BYTES + 1];
        assert!(guard_payload_size(&big).is_err());
    }
}
