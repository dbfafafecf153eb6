//! Plan validator: structural (per-WO) checks and a cross-WO chain
//! validator over cumulative [`FileState`]. Produces a flat list of
//! [`ValidationError`]s; an empty list means the plan is valid.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use harness_types::{Condition, ConditionKind, FileState, Manifest, ValidationError, WorkOrder};
use regex::Regex;

use crate::safety::{self, CommandError, PathError};

static WO_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^WO-\d{2}$").unwrap());

/// Run the full structural + chain validation pass over `manifest`.
/// `initial_state` is the target repo's tracked file set (or empty for a
/// fresh repo).
pub fn validate_manifest(manifest: &Manifest, initial_state: &FileState) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if manifest.work_orders.is_empty() {
        errors.push(ValidationError::new(
            "E000",
            "manifest.work_orders must be a non-empty sequence",
        ));
        return errors;
    }

    for (idx, wo) in manifest.work_orders.iter().enumerate() {
        errors.extend(validate_structural(wo, idx));
    }

    // Chain validation only makes sense once ids are well-formed; still run
    // it best-effort even if some structural errors were found, so a single
    // LLM revision round can fix everything the validator knows about.
    errors.extend(validate_chain(manifest, initial_state));

    errors
}

fn validate_structural(wo: &WorkOrder, idx: usize) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // E001: id must match WO-NN and equal WO-<1-based-index:02d>.
    let expected_id = format!("WO-{:02}", idx + 1);
    if !WO_ID_RE.is_match(&wo.id) {
        errors.push(ValidationError::for_work_order(
            "E001",
            &wo.id,
            format!("id `{}` does not match pattern WO-NN", wo.id),
        ));
    } else if wo.id != expected_id {
        errors.push(ValidationError::for_work_order(
            "E001",
            &wo.id,
            format!("id `{}` is not contiguous; expected `{expected_id}`", wo.id),
        ));
    }

    // E003 / E007: acceptance commands must tokenize cleanly with no bare
    // shell operators.
    if wo.acceptance_commands.is_empty() {
        errors.push(ValidationError::for_work_order(
            "E005",
            &wo.id,
            "acceptance_commands must be non-empty",
        ));
    }
    for cmd in &wo.acceptance_commands {
        match safety::tokenize_command(&cmd.command) {
            Ok(_) => {}
            Err(CommandError::ShellOperator { token, .. }) => {
                errors.push(ValidationError::for_work_order(
                    "E003",
                    &wo.id,
                    format!("disallowed shell operator `{token}` in `{}`", cmd.command),
                ));
            }
            Err(CommandError::Unparseable(_)) | Err(CommandError::Empty) => {
                errors.push(ValidationError::for_work_order(
                    "E007",
                    &wo.id,
                    format!("unparseable acceptance command: `{}`", cmd.command),
                ));
            }
        }

        // E006: for `<interpreter> -c "<code>"` forms, reject syntax errors
        // in the embedded source.
        if let Some(code) = extract_dash_c_code(&cmd.command)
            && let Err(reason) = check_embedded_source_syntax(&code)
        {
            errors.push(ValidationError::for_work_order(
                "E006",
                &wo.id,
                format!("syntax error in embedded `-c` code: {reason}"),
            ));
        }
    }

    // E004: no glob characters in allowed_files / context_files.
    if safety::any_has_glob_char(wo.allowed_files.iter().map(String::as_str)) {
        errors.push(ValidationError::for_work_order(
            "E004",
            &wo.id,
            "allowed_files contains a glob metacharacter",
        ));
    }
    if safety::any_has_glob_char(wo.context_files.iter().map(String::as_str)) {
        errors.push(ValidationError::for_work_order(
            "E004",
            &wo.id,
            "context_files contains a glob metacharacter",
        ));
    }

    // E005: schema invariants — path normalization and cardinality.
    for path in wo.allowed_files.iter().chain(wo.context_files.iter()) {
        if let Err(e) = path_invariant_message(path) {
            errors.push(ValidationError::for_work_order(
                "E005",
                &wo.id,
                format!("invalid path `{path}`: {e}"),
            ));
        }
    }
    if wo.context_files.len() > 10 {
        errors.push(ValidationError::for_work_order(
            "E005",
            &wo.id,
            "context_files must contain at most 10 entries",
        ));
    }

    // E102: contradictory preconditions (same path asserted both exists
    // and absent) within one WO.
    errors.extend(detect_contradictions(wo));

    errors
}

fn path_invariant_message(path: &str) -> Result<(), PathError> {
    safety::normalize_rel_path(path).map(|_| ())
}

fn detect_contradictions(wo: &WorkOrder) -> Vec<ValidationError> {
    let mut exists = BTreeSet::new();
    let mut absent = BTreeSet::new();
    for cond in &wo.preconditions {
        match cond.kind {
            ConditionKind::FileExists => {
                exists.insert(cond.path.clone());
            }
            ConditionKind::FileAbsent => {
                absent.insert(cond.path.clone());
            }
        }
    }
    exists
        .intersection(&absent)
        .map(|path| {
            ValidationError::for_work_order(
                "E102",
                &wo.id,
                format!("`{path}` asserted both file_exists and file_absent"),
            )
        })
        .collect()
}

/// Extract the `<code>` argument from an acceptance command of the shape
/// `<interpreter> -c "<code>"`.
fn extract_dash_c_code(command: &str) -> Option<String> {
    let tokens = shlex::split(command)?;
    let dash_c_idx = tokens.iter().position(|t| t == "-c")?;
    tokens.get(dash_c_idx + 1).cloned()
}

/// A conservative source syntax check: balanced brackets/quotes. Good
/// enough to catch the obviously-truncated or mismatched code an LLM
/// sometimes emits, without embedding a full parser for an unspecified
/// target language.
fn check_embedded_source_syntax(code: &str) -> Result<(), String> {
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    let mut chars = code.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(q) = in_string {
            if c == '\\' {
                chars.next();
            } else if c == q {
                in_string = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => in_string = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' => {
                if stack.pop() != Some('(') {
                    return Err("unbalanced `)`".to_string());
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return Err("unbalanced `]`".to_string());
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return Err("unbalanced `}`".to_string());
                }
            }
            _ => {}
        }
    }
    if in_string.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if !stack.is_empty() {
        return Err(format!("unbalanced `{}`", stack.last().unwrap()));
    }
    Ok(())
}

fn validate_chain(manifest: &Manifest, initial_state: &FileState) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut state = initial_state.clone();

    for wo in &manifest.work_orders {
        // E103 / E104: postcondition <-> allowed_files correspondence.
        let allowed: BTreeSet<&str> = wo.allowed_files.iter().map(String::as_str).collect();
        let mut covered: BTreeSet<&str> = BTreeSet::new();
        for post in &wo.postconditions {
            if post.kind != ConditionKind::FileExists {
                errors.push(ValidationError::for_work_order(
                    "E005",
                    &wo.id,
                    "postconditions are restricted to file_exists",
                ));
                continue;
            }
            if !allowed.contains(post.path.as_str()) {
                errors.push(ValidationError::for_work_order(
                    "E103",
                    &wo.id,
                    format!("postcondition path `{}` is not in allowed_files", post.path),
                ));
            }
            covered.insert(post.path.as_str());
        }
        for path in &allowed {
            if !covered.contains(path) {
                errors.push(ValidationError::for_work_order(
                    "E104",
                    &wo.id,
                    format!("`{path}` in allowed_files has no postcondition"),
                ));
            }
        }

        // E101: every precondition must be satisfied by the cumulative
        // state immediately before this WO.
        for pre in &wo.preconditions {
            let want_present = matches!(pre.kind, ConditionKind::FileExists);
            let actual = state.exists(&pre.path).unwrap_or(false);
            if actual != want_present {
                errors.push(ValidationError::for_work_order(
                    "E101",
                    &wo.id,
                    format!(
                        "precondition `{:?}({})` not satisfied by cumulative state",
                        pre.kind, pre.path
                    ),
                ));
            }
        }

        // E105: no acceptance command may equal the global verify command.
        if let Some(contract) = &manifest.verify_contract {
            let verify_norm = safety::normalize_command_for_comparison(&contract.command);
            for cmd in &wo.acceptance_commands {
                if safety::normalize_command_for_comparison(&cmd.command) == verify_norm
                    && verify_norm.is_some()
                {
                    errors.push(ValidationError::for_work_order(
                        "E105",
                        &wo.id,
                        "acceptance command duplicates the global verify command",
                    ));
                }
            }
        }

        // W101: warn when an acceptance command imports a module whose
        // source file doesn't yet appear in cumulative state.
        for cmd in &wo.acceptance_commands {
            for module in extract_imports(&cmd.command) {
                if !module_resolves(&module, &state) {
                    errors.push(ValidationError::for_work_order(
                        "W101",
                        &wo.id,
                        format!("module `{module}` not importable from cumulative file state"),
                    ));
                }
            }
        }

        state.apply_postconditions(&wo.postconditions);
    }

    // E106: every verify_contract requirement must eventually be satisfied.
    if let Some(contract) = &manifest.verify_contract {
        for req in &contract.requires {
            let want_present = matches!(req.kind, ConditionKind::FileExists);
            let actual = state.exists(&req.path).unwrap_or(false);
            if actual != want_present {
                errors.push(ValidationError::new(
                    "E106",
                    format!(
                        "verify_contract requirement `{:?}({})` never satisfied",
                        req.kind, req.path
                    ),
                ));
            }
        }
    }

    errors
}

/// Best-effort scrape of `import a.b.c` / `from a.b import c` statements
/// out of a `python -c "..."` style acceptance command.
fn extract_imports(command: &str) -> Vec<String> {
    static IMPORT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?:^|\n)\s*(?:import|from)\s+([\w.]+)").unwrap());
    IMPORT_RE
        .captures_iter(command)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// A module `a.b.c` resolves to any of `a/b/c.py`, `a/b/c/__init__.py`.
fn module_resolves(module: &str, state: &FileState) -> bool {
    let as_path = module.replace('.', "/");
    state.exists(&format!("{as_path}.py")).unwrap_or(false)
        || state.exists(&format!("{as_path}/__init__.py")).unwrap_or(false)
}

/// Compute `verify_exempt` for `wo`: `true` iff, immediately before
/// executing it, the manifest's `verify_contract` requirements are not yet
/// fully satisfied by `state_before`.
pub fn compute_verify_exempt(
    verify_contract_requires: Option<&[Condition]>,
    state_before: &FileState,
) -> bool {
    match verify_contract_requires {
        None => false,
        Some(requires) => requires.iter().any(|req| {
            let want_present = matches!(req.kind, ConditionKind::FileExists);
            state_before.exists(&req.path).unwrap_or(false) != want_present
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_types::{CommandSpec, VerifyContract};

    fn wo(id: &str, allowed: &[&str], posts: &[(&str, ConditionKind)]) -> WorkOrder {
        WorkOrder {
            id: id.to_string(),
            title: "t".to_string(),
            intent: "i".to_string(),
            allowed_files: allowed.iter().map(|s| s.to_string()).collect(),
            forbidden: vec![],
            acceptance_commands: vec![CommandSpec {
                command: "true".to_string(),
                shell: false,
                timeout_sec: 60,
            }],
            context_files: vec![],
            preconditions: vec![],
            postconditions: posts
                .iter()
                .map(|(p, k)| Condition { kind: *k, path: p.to_string() })
                .collect(),
            verify_exempt: false,
            notes: None,
            env: Default::default(),
        }
    }

    #[test]
    fn detects_noncontiguous_id() {
        let manifest = Manifest {
            manifest_version: "1".to_string(),
            compile_hash: "abc".to_string(),
            model: "m".to_string(),
            reasoning_effort: "medium".to_string(),
            system_overview: vec![],
            verify_contract: None,
            work_orders: vec![wo("WO-02", &["a.txt"], &[("a.txt", ConditionKind::FileExists)])],
        };
        let errors = validate_manifest(&manifest, &FileState::default());
        assert!(errors.iter().any(|e| e.code == "E001"));
    }

    #[test]
    fn detects_missing_postcondition_coverage() {
        let w = wo("WO-01", &["a.txt", "b.txt"], &[("a.txt", ConditionKind::FileExists)]);
        let manifest = Manifest {
            manifest_version: "1".to_string(),
            compile_hash: "abc".to_string(),
            model: "m".to_string(),
            reasoning_effort: "medium".to_string(),
            system_overview: vec![],
            verify_contract: None,
            work_orders: vec![w],
        };
        let errors = validate_manifest(&manifest, &FileState::default());
        assert!(errors.iter().any(|e| e.code == "E104"));
    }

    #[test]
    fn detects_unsatisfied_precondition_chain() {
        let mut w = wo("WO-01", &["a.txt"], &[("a.txt", ConditionKind::FileExists)]);
        w.preconditions.push(Condition {
            kind: ConditionKind::FileExists,
            path: "missing.py".to_string(),
        });
        let manifest = Manifest {
            manifest_version: "1".to_string(),
            compile_hash: "abc".to_string(),
            model: "m".to_string(),
            reasoning_effort: "medium".to_string(),
            system_overview: vec![],
            verify_contract: None,
            work_orders: vec![w],
        };
        let errors = validate_manifest(&manifest, &FileState::default());
        assert!(errors.iter().any(|e| e.code == "E101"));
    }

    #[test]
    fn verify_exempt_true_when_requirements_unmet() {
        let requires = vec![Condition {
            kind: ConditionKind::FileExists,
            path: "scripts/verify.sh".to_string(),
        }];
        let exempt = compute_verify_exempt(Some(&requires), &FileState::default());
        assert!(exempt);
    }

    #[test]
    fn verify_exempt_false_once_requirements_met() {
        let requires = vec![Condition {
            kind: ConditionKind::FileExists,
            path: "scripts/verify.sh".to_string(),
        }];
        let mut state = FileState::default();
        state.apply_postconditions(&requires);
        let exempt = compute_verify_exempt(Some(&requires), &state);
        assert!(!exempt);
    }

    #[test]
    fn e105_flags_duplicate_acceptance_command_regardless_of_whitespace() {
        let mut w = wo("WO-01", &["a.txt"], &[("a.txt", ConditionKind::FileExists)]);
        w.acceptance_commands = vec![CommandSpec {
            command: "bash  ./scripts/verify.sh".to_string(),
            shell: false,
            timeout_sec: 60,
        }];
        let manifest = Manifest {
            manifest_version: "1".to_string(),
            compile_hash: "abc".to_string(),
            model: "m".to_string(),
            reasoning_effort: "medium".to_string(),
            system_overview: vec![],
            verify_contract: None,
            work_orders: vec![w],
        }
        .with_verify_contract(VerifyContract {
            command: "bash scripts/verify.sh".to_string(),
            requires: vec![],
        });
        let errors = validate_manifest(&manifest, &FileState::default());
        assert!(errors.iter().any(|e| e.code == "E105"));
    }

    #[test]
    fn contradictory_preconditions_flagged() {
        let mut w = wo("WO-01", &["a.txt"], &[("a.txt", ConditionKind::FileExists)]);
        w.preconditions = vec![
            Condition { kind: ConditionKind::FileExists, path: "x.txt".to_string() },
            Condition { kind: ConditionKind::FileAbsent, path: "x.txt".to_string() },
        ];
        let errors = validate_structural(&w, 0);
        assert!(errors.iter().any(|e| e.code == "E102"));
    }
}
