//! Plan compiler: render the prompt, invoke the LLM, validate the
//! returned manifest, and retry with structured error feedback until the
//! plan is valid or the attempt budget is exhausted.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use harness_types::{FileState, Manifest, ValidationError};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::planvalidate;
use crate::safety;

pub const MAX_COMPILE_ATTEMPTS: u32 = 3;
const PRODUCT_SPEC_PLACEHOLDER: &str = "{{PRODUCT_SPEC}}";
const DOCTRINE_PLACEHOLDER: &str = "{{DOCTRINE}}";
const REPO_HINTS_PLACEHOLDER: &str = "{{REPO_HINTS}}";

/// Compute the content-addressed compile hash: first 16 hex digits of
/// SHA-256(spec‖"\n"‖template‖"\n"‖model‖"\n"‖effort).
pub fn compute_compile_hash(spec: &str, template: &str, model: &str, effort: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.as_bytes());
    hasher.update(b"\n");
    hasher.update(template.as_bytes());
    hasher.update(b"\n");
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(effort.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Render the prompt template, substituting the required `{{PRODUCT_SPEC}}`
/// and nulling out the optional `{{DOCTRINE}}`/`{{REPO_HINTS}}` placeholders.
pub fn render_template(template: &str, spec: &str) -> Result<String> {
    if !template.contains(PRODUCT_SPEC_PLACEHOLDER) {
        bail!("template is missing required {{{{PRODUCT_SPEC}}}} placeholder");
    }
    let rendered = template.replace(PRODUCT_SPEC_PLACEHOLDER, spec);
    let rendered = rendered.replace(DOCTRINE_PLACEHOLDER, "");
    let rendered = rendered.replace(REPO_HINTS_PLACEHOLDER, "");
    Ok(rendered)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptEvent {
    pub attempt_index: u32,
    pub phase: &'static str,
    pub error_excerpt: Option<String>,
    pub artifact_path: Option<String>,
}

pub struct CompileOptions {
    pub spec_path: PathBuf,
    pub template_path: PathBuf,
    pub outdir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub model: String,
    pub reasoning_effort: String,
    pub overwrite: bool,
}

#[derive(Debug, Serialize)]
pub struct CompileSummary {
    pub compile_hash: String,
    pub attempts: u32,
    pub outcome: &'static str,
}

/// Run the full compile attempt loop, emitting prompt/response/validation
/// artifacts per attempt and the final manifest files on success.
pub fn compile(
    opts: &CompileOptions,
    client: &LlmClient,
    mut on_event: impl FnMut(AttemptEvent),
) -> Result<CompileSummary> {
    let spec = fs::read_to_string(&opts.spec_path)
        .with_context(|| format!("failed to read spec at {}", opts.spec_path.display()))?;
    let template = fs::read_to_string(&opts.template_path)
        .with_context(|| format!("failed to read template at {}", opts.template_path.display()))?;

    let compile_hash = compute_compile_hash(&spec, &template, &opts.model, &opts.reasoning_effort);
    let artifact_dir = opts.artifacts_dir.join(&compile_hash).join("compile");
    fs::create_dir_all(&artifact_dir)
        .with_context(|| format!("failed to create artifact dir {}", artifact_dir.display()))?;

    check_overwrite_policy(&opts.outdir, opts.overwrite)?;

    let mut prompt = render_template(&template, &spec)?;
    let mut previous_response: Option<String> = None;

    for attempt in 1..=MAX_COMPILE_ATTEMPTS {
        on_event(AttemptEvent {
            attempt_index: attempt,
            phase: "start",
            error_excerpt: None,
            artifact_path: None,
        });

        let prompt_path = artifact_dir.join(format!("prompt_attempt_{attempt}.txt"));
        fs::write(&prompt_path, &prompt)
            .with_context(|| format!("failed to write {}", prompt_path.display()))?;

        let request = LlmRequest {
            reasoning_effort: Some(opts.reasoning_effort.clone()),
            ..LlmRequest::new(opts.model.clone(), prompt.clone())
        };
        let response = client.submit(&request)?;
        let raw_text = response
            .extract_text()
            .context("LLM response had no extractable output text")?;

        let raw_path = artifact_dir.join(format!("llm_raw_response_attempt_{attempt}.txt"));
        fs::write(&raw_path, &raw_text)
            .with_context(|| format!("failed to write {}", raw_path.display()))?;

        match parse_and_validate(&raw_text, &opts.model, &opts.reasoning_effort, &compile_hash) {
            Ok(manifest) => {
                finalize_manifest(&opts.outdir, &manifest)?;
                on_event(AttemptEvent {
                    attempt_index: attempt,
                    phase: "pass",
                    error_excerpt: None,
                    artifact_path: Some(opts.outdir.display().to_string()),
                });
                write_summary(&artifact_dir, &compile_hash, attempt, "pass")?;
                return Ok(CompileSummary { compile_hash, attempts: attempt, outcome: "pass" });
            }
            Err(errors) => {
                let errors_path = artifact_dir.join(format!("validation_errors_attempt_{attempt}.json"));
                let errors_json = serde_json::to_string_pretty(&errors)?;
                fs::write(&errors_path, &errors_json)
                    .with_context(|| format!("failed to write {}", errors_path.display()))?;

                let excerpt = errors
                    .first()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default();
                let is_final = attempt == MAX_COMPILE_ATTEMPTS;
                on_event(AttemptEvent {
                    attempt_index: attempt,
                    phase: if is_final { "FAIL" } else { "fail" },
                    error_excerpt: Some(excerpt),
                    artifact_path: Some(errors_path.display().to_string()),
                });

                if is_final {
                    write_summary(&artifact_dir, &compile_hash, attempt, "fail")?;
                    bail!(
                        "plan compilation failed after {attempt} attempts: {} error(s), first: {}",
                        errors.len(),
                        errors.first().map(|e| e.message.clone()).unwrap_or_default()
                    );
                }

                prompt = build_revision_prompt(&spec, &errors, previous_response.as_deref().unwrap_or(&raw_text));
                previous_response = Some(raw_text);
            }
        }
    }

    unreachable!("loop always returns or bails by the final attempt")
}

fn check_overwrite_policy(outdir: &Path, overwrite: bool) -> Result<()> {
    if !outdir.exists() {
        return Ok(());
    }
    let existing: Vec<PathBuf> = fs::read_dir(outdir)
        .with_context(|| format!("failed to read {}", outdir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_plan_artifact(p))
        .collect();

    if existing.is_empty() {
        return Ok(());
    }
    if !overwrite {
        bail!(
            "{} already contains plan artifacts ({} file(s)); pass --overwrite to replace them",
            outdir.display(),
            existing.len()
        );
    }
    for path in existing {
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn is_plan_artifact(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    (name.starts_with("WO-") && name.ends_with(".json")) || name == "WORK_ORDERS_MANIFEST.json"
}

fn parse_and_validate(
    raw_text: &str,
    model: &str,
    reasoning_effort: &str,
    compile_hash: &str,
) -> Result<Manifest, Vec<ValidationError>> {
    let stripped = safety::strip_markdown_fences(raw_text);
    safety::guard_payload_size(stripped.as_bytes())
        .map_err(|_| vec![ValidationError::new("E000", "JSON parse error: payload too large")])?;

    let value: serde_json::Value = serde_json::from_str(&stripped)
        .map_err(|e| vec![ValidationError::new("E000", format!("JSON parse error: {e}"))])?;

    let mut manifest: Manifest = serde_json::from_value(value)
        .map_err(|e| vec![ValidationError::new("E000", format!("JSON parse error: {e}"))])?;

    manifest.model = model.to_string();
    manifest.reasoning_effort = reasoning_effort.to_string();
    manifest.compile_hash = compile_hash.to_string();

    let errors = planvalidate::validate_manifest(&manifest, &FileState::default());
    let hard_errors: Vec<ValidationError> =
        errors.into_iter().filter(|e| !e.is_warning()).collect();
    if !hard_errors.is_empty() {
        return Err(hard_errors);
    }

    stamp_verify_exempt(&mut manifest);
    Ok(manifest)
}

/// The compiler always overwrites any LLM-supplied `verify_exempt`,
/// computing it from cumulative state per WO.
fn stamp_verify_exempt(manifest: &mut Manifest) {
    let mut state = FileState::default();
    let requires = manifest.verify_contract.as_ref().map(|c| c.requires.clone());
    for wo in &mut manifest.work_orders {
        wo.verify_exempt = planvalidate::compute_verify_exempt(requires.as_deref(), &state);
        state.apply_postconditions(&wo.postconditions);
    }
}

fn build_revision_prompt(spec: &str, errors: &[ValidationError], previous_response: &str) -> String {
    let errors_block = errors
        .iter()
        .map(|e| format!("[{}] {}{}", e.code, e.message, e.work_order_id.as_ref().map(|id| format!(" (work order {id})")).unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Your previous response failed validation with the following errors:\n\n{errors_block}\n\n\
         Your previous response was:\n\n{previous_response}\n\n\
         The original product specification was:\n\n{spec}\n\n\
         Correct the errors above and return a complete, valid manifest JSON object."
    )
}

fn finalize_manifest(outdir: &Path, manifest: &Manifest) -> Result<()> {
    fs::create_dir_all(outdir).with_context(|| format!("failed to create {}", outdir.display()))?;
    for wo in &manifest.work_orders {
        let path = outdir.join(format!("{}.json", wo.id));
        write_json_atomic(&path, wo)?;
    }
    let manifest_path = outdir.join("WORK_ORDERS_MANIFEST.json");
    write_json_atomic(&manifest_path, manifest)?;
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut json = serde_json::to_string_pretty(value).context("failed to serialize JSON")?;
    json.push('\n');
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        use std::io::Write;
        f.write_all(json.as_bytes())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

fn write_summary(artifact_dir: &Path, compile_hash: &str, attempts: u32, outcome: &'static str) -> Result<()> {
    let summary = CompileSummary { compile_hash: compile_hash.to_string(), attempts, outcome };
    write_json_atomic(&artifact_dir.join("compile_summary.json"), &summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_hash_is_deterministic() {
        let h1 = compute_compile_hash("spec", "template", "gpt-5", "medium");
        let h2 = compute_compile_hash("spec", "template", "gpt-5", "medium");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn compile_hash_changes_with_inputs() {
        let h1 = compute_compile_hash("spec", "template", "gpt-5", "medium");
        let h2 = compute_compile_hash("spec2", "template", "gpt-5", "medium");
        assert_ne!(h1, h2);
    }

    #[test]
    fn render_template_requires_product_spec_placeholder() {
        let err = render_template("no placeholder here", "spec").unwrap_err();
        assert!(err.to_string().contains("PRODUCT_SPEC"));
    }

    #[test]
    fn render_template_nulls_optional_placeholders() {
        let out = render_template("{{PRODUCT_SPEC}} {{DOCTRINE}} {{REPO_HINTS}}", "SPEC").unwrap();
        assert_eq!(out, "SPEC  ");
    }

    #[test]
    fn is_plan_artifact_matches_wo_and_manifest() {
        assert!(is_plan_artifact(Path::new("/tmp/WO-01.json")));
        assert!(is_plan_artifact(Path::new("/tmp/WORK_ORDERS_MANIFEST.json")));
        assert!(!is_plan_artifact(Path::new("/tmp/README.md")));
    }
}
