//! Config resolver (C1): merges defaults, process environment, and caller
//! overrides into an immutable [`JobDescriptor`], and parses the inline or
//! file-backed `KEY=value` env blocks used by `job_env` and `secrets_list`.
//!
//! Precedence is strict: `defaults < REACTORCIDE_* environment < overrides`.
//! Every `REACTORCIDE_*` variable name is fixed per field (see
//! [`ENV_VAR_NAMES`]) so the mapping is stable across releases.

use std::collections::BTreeMap;
use std::path::Path;

use reactorcide_types::{ConfigError, JobDescriptor, SourceType};

/// Default `code_dir` when nothing else sets one.
pub const DEFAULT_CODE_DIR: &str = "/job/src";
/// Default `runner_image` when nothing else sets one.
pub const DEFAULT_RUNNER_IMAGE: &str = "quay.io/catalystcommunity/reactorcide_runner";

/// A workspace-relative path marker. `job_env`/`secrets_list` values that
/// start with one of these are treated as a file path instead of inline
/// text; anything else is inline.
pub const WORKSPACE_PATH_PREFIXES: [&str; 2] = ["/job/", "./job/"];

/// Caller-supplied overrides, highest precedence in [`resolve`]. Every
/// field `None` means "let defaults/environment decide"; for string fields
/// that includes `secrets_list`, where `Some(String::new())` is distinct
/// from `None` (see [`reactorcide_types::JobDescriptor::secrets_list`]).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub code_dir: Option<String>,
    pub job_dir: Option<String>,
    pub job_command: Option<String>,
    pub runner_image: Option<String>,
    pub job_env: Option<String>,
    pub secrets_list: Option<String>,
    pub secrets_file: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
    pub source_ref: Option<String>,
    pub ci_source_type: Option<SourceType>,
    pub ci_source_url: Option<String>,
    pub ci_source_ref: Option<String>,
    pub dry_run: Option<bool>,
    pub container: Option<bool>,
}

/// `field name -> REACTORCIDE_<NAME>` mapping, in the fixed order the spec
/// documents them.
pub const ENV_VAR_NAMES: &[(&str, &str)] = &[
    ("code_dir", "REACTORCIDE_CODE_DIR"),
    ("job_dir", "REACTORCIDE_JOB_DIR"),
    ("job_command", "REACTORCIDE_JOB_COMMAND"),
    ("runner_image", "REACTORCIDE_RUNNER_IMAGE"),
    ("job_env", "REACTORCIDE_JOB_ENV"),
    ("secrets_list", "REACTORCIDE_SECRETS_LIST"),
    ("secrets_file", "REACTORCIDE_SECRETS_FILE"),
    ("source_type", "REACTORCIDE_SOURCE_TYPE"),
    ("source_url", "REACTORCIDE_SOURCE_URL"),
    ("source_ref", "REACTORCIDE_SOURCE_REF"),
    ("ci_source_type", "REACTORCIDE_CI_SOURCE_TYPE"),
    ("ci_source_url", "REACTORCIDE_CI_SOURCE_URL"),
    ("ci_source_ref", "REACTORCIDE_CI_SOURCE_REF"),
];

/// Resolves a [`JobDescriptor`] from defaults, the process environment, and
/// `overrides`, in that precedence order. Fails with one composite
/// [`ConfigError::MissingRequired`] listing every still-empty required
/// field name.
pub fn resolve(overrides: Overrides) -> Result<JobDescriptor, ConfigError> {
    resolve_from_env(overrides, &std::env::vars().collect())
}

/// Same as [`resolve`] but reads the environment from a supplied map
/// instead of the real process environment, so tests don't need
/// `#[serial]` env-mutation.
pub fn resolve_from_env(
    overrides: Overrides,
    env: &BTreeMap<String, String>,
) -> Result<JobDescriptor, ConfigError> {
    let get = |name: &str| env.get(name).cloned();

    let mut code_dir = get("REACTORCIDE_CODE_DIR").unwrap_or_else(|| DEFAULT_CODE_DIR.to_string());
    let mut job_dir = get("REACTORCIDE_JOB_DIR").unwrap_or_default();
    let mut job_command = get("REACTORCIDE_JOB_COMMAND").unwrap_or_default();
    let mut runner_image =
        get("REACTORCIDE_RUNNER_IMAGE").unwrap_or_else(|| DEFAULT_RUNNER_IMAGE.to_string());
    let mut job_env = get("REACTORCIDE_JOB_ENV");
    let mut secrets_list = get("REACTORCIDE_SECRETS_LIST");
    let mut secrets_file = get("REACTORCIDE_SECRETS_FILE");
    let mut source_type = get("REACTORCIDE_SOURCE_TYPE").and_then(|s| s.parse().ok());
    let mut source_url = get("REACTORCIDE_SOURCE_URL");
    let mut source_ref = get("REACTORCIDE_SOURCE_REF");
    let mut ci_source_type = get("REACTORCIDE_CI_SOURCE_TYPE").and_then(|s| s.parse().ok());
    let mut ci_source_url = get("REACTORCIDE_CI_SOURCE_URL");
    let mut ci_source_ref = get("REACTORCIDE_CI_SOURCE_REF");

    if let Some(v) = overrides.code_dir {
        code_dir = v;
    }
    if let Some(v) = overrides.job_dir {
        job_dir = v;
    }
    if let Some(v) = overrides.job_command {
        job_command = v;
    }
    if let Some(v) = overrides.runner_image {
        runner_image = v;
    }
    if overrides.job_env.is_some() {
        job_env = overrides.job_env;
    }
    if overrides.secrets_list.is_some() {
        secrets_list = overrides.secrets_list;
    }
    if let Some(v) = overrides.secrets_file {
        secrets_file = Some(v);
    }
    if let Some(v) = overrides.source_type {
        source_type = Some(v);
    }
    if let Some(v) = overrides.source_url {
        source_url = Some(v);
    }
    if let Some(v) = overrides.source_ref {
        source_ref = Some(v);
    }
    if let Some(v) = overrides.ci_source_type {
        ci_source_type = Some(v);
    }
    if let Some(v) = overrides.ci_source_url {
        ci_source_url = Some(v);
    }
    if let Some(v) = overrides.ci_source_ref {
        ci_source_ref = Some(v);
    }

    if job_dir.is_empty() {
        job_dir = code_dir.clone();
    }

    let descriptor = JobDescriptor {
        code_dir,
        job_dir,
        job_command,
        runner_image,
        job_env,
        secrets_list,
        secrets_file,
        source_type: source_type.unwrap_or_default(),
        source_url,
        source_ref,
        ci_source_type: ci_source_type.unwrap_or_default(),
        ci_source_url,
        ci_source_ref,
        dry_run: overrides.dry_run.unwrap_or(false),
        container: overrides.container.unwrap_or(false),
    };

    let missing = descriptor.missing_required_fields();
    if !missing.is_empty() {
        return Err(ConfigError::MissingRequired(missing.join(", ")));
    }

    Ok(descriptor)
}

/// True if `s` looks like a workspace-relative path rather than inline
/// `KEY=value` text (see [`WORKSPACE_PATH_PREFIXES`]).
pub fn looks_like_workspace_path(s: &str) -> bool {
    WORKSPACE_PATH_PREFIXES.iter().any(|p| s.starts_with(p))
}

/// Rejects `..` traversal and anything outside the recognized workspace
/// prefixes.
fn validate_workspace_path(s: &str) -> Result<(), ConfigError> {
    if s.contains("..") {
        return Err(ConfigError::UnsafePath(s.to_string()));
    }
    if !looks_like_workspace_path(s) {
        return Err(ConfigError::UnsafePath(s.to_string()));
    }
    Ok(())
}

/// Maps a `/job/...` or `./job/...` container-relative path onto a host
/// path rooted at `workspace_root`.
fn to_host_path(workspace_root: &Path, workspace_relative: &str) -> std::path::PathBuf {
    let stripped = workspace_relative
        .trim_start_matches("./job/")
        .trim_start_matches("/job/");
    workspace_root.join(stripped)
}

/// Parses a `KEY=value` block: trims lines, skips blanks and `#`-comments,
/// splits on the first `=`. Fails on an empty key or a line without `=`.
pub fn parse_env_text(text: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut out = BTreeMap::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::InvalidEnvBlock(format!(
                "missing '=' in line: {line}"
            )));
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidEnvBlock(format!(
                "empty key in line: {line}"
            )));
        }
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

/// Parses `source` as either inline `KEY=value` text or, if it looks like a
/// workspace path, reads that file (resolved against `workspace_root`) and
/// parses its contents. Empty input yields an empty map.
pub fn parse_env(
    source: &str,
    workspace_root: &Path,
) -> Result<BTreeMap<String, String>, ConfigError> {
    if source.is_empty() {
        return Ok(BTreeMap::new());
    }
    if looks_like_workspace_path(source) {
        validate_workspace_path(source)?;
        let path = to_host_path(workspace_root, source);
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::InvalidEnvBlock(format!("{}: {e}", path.display())))?;
        parse_env_text(&contents)
    } else {
        parse_env_text(source)
    }
}

/// Formats an env map back into the `KEY=value` block shape `parse_env_text`
/// accepts, for round-trip tests and for writing secrets files.
pub fn format_env(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolves the effective list of secret values to mask, mirroring the
/// reference implementation's two-mode behavior: `None` means "the caller
/// hasn't specified a list, fall back to masking every non-`REACTORCIDE_*`
/// env value" (the default the caller applies separately); `Some(s)` is a
/// resolved, comma-split-or-file-read list, including the empty vector for
/// an explicit empty string (which disables the default entirely).
pub fn resolve_secrets_list(
    secrets_list: Option<&str>,
    workspace_root: &Path,
) -> Result<Option<Vec<String>>, ConfigError> {
    let Some(source) = secrets_list else {
        return Ok(None);
    };
    if source.is_empty() {
        return Ok(Some(Vec::new()));
    }
    if looks_like_workspace_path(source) {
        validate_workspace_path(source)?;
        let path = to_host_path(workspace_root, source);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::InvalidEnvBlock(format!("{}: {e}", path.display())))?;
            return Ok(Some(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect(),
            ));
        }
    }
    Ok(Some(
        source
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    ))
}

/// Projects the descriptor's `REACTORCIDE_*` fields and the parsed
/// `job_env` block into one container-environment map. The raw
/// `REACTORCIDE_JOB_ENV` block itself is never included — only its parsed
/// pairs are, via `parsed_job_env` — to avoid double interpretation.
pub fn to_container_env(
    descriptor: &JobDescriptor,
    parsed_job_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = descriptor.reactorcide_env();
    env.extend(parsed_job_env.clone());
    env
}
