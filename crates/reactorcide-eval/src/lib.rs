//! Event evaluator (C11): parses YAML job definitions from a trusted tree,
//! matches them against a VCS event, and synthesizes trigger records.
//!
//! Glob semantics (branches and paths) are segment-aware: `*`/`?` never
//! cross a `/`, `**` matches zero or more whole segments. This is exactly
//! `globset`'s gitignore-style matching with `literal_separator` enabled.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use globset::GlobBuilder;
use reactorcide_log::Logger;
use reactorcide_types::{EventContext, EvalError, JobDefinition, JobTrigger, SourceType};

/// Runner CLI name used to wrap synthesized job commands, unless the
/// definition opts out with `raw_command: true` or the command is already
/// wrapped.
pub const RUNNER_CLI: &str = "runnerlib";

/// Loads every `*.yml`/`*.yaml` file directly under
/// `<trusted_tree>/.reactorcide/jobs`, sorted by filename. A missing jobs
/// directory yields an empty list. Entries that aren't a mapping with a
/// non-empty `name` are skipped with a logged warning rather than failing
/// the whole load.
pub fn load_job_definitions(trusted_tree: &Path, logger: &Logger) -> Result<Vec<JobDefinition>, EvalError> {
    let jobs_dir = trusted_tree.join(".reactorcide").join("jobs");
    if !jobs_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&jobs_dir)
        .map_err(|e| EvalError::MalformedDefinition {
            file: jobs_dir.display().to_string(),
            message: e.to_string(),
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yml") | Some("yaml")))
        .collect();
    paths.sort();

    let mut definitions = Vec::new();
    for path in paths {
        let file = path.display().to_string();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                let reason = e.to_string();
                logger.warn(
                    "eval",
                    "failed to read job definition, skipping",
                    &[("file", &file), ("reason", &reason)],
                );
                continue;
            }
        };

        match serde_yaml::from_str::<JobDefinition>(&contents) {
            Ok(mut def) if !def.name.trim().is_empty() => {
                def.source_file = path;
                definitions.push(def);
            }
            Ok(_) => {
                logger.warn("eval", "job definition has empty name, skipping", &[("file", &file)]);
            }
            Err(e) => {
                let reason = e.to_string();
                logger.warn(
                    "eval",
                    "malformed job definition, skipping",
                    &[("file", &file), ("reason", &reason)],
                );
            }
        }
    }

    Ok(definitions)
}

/// Computes the changed-file set for path filtering (§4.11 step 3):
/// pull-request events diff against `origin/<pr_base_ref>..HEAD`; everything
/// else diffs `HEAD^..HEAD`. Any failure — no repo, first commit, missing
/// base — is swallowed; callers see `None` and simply skip path filtering.
pub fn compute_changed_files(source_dir: &Path, event: &EventContext) -> Option<Vec<String>> {
    let (from, to) = if event.event_type.is_pull_request() {
        (format!("origin/{}", event.pr_base_ref.as_deref()?), "HEAD".to_string())
    } else {
        ("HEAD^".to_string(), "HEAD".to_string())
    };

    let output = Command::new("git")
        .args(["diff", "--name-only", &from, &to])
        .current_dir(source_dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    Some(String::from_utf8_lossy(&output.stdout).lines().map(str::to_string).collect())
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher().is_match(candidate))
        .unwrap_or(false)
}

fn branch_matches(def: &JobDefinition, branch: Option<&str>) -> bool {
    if def.triggers.branches.is_empty() {
        return true;
    }
    match branch {
        Some(branch) => def.triggers.branches.iter().any(|pattern| glob_matches(pattern, branch)),
        None => false,
    }
}

fn paths_match(def: &JobDefinition, changed_files: Option<&[String]>) -> bool {
    if def.paths.include.is_empty() && def.paths.exclude.is_empty() {
        return true;
    }
    let Some(changed_files) = changed_files else {
        return true;
    };
    changed_files.iter().any(|file| {
        let included = def.paths.include.is_empty() || def.paths.include.iter().any(|p| glob_matches(p, file));
        let excluded = def.paths.exclude.iter().any(|p| glob_matches(p, file));
        included && !excluded
    })
}

/// Whether `def` matches `event`, per §4.11 step 4.
pub fn definition_matches(def: &JobDefinition, event: &EventContext, changed_files: Option<&[String]>) -> bool {
    def.triggers.events.contains(&event.event_type)
        && branch_matches(def, event.branch.as_deref())
        && paths_match(def, changed_files)
}

fn event_derived_env(event: &EventContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("REACTORCIDE_EVENT_TYPE".to_string(), event.event_type.as_str().to_string());
    if let Some(v) = &event.branch {
        env.insert("REACTORCIDE_BRANCH".to_string(), v.clone());
    }
    if let Some(v) = &event.source_ref {
        env.insert("REACTORCIDE_SHA".to_string(), v.clone());
    }
    if let Some(v) = &event.source_url {
        env.insert("REACTORCIDE_SOURCE_URL".to_string(), v.clone());
    }
    if let Some(v) = &event.pr_base_ref {
        env.insert("REACTORCIDE_PR_BASE_REF".to_string(), v.clone());
    }
    if let Some(v) = event.pr_number {
        env.insert("REACTORCIDE_PR_NUMBER".to_string(), v.to_string());
    }
    if let Some(v) = &event.ci_source_url {
        env.insert("REACTORCIDE_CI_SOURCE_URL".to_string(), v.clone());
    }
    if let Some(v) = &event.ci_source_ref {
        env.insert("REACTORCIDE_CI_SOURCE_REF".to_string(), v.clone());
    }
    env
}

fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Wraps `command` with the runner CLI unless `raw` is set or the command
/// already invokes it.
fn wrap_command(command: &str, raw: bool) -> String {
    if raw || command.trim_start().starts_with(RUNNER_CLI) {
        command.to_string()
    } else {
        format!("{RUNNER_CLI} run --job-command {}", shell_single_quote(command))
    }
}

/// Synthesizes the `JobTrigger` for a matched definition (§4.11 step 5).
pub fn synthesize_trigger(def: &JobDefinition, event: &EventContext) -> JobTrigger {
    let mut env = def.environment.clone();
    env.extend(event_derived_env(event));

    let mut trigger = JobTrigger::new(def.name.clone());
    trigger.env = env;
    trigger.container_image = def.job.image.clone();
    trigger.priority = def.job.priority;
    trigger.timeout = def.job.timeout;
    trigger.job_command = def
        .job
        .command
        .as_deref()
        .map(|cmd| wrap_command(cmd, def.job.raw_command.unwrap_or(false)));

    if let Some(url) = &event.source_url {
        trigger.source_type = Some(SourceType::Git);
        trigger.source_url = Some(url.clone());
        trigger.source_ref = event.source_ref.clone();
    }
    if let Some(url) = &event.ci_source_url {
        trigger.ci_source_type = Some(SourceType::Git);
        trigger.ci_source_url = Some(url.clone());
        trigger.ci_source_ref = event.ci_source_ref.clone();
    }

    trigger
}

/// Runs C11 end-to-end: loads definitions from `trusted_tree`, computes a
/// changed-file set from `source_dir` when `changed_files` isn't supplied,
/// matches every definition against `event`, and returns the synthesized
/// triggers in definition-file order.
pub fn evaluate(
    trusted_tree: &Path,
    source_dir: &Path,
    event: &EventContext,
    changed_files: Option<Vec<String>>,
    logger: &Logger,
) -> Result<Vec<JobTrigger>, EvalError> {
    let definitions = load_job_definitions(trusted_tree, logger)?;
    let changed = changed_files.or_else(|| compute_changed_files(source_dir, event));

    Ok(definitions
        .iter()
        .filter(|def| definition_matches(def, event, changed.as_deref()))
        .map(|def| synthesize_trigger(def, event))
        .collect())
}
