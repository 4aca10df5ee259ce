//! Pre-flight validation (C8): checks a resolved [`JobDescriptor`] for
//! required fields, path sanity, job-environment hygiene, container image
//! naming, and (optionally) filesystem and container-runtime availability,
//! before anything is launched.
//!
//! Validation never mutates state; [`validate`] is safe to call as many
//! times as a caller likes, including from the CLI's standalone `validate`
//! subcommand.

use std::path::Path;

use reactorcide_types::{JobDescriptor, ValidationIssue, ValidationResult};

/// Controls the filesystem- and runtime-dependent checks, which the CLI's
/// `validate` subcommand can disable to get a pure static check.
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    /// Check that `workspace_root`/`code_dir` exist and are readable, and
    /// that referenced `job_env`/`secrets_list` files are present.
    pub check_files: bool,
    /// Require a container runtime (`docker`) on `PATH`.
    pub require_container_runtime: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            check_files: true,
            require_container_runtime: true,
        }
    }
}

/// Runs every check and returns the combined [`ValidationResult`].
pub fn validate(
    descriptor: &JobDescriptor,
    workspace_root: &Path,
    opts: &ValidateOptions,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    result.errors.extend(validate_required_fields(descriptor));
    result.errors.extend(validate_directory_paths(descriptor));

    let (env_errors, env_warnings) =
        validate_job_environment(descriptor, workspace_root, opts.check_files);
    result.errors.extend(env_errors);
    result.warnings.extend(env_warnings);

    result.warnings.extend(validate_container_image(descriptor));

    if opts.require_container_runtime {
        result.errors.extend(validate_external_dependencies());
    }

    if opts.check_files {
        let (fs_errors, fs_warnings) = validate_file_system(descriptor, workspace_root);
        result.errors.extend(fs_errors);
        result.warnings.extend(fs_warnings);
    }

    result.referenced_secrets = collect_referenced_secrets(descriptor, workspace_root);

    result
}

/// Scans the job command and (when parseable) the job environment for
/// `${secret:PATH:KEY}` references, without resolving any of them.
fn collect_referenced_secrets(descriptor: &JobDescriptor, workspace_root: &Path) -> Vec<String> {
    let mut scanned = std::collections::BTreeMap::new();
    scanned.insert("job_command".to_string(), descriptor.job_command.clone());
    if let Some(source) = &descriptor.job_env {
        if let Ok(env) = reactorcide_config::parse_env(source, workspace_root) {
            scanned.extend(env);
        }
    }
    reactorcide_secrets_ref::collect_refs(&scanned)
        .into_iter()
        .map(|r| r.raw)
        .collect()
}

fn validate_required_fields(descriptor: &JobDescriptor) -> Vec<ValidationIssue> {
    let field_hints: &[(&str, &str)] = &[
        ("job_command", "REACTORCIDE_JOB_COMMAND"),
        ("runner_image", "REACTORCIDE_RUNNER_IMAGE"),
        ("code_dir", "REACTORCIDE_CODE_DIR"),
        ("job_dir", "REACTORCIDE_JOB_DIR"),
    ];
    let missing = descriptor.missing_required_fields();
    field_hints
        .iter()
        .filter(|(field, _)| missing.contains(field))
        .map(|(field, env_var)| {
            ValidationIssue::new(*field, format!("{field} is required")).with_suggestion(format!(
                "set {env_var} or pass the corresponding CLI flag"
            ))
        })
        .collect()
}

fn validate_directory_paths(descriptor: &JobDescriptor) -> Vec<ValidationIssue> {
    let mut errors = Vec::new();
    for (field, value) in [
        ("code_dir", &descriptor.code_dir),
        ("job_dir", &descriptor.job_dir),
    ] {
        if value.is_empty() {
            continue;
        }
        if !value.starts_with('/') {
            errors.push(
                ValidationIssue::new(field, format!("{field} must be an absolute path: {value}"))
                    .with_suggestion("use paths like '/job/src' or '/job'"),
            );
        } else if !value.starts_with("/job") {
            errors.push(
                ValidationIssue::new(
                    field,
                    format!("{field} must be within the /job mount point: {value}"),
                )
                .with_suggestion("use paths starting with '/job/'"),
            );
        }
    }
    errors
}

fn validate_job_environment(
    descriptor: &JobDescriptor,
    workspace_root: &Path,
    check_files: bool,
) -> (Vec<ValidationIssue>, Vec<ValidationIssue>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let Some(source) = &descriptor.job_env else {
        return (errors, warnings);
    };

    if reactorcide_config::looks_like_workspace_path(source) {
        let host_path = reactorcide_source::container_path_to_host(source, workspace_root);
        if !host_path.exists() {
            if check_files {
                errors.push(
                    ValidationIssue::new(
                        "job_env",
                        format!("environment file not found: {}", host_path.display()),
                    )
                    .with_suggestion("ensure the file exists and the path starts with '/job/'"),
                );
            }
            return (errors, warnings);
        }
    }

    match reactorcide_config::parse_env(source, workspace_root) {
        Ok(env) => {
            for (key, value) in &env {
                if matches!(key.as_str(), "PATH" | "HOME" | "USER") {
                    warnings.push(
                        ValidationIssue::new(
                            "job_env",
                            format!("overriding system environment variable: {key}"),
                        )
                        .with_suggestion("consider a different variable name to avoid conflicts"),
                    );
                }
                if value.len() > 1000 {
                    warnings.push(
                        ValidationIssue::new(
                            "job_env",
                            format!(
                                "environment variable {key} has a very long value ({} chars)",
                                value.len()
                            ),
                        )
                        .with_suggestion("use a file or shorten the value"),
                    );
                }
            }
        }
        Err(e) => {
            errors.push(
                ValidationIssue::new("job_env", format!("invalid environment block: {e}"))
                    .with_suggestion("use 'KEY=value' lines or ensure the file contains valid pairs"),
            );
        }
    }

    (errors, warnings)
}

fn validate_container_image(descriptor: &JobDescriptor) -> Vec<ValidationIssue> {
    let mut warnings = Vec::new();
    let image = &descriptor.runner_image;
    if image.is_empty() {
        return warnings;
    }

    if image.contains(' ') {
        warnings.push(
            ValidationIssue::new("runner_image", format!("image name contains spaces: {image}"))
                .with_suggestion("ensure the image name is properly formatted"),
        );
    }

    if image.ends_with(":latest") || !image.contains(':') {
        warnings.push(
            ValidationIssue::new("runner_image", "using 'latest' tag or no tag specified")
                .with_suggestion("use a specific version tag for reproducible builds"),
        );
    }

    warnings
}

fn validate_external_dependencies() -> Vec<ValidationIssue> {
    let mut errors = Vec::new();
    if which::which("docker").is_err() {
        errors.push(
            ValidationIssue::new("system", "docker is not available in PATH")
                .with_suggestion("install docker: https://docs.docker.com/get-docker/"),
        );
    }
    errors
}

fn validate_file_system(
    descriptor: &JobDescriptor,
    workspace_root: &Path,
) -> (Vec<ValidationIssue>, Vec<ValidationIssue>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !workspace_root.exists() {
        warnings.push(
            ValidationIssue::new(
                "filesystem",
                format!("job directory {} does not exist", workspace_root.display()),
            )
            .with_suggestion("it will be created automatically"),
        );
    } else if !workspace_root.is_dir() {
        errors.push(
            ValidationIssue::new(
                "filesystem",
                format!("{} exists but is not a directory", workspace_root.display()),
            )
            .with_suggestion("remove the file and let the system create the directory"),
        );
    }

    if !descriptor.code_dir.is_empty() {
        let code_path = reactorcide_source::container_path_to_host(&descriptor.code_dir, workspace_root);
        if code_path.exists() {
            if !code_path.is_dir() {
                errors.push(
                    ValidationIssue::new(
                        "filesystem",
                        format!("code path exists but is not a directory: {}", code_path.display()),
                    )
                    .with_suggestion("remove the file and let the system create the directory"),
                );
            } else if std::fs::metadata(&code_path)
                .map(|m| m.permissions().readonly())
                .unwrap_or(false)
            {
                warnings.push(ValidationIssue::new(
                    "filesystem",
                    format!("code directory is read-only: {}", code_path.display()),
                ));
            }
        }
    }

    (errors, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_descriptor() -> JobDescriptor {
        JobDescriptor {
            code_dir: "/job/src".into(),
            job_dir: "/job/src".into(),
            job_command: "echo hi".into(),
            runner_image: "alpine:3.19".into(),
            ..Default::default()
        }
    }

    #[test]
    fn valid_descriptor_has_no_errors() {
        let td = tempfile::tempdir().unwrap();
        let opts = ValidateOptions {
            check_files: false,
            require_container_runtime: false,
        };
        let result = validate(&base_descriptor(), td.path(), &opts);
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn missing_required_fields_reported() {
        let td = tempfile::tempdir().unwrap();
        let opts = ValidateOptions {
            check_files: false,
            require_container_runtime: false,
        };
        let result = validate(&JobDescriptor::default(), td.path(), &opts);
        assert!(result.has_errors());
        assert!(result.errors.iter().any(|e| e.field == "job_command"));
        assert!(result.errors.iter().any(|e| e.field == "runner_image"));
    }

    #[test]
    fn relative_code_dir_is_an_error() {
        let mut descriptor = base_descriptor();
        descriptor.code_dir = "src".into();
        let errors = validate_directory_paths(&descriptor);
        assert!(errors.iter().any(|e| e.field == "code_dir"));
    }

    #[test]
    fn path_outside_job_mount_is_an_error() {
        let mut descriptor = base_descriptor();
        descriptor.code_dir = "/etc/src".into();
        let errors = validate_directory_paths(&descriptor);
        assert!(errors.iter().any(|e| e.field == "code_dir"));
    }

    #[test]
    fn job_env_overriding_path_warns() {
        let mut descriptor = base_descriptor();
        descriptor.job_env = Some("PATH=/evil/bin".into());
        let td = tempfile::tempdir().unwrap();
        let (errors, warnings) = validate_job_environment(&descriptor, td.path(), true);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.message.contains("PATH")));
    }

    #[test]
    fn job_env_long_value_warns() {
        let mut descriptor = base_descriptor();
        descriptor.job_env = Some(format!("BIG={}", "x".repeat(1001)));
        let td = tempfile::tempdir().unwrap();
        let (errors, warnings) = validate_job_environment(&descriptor, td.path(), true);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.message.contains("very long")));
    }

    #[test]
    fn job_env_missing_file_errors_only_when_check_files() {
        let mut descriptor = base_descriptor();
        descriptor.job_env = Some("/job/missing-env.txt".into());
        let td = tempfile::tempdir().unwrap();

        let (errors, _) = validate_job_environment(&descriptor, td.path(), true);
        assert!(!errors.is_empty());

        let (errors, _) = validate_job_environment(&descriptor, td.path(), false);
        assert!(errors.is_empty());
    }

    #[test]
    fn job_env_malformed_errors_regardless_of_check_files() {
        let mut descriptor = base_descriptor();
        descriptor.job_env = Some("NOVALUE".into());
        let td = tempfile::tempdir().unwrap();

        let (errors, _) = validate_job_environment(&descriptor, td.path(), false);
        assert!(!errors.is_empty());
    }

    #[test]
    fn image_with_spaces_and_no_tag_warns() {
        let mut descriptor = base_descriptor();
        descriptor.runner_image = "my image".into();
        let warnings = validate_container_image(&descriptor);
        assert!(warnings.iter().any(|w| w.message.contains("spaces")));
        assert!(warnings.iter().any(|w| w.message.contains("latest")));
    }

    #[test]
    fn pinned_tag_does_not_warn_about_latest() {
        let descriptor = base_descriptor();
        let warnings = validate_container_image(&descriptor);
        assert!(warnings.is_empty());
    }

    #[test]
    fn referenced_secrets_are_collected_without_resolving() {
        let td = tempfile::tempdir().unwrap();
        let mut descriptor = base_descriptor();
        descriptor.job_command = "deploy --token ${secret:ci/prod:token}".into();
        descriptor.job_env = Some("API_KEY=${secret:ci/prod:api_key}".into());
        let opts = ValidateOptions {
            check_files: false,
            require_container_runtime: false,
        };
        let result = validate(&descriptor, td.path(), &opts);
        assert!(result.referenced_secrets.contains(&"${secret:ci/prod:token}".to_string()));
        assert!(result.referenced_secrets.contains(&"${secret:ci/prod:api_key}".to_string()));
    }

    #[test]
    fn missing_workspace_root_is_a_warning_not_an_error() {
        let td = tempfile::tempdir().unwrap();
        let descriptor = base_descriptor();
        let (errors, warnings) = validate_file_system(&descriptor, &td.path().join("absent"));
        assert!(errors.is_empty());
        assert!(!warnings.is_empty());
    }
}
