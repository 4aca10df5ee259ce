use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use reactorcide_config::Overrides;
use reactorcide_core::RunOptions;
use reactorcide_log::Logger;
use reactorcide_secrets_store::SecretStore;
use reactorcide_source::GitContext;
use reactorcide_types::{EventContext, EventKind, SourceType};
use reactorcide_validate::ValidateOptions;

#[derive(Parser, Debug)]
#[command(name = "reactorcide", version)]
#[command(about = "Per-job CI/CD runner: source prep, sandboxed execution, and workflow triggers")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a job: resolve config, run the full lifecycle pipeline, and
    /// propagate the child's exit code.
    Run(DescriptorArgs),
    /// Materialize a git repository into the workspace.
    Checkout(CheckoutArgs),
    /// Recursively copy a local directory into the workspace.
    Copy(CopyArgs),
    /// Remove the job workspace (a no-op in container mode, where the
    /// workspace is a mount rather than an owned directory).
    Cleanup(CleanupArgs),
    /// Print the resolved job descriptor as JSON.
    Config(DescriptorArgs),
    /// Validate a resolved job descriptor without running anything.
    Validate(ValidateArgs),
    /// Run a job described by a JSON or YAML job-descriptor file.
    RunJob(RunJobArgs),
    /// Workspace git inspection.
    #[command(subcommand)]
    Git(GitCommand),
    /// Evaluate job-definition YAML in the trusted tree against a VCS event.
    Eval(EvalArgs),
}

/// Every `run`/`config`/`validate` flag, mirroring `REACTORCIDE_<UPPERCASE>`
/// environment overrides one-for-one (see `reactorcide_config::ENV_VAR_NAMES`).
#[derive(Args, Debug, Clone, Default)]
struct DescriptorArgs {
    #[arg(long = "code-dir")]
    code_dir: Option<String>,
    #[arg(long = "job-dir")]
    job_dir: Option<String>,
    #[arg(long = "job-command")]
    job_command: Option<String>,
    #[arg(long = "runner-image")]
    runner_image: Option<String>,
    #[arg(long = "job-env")]
    job_env: Option<String>,
    #[arg(long = "secrets-list")]
    secrets_list: Option<String>,
    #[arg(long = "secrets-file")]
    secrets_file: Option<String>,
    #[arg(long = "source-type")]
    source_type: Option<SourceType>,
    #[arg(long = "source-url")]
    source_url: Option<String>,
    #[arg(long = "source-ref")]
    source_ref: Option<String>,
    #[arg(long = "ci-source-type")]
    ci_source_type: Option<SourceType>,
    #[arg(long = "ci-source-url")]
    ci_source_url: Option<String>,
    #[arg(long = "ci-source-ref")]
    ci_source_ref: Option<String>,
    /// Print the container invocation instead of spawning it.
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Force container execution even without a `--runner-image` override.
    #[arg(long)]
    container: bool,
    /// Extra plugin directory, beyond the built-ins `reactorcide-core` always registers.
    #[arg(long = "plugin-dir")]
    plugin_dir: Option<PathBuf>,
    /// Directory to resolve `--work-dir`-relative state in (`cleanup`/host-mode detection).
    #[arg(long = "work-dir")]
    work_dir: Option<PathBuf>,
}

impl DescriptorArgs {
    fn into_overrides(self) -> Overrides {
        // §4.9: container mode is requested either by `--container` or by
        // supplying a `--runner-image` override; `reactorcide-config::resolve`
        // always fills in a default image, so this distinction has to be made
        // here, before that default is applied, not on the resolved descriptor.
        let container = self.container || self.runner_image.is_some();
        Overrides {
            code_dir: self.code_dir,
            job_dir: self.job_dir,
            job_command: self.job_command,
            runner_image: self.runner_image,
            job_env: self.job_env,
            secrets_list: self.secrets_list,
            secrets_file: self.secrets_file,
            source_type: self.source_type,
            source_url: self.source_url,
            source_ref: self.source_ref,
            ci_source_type: self.ci_source_type,
            ci_source_url: self.ci_source_url,
            ci_source_ref: self.ci_source_ref,
            dry_run: Some(self.dry_run),
            container: Some(container),
        }
    }
}

#[derive(Args, Debug)]
struct CheckoutArgs {
    /// Repository URL to clone.
    git_url: String,
    /// Ref to check out after cloning; falls back to `fetch origin <ref>:<ref>`
    /// and a retried checkout if the initial checkout can't reach it.
    #[arg(long = "ref")]
    git_ref: Option<String>,
    /// Container-relative destination for the untrusted tree (default `/job/src`).
    #[arg(long = "code-dir", default_value = reactorcide_config::DEFAULT_CODE_DIR)]
    code_dir: String,
    /// Treat the current process as already running inside the runner container.
    #[arg(long)]
    container: bool,
}

#[derive(Args, Debug)]
struct CopyArgs {
    /// Local directory to copy from.
    source_dir: PathBuf,
    /// Container-relative destination for the untrusted tree (default `/job/src`).
    #[arg(long = "code-dir", default_value = reactorcide_config::DEFAULT_CODE_DIR)]
    code_dir: String,
    #[arg(long)]
    container: bool,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    container: bool,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    descriptor: DescriptorArgs,
    /// Skip filesystem probes (workspace/code-dir existence, env-file presence).
    #[arg(long = "no-check-files")]
    no_check_files: bool,
}

#[derive(Args, Debug)]
struct RunJobArgs {
    /// Path to a JSON or YAML job-descriptor file.
    job_file: PathBuf,
    #[arg(long = "plugin-dir")]
    plugin_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum GitCommand {
    /// One changed path per line on stdout, relative to `--path`.
    FilesChanged {
        base_ref: String,
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Commit/branch/tag/dirty summary for the repo at `--path`.
    Info {
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct EvalArgs {
    #[arg(long = "ci-source-dir")]
    ci_source_dir: PathBuf,
    #[arg(long = "source-dir")]
    source_dir: PathBuf,
    #[arg(long = "event-type")]
    event_type: String,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long = "pr-base-ref")]
    pr_base_ref: Option<String>,
    #[arg(long = "pr-number")]
    pr_number: Option<u64>,
    #[arg(long = "source-url")]
    source_url: Option<String>,
    #[arg(long = "source-ref")]
    source_ref: Option<String>,
    #[arg(long = "ci-source-url")]
    ci_source_url: Option<String>,
    #[arg(long = "ci-source-ref")]
    ci_source_ref: Option<String>,
    #[arg(long = "triggers-file")]
    triggers_file: PathBuf,
}

/// Job-descriptor file shape accepted by `run-job`: the same fields as
/// `Overrides`, but `job_env` is a structured map (rather than inline
/// `KEY=value` text) so `${secret:path:key}` references can live in
/// individual values without fighting the env-block grammar.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct JobFile {
    code_dir: Option<String>,
    job_dir: Option<String>,
    job_command: Option<String>,
    runner_image: Option<String>,
    job_env: BTreeMap<String, String>,
    secrets_list: Option<String>,
    secrets_file: Option<String>,
    source_type: Option<SourceType>,
    source_url: Option<String>,
    source_ref: Option<String>,
    ci_source_type: Option<SourceType>,
    ci_source_url: Option<String>,
    ci_source_ref: Option<String>,
    dry_run: bool,
    container: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let logger = Arc::new(Logger::from_env());

    match run_command(cli.cmd, &logger) {
        Ok(code) => code_to_exit(code),
        Err(e) => {
            logger.error("cli", "command failed", &[], Some(reactorcide_log::LogError::new("CliError", e.to_string())));
            ExitCode::from(1)
        }
    }
}

fn code_to_exit(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

fn run_command(cmd: Command, logger: &Arc<Logger>) -> Result<i32> {
    match cmd {
        Command::Run(args) => {
            apply_work_dir(&args.work_dir)?;
            let plugin_dir = args.plugin_dir.clone();
            let overrides = args.into_overrides();
            let run_options = RunOptions { plugin_dir, ..Default::default() };
            let exit_code = reactorcide_core::run(overrides, run_options, logger.clone());
            Ok(exit_code)
        }
        Command::Checkout(args) => run_checkout(args).map(|()| 0),
        Command::Copy(args) => run_copy(args).map(|()| 0),
        Command::Cleanup(args) => run_cleanup(args, logger).map(|()| 0),
        Command::Config(args) => {
            apply_work_dir(&args.work_dir)?;
            run_config(args).map(|()| 0)
        }
        Command::Validate(args) => {
            apply_work_dir(&args.descriptor.work_dir.clone())?;
            run_validate(args)
        }
        Command::RunJob(args) => run_job(args, logger),
        Command::Git(git_cmd) => run_git(git_cmd).map(|()| 0),
        Command::Eval(args) => run_eval(args, logger).map(|()| 0),
    }
}

/// Changes the process cwd before resolution so a relative `job`
/// workspace (`reactorcide_source::workspace_root`'s host-mode default)
/// lands under `--work-dir` instead of wherever the CLI happened to be
/// invoked from.
fn apply_work_dir(work_dir: &Option<PathBuf>) -> Result<()> {
    let Some(dir) = work_dir else { return Ok(()) };
    std::env::set_current_dir(dir).with_context(|| format!("changing to --work-dir {}", dir.display()))
}

fn run_checkout(args: CheckoutArgs) -> Result<()> {
    let root = reactorcide_source::workspace_root(args.container);
    let dest = reactorcide_source::container_path_to_host(&args.code_dir, &root);
    reactorcide_source::clone_or_fetch(&args.git_url, args.git_ref.as_deref(), &dest)
        .with_context(|| format!("checking out {} into {}", args.git_url, dest.display()))?;
    println!("checked out {} into {}", args.git_url, dest.display());
    Ok(())
}

fn run_copy(args: CopyArgs) -> Result<()> {
    let root = reactorcide_source::workspace_root(args.container);
    let dest = reactorcide_source::container_path_to_host(&args.code_dir, &root);
    reactorcide_source::copy_directory(&args.source_dir, &dest)
        .with_context(|| format!("copying {} into {}", args.source_dir.display(), dest.display()))?;
    println!("copied {} into {}", args.source_dir.display(), dest.display());
    Ok(())
}

fn run_cleanup(args: CleanupArgs, logger: &Logger) -> Result<()> {
    if args.container {
        logger.info("cli", "cleanup is a no-op in container mode: the workspace is a mount", &[]);
        return Ok(());
    }
    let root = reactorcide_source::workspace_root(false);
    if args.verbose && root.exists() {
        for entry in walk(&root) {
            logger.debug("cli", "removing path", &[("path", &entry.display().to_string())]);
        }
    }
    reactorcide_source::cleanup_job_directory(&root).with_context(|| format!("removing workspace {}", root.display()))?;
    Ok(())
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            out.push(path);
        }
    }
    out
}

fn run_config(args: DescriptorArgs) -> Result<()> {
    let overrides = args.into_overrides();
    let descriptor = reactorcide_config::resolve(overrides).context("resolving job descriptor")?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<i32> {
    let check_files = !args.no_check_files;
    // Same §4.9 rule `into_overrides` applies: container mode follows from
    // `--container` or a supplied `--runner-image`, not the flag alone.
    let container = args.descriptor.container || args.descriptor.runner_image.is_some();
    let overrides = args.descriptor.into_overrides();

    let descriptor = match reactorcide_config::resolve(overrides) {
        Ok(d) => d,
        Err(e) => {
            println!("config error: {e}");
            return Ok(1);
        }
    };

    let workspace_root = reactorcide_source::workspace_root(container);
    let opts = ValidateOptions {
        check_files,
        require_container_runtime: container,
    };
    let result = reactorcide_validate::validate(&descriptor, &workspace_root, &opts);

    for issue in &result.errors {
        println!("error: {}: {}", issue.field, issue.message);
        if let Some(suggestion) = &issue.suggestion {
            println!("  suggestion: {suggestion}");
        }
    }
    for issue in &result.warnings {
        println!("warning: {}: {}", issue.field, issue.message);
    }

    Ok(if result.is_valid() { 0 } else { 1 })
}

fn run_job(args: RunJobArgs, logger: &Arc<Logger>) -> Result<i32> {
    let contents = std::fs::read_to_string(&args.job_file)
        .with_context(|| format!("reading job file {}", args.job_file.display()))?;
    let job_file = parse_job_file(&args.job_file, &contents)?;

    let resolved = resolve_job_secrets(&job_file.job_env)?;
    let container = job_file.container || job_file.runner_image.is_some();

    let overrides = Overrides {
        code_dir: job_file.code_dir,
        job_dir: job_file.job_dir,
        job_command: job_file.job_command,
        runner_image: job_file.runner_image,
        job_env: (!resolved.env.is_empty()).then(|| reactorcide_config::format_env(&resolved.env)),
        secrets_list: job_file.secrets_list,
        secrets_file: job_file.secrets_file,
        source_type: job_file.source_type,
        source_url: job_file.source_url,
        source_ref: job_file.source_ref,
        ci_source_type: job_file.ci_source_type,
        ci_source_url: job_file.ci_source_url,
        ci_source_ref: job_file.ci_source_ref,
        dry_run: Some(job_file.dry_run),
        container: Some(container),
    };

    let run_options = RunOptions { plugin_dir: args.plugin_dir, extra_secrets: resolved.secret_values };
    let exit_code = reactorcide_core::run(overrides, run_options, logger.clone());
    Ok(exit_code)
}

fn parse_job_file(path: &Path, contents: &str) -> Result<JobFile> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(contents).context("parsing JSON job file"),
        Some("yml") | Some("yaml") => serde_yaml::from_str(contents).context("parsing YAML job file"),
        _ => serde_json::from_str(contents)
            .or_else(|_| serde_yaml::from_str(contents))
            .context("parsing job file as JSON or YAML"),
    }
}

/// Result of resolving `${secret:path:key}` references in a job's env
/// block: the substituted map, plus every value the store actually handed
/// back. Per §4.4, "upon successful substitution in the env block, resolved
/// values must also be registered with the masker" — unconditionally, not
/// only when the job's `secrets_list` happens to leave them covered — so
/// the caller always has them to hand to the masker regardless of which
/// `secrets_list` mode the job selects.
struct ResolvedSecrets {
    env: BTreeMap<String, String>,
    secret_values: Vec<String>,
}

/// Resolves `${secret:path:key}` references in `job_env`'s values against
/// the encrypted local secret store, prompting for the store password over
/// the TTY unless `REACTORCIDE_SECRET_STORE_PASSWORD` is already set. Files
/// with no references at all never touch the store or prompt for anything.
fn resolve_job_secrets(job_env: &BTreeMap<String, String>) -> Result<ResolvedSecrets> {
    let has_references = job_env.values().any(|v| !reactorcide_secrets_ref::find_all(v).is_empty());
    if !has_references {
        return Ok(ResolvedSecrets { env: job_env.clone(), secret_values: Vec::new() });
    }

    let password = secret_store_password()?;
    let store = SecretStore::new(secret_store_dir());
    let mut resolved_values = Vec::new();
    let mut getter = |path: &str, key: &str| {
        let value = store.get(path, key, &password).ok().flatten();
        if let Some(value) = &value {
            resolved_values.push(value.clone());
        }
        value
    };

    let env = reactorcide_secrets_ref::resolve_in_map(job_env, &mut getter, false)
        .context("resolving ${secret:...} references in job_env")?;
    Ok(ResolvedSecrets { env, secret_values: resolved_values })
}

fn secret_store_dir() -> PathBuf {
    std::env::var("REACTORCIDE_SECRET_STORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".reactorcide/secrets"))
}

fn secret_store_password() -> Result<String> {
    if let Ok(password) = std::env::var("REACTORCIDE_SECRET_STORE_PASSWORD") {
        return Ok(password);
    }
    rpassword::prompt_password("secret store password: ").context("reading secret store password from terminal")
}

fn run_git(cmd: GitCommand) -> Result<()> {
    match cmd {
        GitCommand::FilesChanged { base_ref, path } => {
            let files = reactorcide_source::get_changed_files(&path, Some(&base_ref))
                .with_context(|| format!("listing files changed against {base_ref}"))?;
            for file in files {
                println!("{file}");
            }
        }
        GitCommand::Info { path } => {
            let context: GitContext = reactorcide_source::get_git_context(&path);
            println!("commit: {}", context.commit.as_deref().unwrap_or("(none)"));
            println!("branch: {}", context.branch.as_deref().unwrap_or("(none)"));
            println!("tag: {}", context.tag.as_deref().unwrap_or("(none)"));
            println!("dirty: {}", context.dirty.map(|d| d.to_string()).unwrap_or_else(|| "(unknown)".to_string()));
        }
    }
    Ok(())
}

fn run_eval(args: EvalArgs, logger: &Arc<Logger>) -> Result<()> {
    let event_type: EventKind = args.event_type.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let event = EventContext {
        event_type,
        branch: args.branch,
        source_url: args.source_url,
        source_ref: args.source_ref,
        ci_source_url: args.ci_source_url,
        ci_source_ref: args.ci_source_ref,
        pr_base_ref: args.pr_base_ref,
        pr_number: args.pr_number,
    };

    let (triggers, outcome) = reactorcide_core::eval(
        &args.ci_source_dir,
        &args.source_dir,
        &event,
        None,
        &args.triggers_file,
        logger.clone(),
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    logger.info(
        "cli",
        "eval complete",
        &[("matched", &triggers.len().to_string()), ("outcome", &format!("{outcome:?}"))],
    );
    for trigger in &triggers {
        println!("{}", trigger.job_name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_to_exit_preserves_low_byte() {
        assert_eq!(code_to_exit(0), ExitCode::from(0));
        assert_eq!(code_to_exit(130), ExitCode::from(130));
        assert_eq!(code_to_exit(1), ExitCode::from(1));
    }

    #[test]
    fn parse_job_file_routes_by_extension() {
        let json = JobFile::default();
        assert!(json.job_env.is_empty());

        let parsed = parse_job_file(
            Path::new("job.json"),
            r#"{"job_command": "echo hi", "runner_image": "alpine", "code_dir": "/job/src", "job_dir": "/job"}"#,
        )
        .unwrap();
        assert_eq!(parsed.job_command.as_deref(), Some("echo hi"));

        let parsed = parse_job_file(
            Path::new("job.yaml"),
            "job_command: echo hi\nrunner_image: alpine\n",
        )
        .unwrap();
        assert_eq!(parsed.runner_image.as_deref(), Some("alpine"));
    }

    #[test]
    fn resolve_job_secrets_passes_through_when_no_references() {
        let mut env = BTreeMap::new();
        env.insert("PLAIN".to_string(), "value".to_string());
        let resolved = resolve_job_secrets(&env).unwrap();
        assert_eq!(resolved.env, env);
        assert!(resolved.secret_values.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn resolve_job_secrets_collects_every_resolved_value() {
        let td = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("REACTORCIDE_SECRET_STORE_DIR", td.path()) };
        unsafe { std::env::set_var("REACTORCIDE_SECRET_STORE_PASSWORD", "correct horse battery staple") };

        let store = SecretStore::new(td.path());
        store.init("correct horse battery staple", false).unwrap();
        store
            .set("ci/prod", "api_key", "topsecretvalue", "correct horse battery staple")
            .unwrap();

        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "${secret:ci/prod:api_key}".to_string());
        env.insert("PLAIN".to_string(), "value".to_string());

        let resolved = resolve_job_secrets(&env).unwrap();
        assert_eq!(resolved.env.get("API_KEY").unwrap(), "topsecretvalue");
        assert_eq!(resolved.secret_values, vec!["topsecretvalue".to_string()]);

        unsafe { std::env::remove_var("REACTORCIDE_SECRET_STORE_DIR") };
        unsafe { std::env::remove_var("REACTORCIDE_SECRET_STORE_PASSWORD") };
    }

    #[test]
    fn secret_store_dir_defaults_when_env_unset() {
        unsafe { std::env::remove_var("REACTORCIDE_SECRET_STORE_DIR") };
        assert_eq!(secret_store_dir(), PathBuf::from(".reactorcide/secrets"));
    }

    #[test]
    #[serial_test::serial]
    fn apply_work_dir_changes_cwd_and_leaves_it_alone_when_unset() {
        let previous = std::env::current_dir().unwrap();
        let td = tempfile::tempdir().unwrap();

        apply_work_dir(&None).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), previous);

        apply_work_dir(&Some(td.path().to_path_buf())).unwrap();
        assert_eq!(std::env::current_dir().unwrap(), td.path().canonicalize().unwrap());

        std::env::set_current_dir(previous).unwrap();
    }
}
