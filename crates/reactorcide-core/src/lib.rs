//! Run orchestrator (C12): wires config resolution, the plugin manager,
//! source preparation, validation, the secret-registration server, and the
//! container/local launcher into the two pipelines from §2:
//!
//! ```text
//! run:  C1 -> pre_validation -> C8 -> post_validation ->
//!       pre_source_prep -> C7 (ci then src) -> post_source_prep ->
//!       C2.seed -> C3.start -> pre_container ->
//!       C9.execute (streaming through C2) -> post_container ->
//!       C3.stop -> cleanup
//!
//! eval: C1 (subset) -> C7 (ensure ci/ and src/ present) ->
//!       C11.load -> C11.match -> C11.synthesize -> C10.write_or_post
//! ```
//!
//! Plugin failure anywhere in `run`'s main pipeline triggers `on_error`
//! (handled inside [`reactorcide_plugins::PluginManager::dispatch`] itself)
//! and `cleanup` always runs afterward, win or lose; `cleanup` failures are
//! logged at `error` but never shadow the primary result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reactorcide_config::Overrides;
use reactorcide_exec::ExecOutcome;
use reactorcide_log::{LogError, Logger};
use reactorcide_mask::Masker;
use reactorcide_plugins::PluginManager;
use reactorcide_secrets_server::SecretsServer;
use reactorcide_source::PreparedPaths;
use reactorcide_types::{
    ContainerError, EventContext, JobDescriptor, JobTrigger, Phase, PluginContext, RunnerError,
};
use reactorcide_validate::ValidateOptions;
use reactorcide_workflow::{CoordinatorConfig, FlushOutcome, WorkflowEmitter};

/// Non-descriptor knobs threaded into [`run`]: where to look for extra
/// plugins, beyond the built-ins the orchestrator always registers, and any
/// values a caller has already resolved outside the descriptor (e.g.
/// `${secret:...}` references substituted into a job file's env block
/// before `run` ever sees it) that must be masked unconditionally per
/// §4.4, regardless of which `secrets_list` mode the job selects.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub plugin_dir: Option<PathBuf>,
    pub extra_secrets: Vec<String>,
}

/// Runs one job end to end and returns the process exit code: the child's
/// own exit code on a normal or abnormal child exit, [`reactorcide_exec::INTERRUPTED_EXIT_CODE`]
/// on Ctrl-C, or `1` for a configuration-class error that never reached a
/// child process.
pub fn run(overrides: Overrides, options: RunOptions, logger: Arc<Logger>) -> i32 {
    match run_inner(overrides, options, &logger) {
        Ok(code) => code,
        Err(e) => {
            logger.error(
                "core",
                "run failed before a child process could report its own exit code",
                &[],
                Some(LogError::new("RunnerError", e.to_string())),
            );
            e.exit_code(None)
        }
    }
}

fn run_inner(overrides: Overrides, options: RunOptions, logger: &Arc<Logger>) -> Result<i32, RunnerError> {
    let descriptor = reactorcide_config::resolve(overrides)?;

    let mut plugins = PluginManager::new(logger.clone());
    plugins.load_builtin_plugins()?;
    if let Some(dir) = &options.plugin_dir {
        if dir.is_dir() {
            plugins.load_dir(dir)?;
        }
    }

    let mut ctx = PluginContext::new(descriptor.clone());
    let pipeline_result = run_pipeline(&descriptor, &options, &plugins, &mut ctx, logger);

    if let Err(e) = plugins.dispatch(Phase::Cleanup, &mut ctx) {
        logger.error(
            "core",
            "cleanup phase failed",
            &[],
            Some(LogError::new("PluginError", e.to_string())),
        );
    }

    let outcome = pipeline_result?;
    Ok(outcome.exit_code)
}

fn run_pipeline(
    descriptor: &JobDescriptor,
    options: &RunOptions,
    plugins: &PluginManager,
    ctx: &mut PluginContext,
    logger: &Arc<Logger>,
) -> Result<ExecOutcome, RunnerError> {
    plugins.dispatch(Phase::PreValidation, ctx)?;

    let workspace_root = reactorcide_source::workspace_root(descriptor.container);
    let validate_opts = ValidateOptions {
        require_container_runtime: descriptor.container,
        ..ValidateOptions::default()
    };
    let validation = reactorcide_validate::validate(descriptor, &workspace_root, &validate_opts);
    if !validation.is_valid() {
        for issue in &validation.errors {
            logger.error("core", "validation error", &[("field", &issue.field), ("message", &issue.message)], None);
        }
        return Err(RunnerError::Validation(validation.errors.len()));
    }
    for issue in &validation.warnings {
        logger.warn("core", "validation warning", &[("field", &issue.field), ("message", &issue.message)]);
    }

    plugins.dispatch(Phase::PostValidation, ctx)?;
    plugins.dispatch(Phase::PreSourcePrep, ctx)?;

    let paths = reactorcide_source::prepare_source(descriptor, descriptor.container)?;
    ctx.job_path = Some(paths.job_dir.clone());

    plugins.dispatch(Phase::PostSourcePrep, ctx)?;

    let parsed_job_env = descriptor
        .job_env
        .as_deref()
        .map(|text| reactorcide_config::parse_env(text, &paths.job_root))
        .transpose()?
        .unwrap_or_default();

    let masker = Arc::new(Masker::new());
    seed_initial_secrets(descriptor, &parsed_job_env, &options.extra_secrets, &masker, &paths.job_root)?;

    let socket_path = paths.job_root.join("secrets.sock");
    let server = SecretsServer::start(socket_path, masker.clone(), logger.clone())
        .map_err(|e| RunnerError::Container(ContainerError::LaunchFailed(e.to_string())))?;
    ctx.env_vars
        .insert("REACTORCIDE_SECRETS_SOCKET".to_string(), server.socket_path().display().to_string());

    plugins.dispatch(Phase::PreContainer, ctx)?;

    let outcome = execute_job(descriptor, &paths, &parsed_job_env, ctx, &masker, logger)?;
    ctx.exit_code = Some(outcome.exit_code);

    plugins.dispatch(Phase::PostContainer, ctx)?;
    server.stop();

    Ok(outcome)
}

fn execute_job(
    descriptor: &JobDescriptor,
    paths: &PreparedPaths,
    parsed_job_env: &BTreeMap<String, String>,
    ctx: &PluginContext,
    masker: &Masker,
    logger: &Logger,
) -> Result<ExecOutcome, RunnerError> {
    let mut env = reactorcide_config::to_container_env(descriptor, parsed_job_env);
    env.extend(ctx.env_vars.clone());

    if reactorcide_exec::use_container(descriptor) {
        let args = reactorcide_exec::build_container_args(descriptor, &env, &paths.job_root, None, None, &[])?;
        if descriptor.dry_run {
            let line = reactorcide_exec::render_command_line(reactorcide_exec::CONTAINER_RUNTIME, &args);
            logger.info("core", "dry run", &[("command", &line)]);
            return Ok(ExecOutcome { exit_code: 0, interrupted: false });
        }
        Ok(reactorcide_exec::run_container(&args, masker)?)
    } else if descriptor.dry_run {
        logger.info("core", "dry run", &[("command", &descriptor.job_command)]);
        Ok(ExecOutcome { exit_code: 0, interrupted: false })
    } else {
        Ok(reactorcide_exec::run_local(&descriptor.job_command, &paths.job_dir, &env, masker)?)
    }
}

/// Seeds the masker with the effective secrets list before the job starts,
/// mirroring `reactorcide_config::resolve_secrets_list`'s two-mode default:
/// an explicit list (including an explicit empty one) is masked verbatim;
/// otherwise every `job_env` value is masked by default.
///
/// `extra_secrets` is registered unconditionally, independent of which
/// `secrets_list` branch above is active: per §4.4, a value resolved from a
/// `${secret:...}` reference and substituted into `job_env` must always be
/// masked, even when the job's explicit `secrets_list` doesn't happen to
/// name it — an explicit `secrets_list` narrows which *plain* `job_env`
/// values get the default masking, it does not opt a resolved secret
/// reference out of masking.
fn seed_initial_secrets(
    descriptor: &JobDescriptor,
    parsed_job_env: &BTreeMap<String, String>,
    extra_secrets: &[String],
    masker: &Masker,
    workspace_root: &Path,
) -> Result<(), RunnerError> {
    let effective_list =
        reactorcide_config::resolve_secrets_list(descriptor.secrets_list.as_deref(), workspace_root)?;

    match effective_list {
        Some(list) => masker.register_many(list),
        None => masker.register_many(parsed_job_env.values().cloned()),
    }

    masker.register_many(extra_secrets.iter().cloned());

    if let Some(secrets_file) = &descriptor.secrets_file {
        let parsed = reactorcide_config::parse_env(secrets_file, workspace_root)?;
        masker.register_many(parsed.values().cloned());
    }

    Ok(())
}

/// Runs the `eval` pipeline end to end: ensures `ci`/`src` trees are
/// present (the caller is expected to have already prepared them via
/// `checkout`/`copy`, so this is a presence check, not a re-materialize),
/// loads and matches job definitions against `event`, synthesizes triggers,
/// and flushes them through the workflow emitter.
pub fn eval(
    ci_source_dir: &Path,
    source_dir: &Path,
    event: &EventContext,
    changed_files: Option<Vec<String>>,
    triggers_file: &Path,
    logger: Arc<Logger>,
) -> Result<(Vec<JobTrigger>, FlushOutcome), RunnerError> {
    let triggers = reactorcide_eval::evaluate(ci_source_dir, source_dir, event, changed_files, &logger)?;

    let emitter = WorkflowEmitter::new(triggers_file, logger);
    for trigger in &triggers {
        emitter.queue_trigger(trigger.clone());
    }
    let outcome = emitter
        .flush_with_coordinator(&CoordinatorConfig::from_env())
        .map_err(|e| RunnerError::Eval(reactorcide_types::EvalError::MalformedDefinition {
            file: triggers_file.display().to_string(),
            message: e.to_string(),
        }))?;

    Ok((triggers, outcome))
}
