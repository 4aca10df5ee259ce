//! Container launcher (C9): builds the container invocation, spawns it (or
//! runs the job command directly on the host), and streams both output
//! channels through a [`reactorcide_mask::Masker`] so no registered secret
//! ever reaches the parent's stdout/stderr unredacted.
//!
//! The container-argument ordering in [`build_container_args`] is
//! load-bearing: it is reproduced verbatim by `--dry-run` so a caller can
//! diff the exact command that would have run, and tests assert the literal
//! sequence.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reactorcide_mask::Masker;
use reactorcide_types::{ContainerError, JobDescriptor};

/// Exit code the orchestrator reports when the child was interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Container runtime binary invoked for container-mode execution.
pub const CONTAINER_RUNTIME: &str = "docker";

/// Canonical in-container workspace mount point.
pub const WORKSPACE_MOUNT: &str = "/job";

/// Outcome of running the job command, either locally or in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub interrupted: bool,
}

/// True when the descriptor calls for container-mode execution (the
/// `--container` flag or `REACTORCIDE_CONTAINER=true`), per §4.9's decision
/// rule: "if the caller requested container mode ... use the container
/// path; otherwise execute the command locally".
pub fn use_container(descriptor: &JobDescriptor) -> bool {
    descriptor.container
}

/// Builds the `docker run` argument vector in the exact order the core spec
/// fixes: `run --rm`, resource limits, `-e` env pairs, the workspace mount,
/// the optional secrets-file mount, the optional secrets-socket mount,
/// `-w`, then image + tokenized command + trailing args.
///
/// `env` is a `BTreeMap` so iteration order is deterministic (and matches
/// what a caller diffing `--dry-run` output would expect).
pub fn build_container_args(
    descriptor: &JobDescriptor,
    env: &BTreeMap<String, String>,
    host_job_path: &Path,
    resource_limits: Option<&serde_json::Map<String, serde_json::Value>>,
    secrets_file_host_path: Option<&Path>,
    trailing_args: &[String],
) -> Result<Vec<String>, ContainerError> {
    let mut args = vec!["run".to_string(), "--rm".to_string()];

    if let Some(limits) = resource_limits {
        if let Some(mem) = limits.get("memory").and_then(|v| v.as_str()) {
            args.push("--memory".into());
            args.push(mem.to_string());
        }
        if let Some(cpus) = limits.get("cpus").and_then(|v| v.as_str()) {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
    }

    for (key, value) in env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    args.push("-v".into());
    args.push(format!("{}:{}", host_job_path.display(), WORKSPACE_MOUNT));

    if descriptor.secrets_file.is_some() {
        if let Some(host_path) = secrets_file_host_path {
            if host_path.exists() {
                args.push("--env-file".into());
                args.push(host_path.display().to_string());
                args.push("-v".into());
                args.push(format!("{}:/run/secrets/env:ro", host_path.display()));
            }
        }
    }

    if let Some(socket) = env.get("REACTORCIDE_SECRETS_SOCKET") {
        if Path::new(socket).exists() {
            args.push("-v".into());
            args.push("/tmp:/tmp".into());
        }
    }

    args.push("-w".into());
    args.push(descriptor.job_dir.clone());

    args.push(descriptor.runner_image.clone());
    args.extend(
        shell_words::split(&descriptor.job_command)
            .map_err(|e| ContainerError::LaunchFailed(format!("invalid job_command: {e}")))?,
    );
    args.extend(trailing_args.iter().cloned());

    Ok(args)
}

/// Renders `args` as a single shell-quoted command line, for `--dry-run`.
pub fn render_command_line(runtime: &str, args: &[String]) -> String {
    let mut parts = vec![runtime.to_string()];
    parts.extend(args.iter().cloned());
    shell_words::join(parts)
}

/// Checks that the container runtime binary is reachable on `PATH`.
pub fn runtime_available() -> bool {
    which::which(CONTAINER_RUNTIME).is_ok()
}

/// Runs the container, streaming stdout and stderr through `masker`
/// independently (stdout lines to the parent's stdout, stderr lines to the
/// parent's stderr). Installs a one-shot Ctrl-C handler: on interrupt the
/// child is killed and [`ExecOutcome::interrupted`]/[`INTERRUPTED_EXIT_CODE`]
/// are reported.
pub fn run_container(args: &[String], masker: &Masker) -> Result<ExecOutcome, ContainerError> {
    if which::which(CONTAINER_RUNTIME).is_err() {
        return Err(ContainerError::RuntimeUnavailable(CONTAINER_RUNTIME.to_string()));
    }

    let mut command = Command::new(CONTAINER_RUNTIME);
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    spawn_and_stream(command, masker)
}

/// Runs `job_command` directly on the host under `sh -c`, with `stderr`
/// merged into `stdout` for single-stream redaction (per §4.9's local-mode
/// rule), in `working_dir`, with `env` applied on top of the inherited
/// process environment.
pub fn run_local(
    job_command: &str,
    working_dir: &Path,
    env: &BTreeMap<String, String>,
    masker: &Masker,
) -> Result<ExecOutcome, ContainerError> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(job_command)
        .current_dir(working_dir)
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    spawn_and_stream_merged(command, masker)
}

fn spawn_and_stream(command: Command, masker: &Masker) -> Result<ExecOutcome, ContainerError> {
    run_with_streams(command, masker, false)
}

fn spawn_and_stream_merged(command: Command, masker: &Masker) -> Result<ExecOutcome, ContainerError> {
    run_with_streams(command, masker, true)
}

/// Spawns `command` and interleaves its stdout/stderr through `masker`.
/// When `merge_to_stdout` is set (local-mode execution), both channels are
/// written to the parent's stdout; otherwise each channel goes to its own
/// parent stream. Installs a one-shot Ctrl-C handler that kills the child
/// and reports [`INTERRUPTED_EXIT_CODE`].
fn run_with_streams(
    mut command: Command,
    masker: &Masker,
    merge_to_stdout: bool,
) -> Result<ExecOutcome, ContainerError> {
    let mut child = command
        .spawn()
        .map_err(|e| ContainerError::LaunchFailed(e.to_string()))?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = interrupted.clone();
    let handler_installed = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .is_ok();

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let outcome = std::thread::scope(|scope| -> Result<ExecOutcome, ContainerError> {
        let out_handle = scope.spawn(|| stream_masked(stdout, masker, &mut std::io::stdout()));
        let err_handle = scope.spawn(|| {
            if merge_to_stdout {
                stream_masked(stderr, masker, &mut std::io::stdout());
            } else {
                stream_masked(stderr, masker, &mut std::io::stderr());
            }
        });

        loop {
            if handler_installed && interrupted.load(Ordering::SeqCst) {
                let _ = child.kill();
                let _ = child.wait();
                let _ = out_handle.join();
                let _ = err_handle.join();
                return Ok(ExecOutcome {
                    exit_code: INTERRUPTED_EXIT_CODE,
                    interrupted: true,
                });
            }
            match child.try_wait().map_err(|e| ContainerError::LaunchFailed(e.to_string()))? {
                Some(status) => {
                    let _ = out_handle.join();
                    let _ = err_handle.join();
                    return Ok(ExecOutcome {
                        exit_code: status.code().unwrap_or(-1),
                        interrupted: false,
                    });
                }
                None => std::thread::sleep(std::time::Duration::from_millis(25)),
            }
        }
    })?;

    Ok(outcome)
}

fn stream_masked<R: std::io::Read, W: Write>(reader: R, masker: &Masker, sink: &mut W) {
    let mut buffered = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match buffered.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let masked = masker.mask(line.trim_end_matches('\n'));
                let _ = writeln!(sink, "{masked}");
            }
            Err(_) => break,
        }
    }
}
