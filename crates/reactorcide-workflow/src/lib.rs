//! Workflow emitter (C10): the in-process API a running job uses to
//! declare follow-up jobs. Triggers queue in memory; [`WorkflowEmitter::flush`]
//! either POSTs them to the coordinator (when `REACTORCIDE_COORDINATOR_URL`,
//! `REACTORCIDE_API_TOKEN`, and `REACTORCIDE_JOB_ID` are all set) or merges
//! them into the local triggers file.
//!
//! `is_job_running`/`get_job_result` are deliberately stubs — the
//! coordinator HTTP API itself is an external collaborator, out of scope
//! for this crate (see spec §1).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use reactorcide_log::Logger;
use reactorcide_types::{JobTrigger, SourceType, TriggerCondition, TriggersFile};

/// Caller-supplied fields for a triggered follow-up job, beyond its name.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub depends_on: Vec<String>,
    pub condition: Option<TriggerCondition>,
    pub env: BTreeMap<String, String>,
    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
    pub source_ref: Option<String>,
    pub ci_source_type: Option<SourceType>,
    pub ci_source_url: Option<String>,
    pub ci_source_ref: Option<String>,
    pub container_image: Option<String>,
    pub job_command: Option<String>,
    pub priority: Option<i32>,
    pub timeout: Option<std::time::Duration>,
}

impl TriggerOptions {
    fn into_trigger(self, job_name: impl Into<String>) -> JobTrigger {
        JobTrigger {
            job_name: job_name.into(),
            depends_on: self.depends_on,
            condition: self.condition.unwrap_or(TriggerCondition::AllSuccess),
            env: self.env,
            source_type: self.source_type,
            source_url: self.source_url,
            source_ref: self.source_ref,
            ci_source_type: self.ci_source_type,
            ci_source_url: self.ci_source_url,
            ci_source_ref: self.ci_source_ref,
            container_image: self.container_image,
            job_command: self.job_command,
            priority: self.priority,
            timeout: self.timeout,
        }
    }
}

/// Coordinator credentials, resolved from the environment. `flush` falls
/// back to the local triggers file unless all three are present.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub url: Option<String>,
    pub api_token: Option<String>,
    pub job_id: Option<String>,
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        Self::from_map(&std::env::vars().collect())
    }

    pub fn from_map(env: &BTreeMap<String, String>) -> Self {
        Self {
            url: env.get("REACTORCIDE_COORDINATOR_URL").cloned(),
            api_token: env.get("REACTORCIDE_API_TOKEN").cloned(),
            job_id: env.get("REACTORCIDE_JOB_ID").cloned(),
        }
    }

    fn is_configured(&self) -> bool {
        self.url.is_some() && self.api_token.is_some() && self.job_id.is_some()
    }
}

/// Where a [`WorkflowEmitter::flush`] call sent its queued triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued; flush was a no-op.
    Empty,
    /// POSTed to the coordinator and accepted (2xx); the local file, if any,
    /// was deleted.
    PostedToCoordinator,
    /// Written to (and merged into, if one already existed) the local
    /// triggers file — either because no API credentials are configured, or
    /// because the POST failed.
    WrittenToFile,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow: failed to read existing triggers file {path}: {source}")]
    ReadTriggers { path: String, source: std::io::Error },
    #[error("workflow: failed to write triggers file {path}: {source}")]
    WriteTriggers { path: String, source: std::io::Error },
    #[error("workflow: malformed triggers file {path}: {source}")]
    MalformedTriggers { path: String, source: serde_json::Error },
}

/// Queues follow-up job triggers and flushes them to the coordinator or a
/// local file. One instance is scoped to a single run.
pub struct WorkflowEmitter {
    triggers: Mutex<Vec<JobTrigger>>,
    triggers_file_path: PathBuf,
    logger: Arc<Logger>,
    http: reqwest::blocking::Client,
}

impl WorkflowEmitter {
    pub fn new(triggers_file_path: impl Into<PathBuf>, logger: Arc<Logger>) -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            triggers_file_path: triggers_file_path.into(),
            logger,
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Queues a trigger in memory and logs its name. Does not touch the
    /// filesystem or network until [`flush`](Self::flush) is called.
    pub fn trigger(&self, job_name: impl Into<String>, opts: TriggerOptions) {
        self.queue_trigger(opts.into_trigger(job_name));
    }

    /// Queues an already-built [`JobTrigger`] directly — the path used by
    /// the event evaluator (C11), which synthesizes full trigger records
    /// from a matched job definition rather than building them field by
    /// field through [`TriggerOptions`].
    pub fn queue_trigger(&self, trigger: JobTrigger) {
        self.logger.info("workflow", "queued trigger", &[("job_name", &trigger.job_name)]);
        self.triggers.lock().expect("workflow lock poisoned").push(trigger);
    }

    /// Stub: the coordinator is out of scope for this crate. Always `false`
    /// without API configuration; with it, still `false` (no coordinator
    /// client is implemented here — see spec §1).
    pub fn is_job_running(&self, _name: &str) -> bool {
        false
    }

    /// Stub counterpart to [`is_job_running`](Self::is_job_running).
    pub fn get_job_result(&self, _name: &str) -> Option<String> {
        None
    }

    /// Flushes the queue using the real process environment for
    /// coordinator credentials.
    pub fn flush(&self) -> Result<FlushOutcome, WorkflowError> {
        self.flush_with_coordinator(&CoordinatorConfig::from_env())
    }

    /// Flushes the queue against an explicit [`CoordinatorConfig`], so tests
    /// don't need to mutate the real process environment.
    pub fn flush_with_coordinator(&self, coordinator: &CoordinatorConfig) -> Result<FlushOutcome, WorkflowError> {
        let pending = {
            let mut guard = self.triggers.lock().expect("workflow lock poisoned");
            std::mem::take(&mut *guard)
        };

        if pending.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        if coordinator.is_configured() {
            match self.post_to_coordinator(coordinator, &pending) {
                Ok(true) => {
                    if self.triggers_file_path.exists() {
                        let _ = std::fs::remove_file(&self.triggers_file_path);
                    }
                    return Ok(FlushOutcome::PostedToCoordinator);
                }
                Ok(false) | Err(_) => {
                    self.logger.warn(
                        "workflow",
                        "coordinator POST failed, falling back to local triggers file",
                        &[],
                    );
                }
            }
        }

        self.write_merged_file(&pending)?;
        Ok(FlushOutcome::WrittenToFile)
    }

    fn post_to_coordinator(
        &self,
        coordinator: &CoordinatorConfig,
        pending: &[JobTrigger],
    ) -> Result<bool, reqwest::Error> {
        let url = format!(
            "{}/api/v1/jobs/{}/triggers",
            coordinator.url.as_deref().unwrap_or_default().trim_end_matches('/'),
            coordinator.job_id.as_deref().unwrap_or_default()
        );
        let body = TriggersFile::new(pending.to_vec());
        let response = self
            .http
            .post(url)
            .bearer_auth(coordinator.api_token.as_deref().unwrap_or_default())
            .json(&body)
            .send()?;
        Ok(response.status().is_success())
    }

    fn write_merged_file(&self, pending: &[JobTrigger]) -> Result<(), WorkflowError> {
        let mut jobs = read_existing_jobs(&self.triggers_file_path)?;
        jobs.extend(pending.iter().cloned());
        let file = TriggersFile::new(jobs);
        let json = serde_json::to_string_pretty(&file).expect("TriggersFile always serializes");
        std::fs::write(&self.triggers_file_path, json).map_err(|source| WorkflowError::WriteTriggers {
            path: self.triggers_file_path.display().to_string(),
            source,
        })
    }

    /// RAII scope with context-manager discipline: flushes on normal drop,
    /// but not while unwinding from a panic (mirroring "flush on success,
    /// skip on failure, don't swallow the exception").
    pub fn scoped(self: Arc<Self>) -> WorkflowScope {
        WorkflowScope { emitter: self }
    }
}

fn read_existing_jobs(path: &Path) -> Result<Vec<JobTrigger>, WorkflowError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path).map_err(|source| WorkflowError::ReadTriggers {
        path: path.display().to_string(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: TriggersFile = serde_json::from_str(&contents).map_err(|source| WorkflowError::MalformedTriggers {
        path: path.display().to_string(),
        source,
    })?;
    Ok(file.jobs)
}

/// Scope guard implementing the context-manager discipline from §4.10:
/// flush on successful scope exit, never flush while unwinding.
pub struct WorkflowScope {
    emitter: Arc<WorkflowEmitter>,
}

impl Drop for WorkflowScope {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            if let Err(e) = self.emitter.flush() {
                self.emitter.logger.error(
                    "workflow",
                    "flush on scope exit failed",
                    &[],
                    Some(reactorcide_log::LogError::new("WorkflowError", e.to_string())),
                );
            }
        }
    }
}

impl std::ops::Deref for WorkflowScope {
    type Target = WorkflowEmitter;
    fn deref(&self) -> &Self::Target {
        &self.emitter
    }
}

fn default_triggers_file_path() -> PathBuf {
    std::env::var("REACTORCIDE_TRIGGERS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("triggers.json"))
}

fn default_emitter() -> &'static WorkflowEmitter {
    static INSTANCE: OnceLock<WorkflowEmitter> = OnceLock::new();
    INSTANCE.get_or_init(|| WorkflowEmitter::new(default_triggers_file_path(), Arc::new(Logger::from_env())))
}

/// Module-level convenience over a lazily-created default [`WorkflowEmitter`],
/// for callers that don't want to thread one through explicitly (mirrors the
/// source's module-level `trigger_job`/`flush_triggers` functions).
pub fn trigger_job(job_name: impl Into<String>, opts: TriggerOptions) {
    default_emitter().trigger(job_name, opts);
}

/// See [`trigger_job`].
pub fn flush_triggers() -> Result<FlushOutcome, WorkflowError> {
    default_emitter().flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Arc<Logger> {
        Arc::new(Logger::new(
            reactorcide_log::LogFormat::Text,
            reactorcide_log::Level::Fatal,
            Box::new(std::io::sink()),
        ))
    }

    #[test]
    fn flush_with_empty_queue_is_noop() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("triggers.json");
        let emitter = WorkflowEmitter::new(&path, test_logger());
        let outcome = emitter.flush_with_coordinator(&CoordinatorConfig::default()).unwrap();
        assert_eq!(outcome, FlushOutcome::Empty);
        assert!(!path.exists());
    }

    #[test]
    fn flush_without_credentials_writes_file_unconditionally() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("triggers.json");
        let emitter = WorkflowEmitter::new(&path, test_logger());
        emitter.trigger("deploy", TriggerOptions::default());

        let outcome = emitter.flush_with_coordinator(&CoordinatorConfig::default()).unwrap();
        assert_eq!(outcome, FlushOutcome::WrittenToFile);

        let contents = std::fs::read_to_string(&path).unwrap();
        let file: TriggersFile = serde_json::from_str(&contents).unwrap();
        assert_eq!(file.jobs.len(), 1);
        assert_eq!(file.jobs[0].job_name, "deploy");
    }

    #[test]
    fn flush_merges_with_existing_file() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("triggers.json");
        std::fs::write(
            &path,
            serde_json::to_string(&TriggersFile::new(vec![JobTrigger::new("existing")])).unwrap(),
        )
        .unwrap();

        let emitter = WorkflowEmitter::new(&path, test_logger());
        emitter.trigger("new-job", TriggerOptions::default());
        emitter.flush_with_coordinator(&CoordinatorConfig::default()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let file: TriggersFile = serde_json::from_str(&contents).unwrap();
        let names: Vec<&str> = file.jobs.iter().map(|j| j.job_name.as_str()).collect();
        assert_eq!(names, vec!["existing", "new-job"]);
    }

    #[test]
    fn flush_posts_to_coordinator_and_deletes_local_file_on_2xx() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            let response = tiny_http::Response::from_string("{}").with_status_code(200);
            request.respond(response).unwrap();
        });

        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("triggers.json");
        std::fs::write(
            &path,
            serde_json::to_string(&TriggersFile::new(vec![JobTrigger::new("stale")])).unwrap(),
        )
        .unwrap();

        let emitter = WorkflowEmitter::new(&path, test_logger());
        emitter.trigger("deploy", TriggerOptions::default());

        let coordinator = CoordinatorConfig {
            url: Some(format!("http://{addr}")),
            api_token: Some("tok".to_string()),
            job_id: Some("job-1".to_string()),
        };
        let outcome = emitter.flush_with_coordinator(&coordinator).unwrap();
        handle.join().unwrap();

        assert_eq!(outcome, FlushOutcome::PostedToCoordinator);
        assert!(!path.exists());
    }

    #[test]
    fn flush_falls_back_to_file_on_coordinator_failure() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            let response = tiny_http::Response::from_string("nope").with_status_code(500);
            request.respond(response).unwrap();
        });

        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("triggers.json");
        let emitter = WorkflowEmitter::new(&path, test_logger());
        emitter.trigger("deploy", TriggerOptions::default());

        let coordinator = CoordinatorConfig {
            url: Some(format!("http://{addr}")),
            api_token: Some("tok".to_string()),
            job_id: Some("job-1".to_string()),
        };
        let outcome = emitter.flush_with_coordinator(&coordinator).unwrap();
        handle.join().unwrap();

        assert_eq!(outcome, FlushOutcome::WrittenToFile);
        assert!(path.exists());
    }

    #[test]
    fn is_job_running_and_get_job_result_are_stubs() {
        let td = tempfile::tempdir().unwrap();
        let emitter = WorkflowEmitter::new(td.path().join("triggers.json"), test_logger());
        assert!(!emitter.is_job_running("anything"));
        assert!(emitter.get_job_result("anything").is_none());
    }

    #[test]
    fn scope_flushes_on_normal_drop() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("triggers.json");
        let emitter = Arc::new(WorkflowEmitter::new(&path, test_logger()));
        {
            let scope = emitter.clone().scoped();
            scope.trigger("on-success", TriggerOptions::default());
        }
        assert!(path.exists());
    }
}
