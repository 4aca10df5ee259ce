//! Plugin manager (C6): loads extension units, orders them by priority, and
//! dispatches them across the named lifecycle phases.
//!
//! Rust has no safe equivalent of dynamically importing an on-disk Python
//! module, so "loading extension units from disk" is realized as a compiled
//! `cdylib` exposing a single fixed `extern "C"` entry point, discovered by
//! filename (`plugin_*.<DLL extension>`) and loaded with `libloading`. The
//! entry point hands back a small ABI struct: static name/priority/enabled
//! fields, a JSON-encoded phase list, and an `execute` function pointer that
//! takes a JSON-serialized [`PluginContext`] and returns a JSON-serialized
//! result, freed by the matching `free_result` pointer. In-process plugins
//! (the common case — a crate implementing [`Plugin`] directly and
//! registering itself) need no dynamic library at all.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reactorcide_log::{LogError, Logger};
use reactorcide_types::{Phase, PluginContext, PluginError};

/// A unit that can act at one or more named lifecycle phases.
///
/// Both `execute` (the generic entry, called for every supported phase) and
/// `on_phase` (an optional, phase-specific hook) are invoked, in that
/// order, each time a supported phase is dispatched.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first within a phase. Default 100.
    fn priority(&self) -> i32 {
        100
    }

    fn enabled(&self) -> bool {
        true
    }

    fn supported_phases(&self) -> &[Phase];

    fn execute(&self, ctx: &mut PluginContext) -> Result<(), PluginError>;

    fn on_phase(&self, _phase: Phase, _ctx: &mut PluginContext) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Everything that crosses the `extern "C"` boundary. Isolated in its own
/// module so the crate-level `unsafe_code = "deny"` (narrower than the
/// workspace's blanket `forbid`, which cannot be locally relaxed at all) can
/// be overridden to `allow` in exactly this one place.
mod dynamic {
    #![allow(unsafe_code)]

    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;
    use std::path::Path;

    use libloading::{Library, Symbol};
    use reactorcide_types::{Phase, PluginContext, PluginError};
    use serde::Deserialize;

    use super::Plugin;

    /// Fixed symbol every plugin `cdylib` must export.
    const ENTRY_SYMBOL: &[u8] = b"reactorcide_plugin_abi\0";

    /// C ABI surface a plugin library exposes. `name` and
    /// `supported_phases_json` must point at data the library owns for its
    /// whole lifetime; `execute` returns a heap string the loader releases
    /// through `free_result`.
    #[repr(C)]
    struct PluginAbi {
        name: *const c_char,
        priority: i32,
        enabled: u8,
        supported_phases_json: *const c_char,
        execute: unsafe extern "C" fn(*const c_char) -> *mut c_char,
        free_result: unsafe extern "C" fn(*mut c_char),
    }

    type EntryFn = unsafe extern "C" fn() -> PluginAbi;

    #[derive(Deserialize)]
    #[serde(tag = "status", rename_all = "snake_case")]
    enum ExecuteResult {
        Ok { context: Box<PluginContext> },
        Err { message: String },
    }

    /// A plugin backed by a dynamically loaded `cdylib`.
    pub(crate) struct DynamicPlugin {
        // Kept alive for the plugin's lifetime; the `execute`/`free_result`
        // pointers are only valid as long as this library stays mapped.
        _library: Library,
        name: String,
        priority: i32,
        enabled: bool,
        supported_phases: Vec<Phase>,
        execute: unsafe extern "C" fn(*const c_char) -> *mut c_char,
        free_result: unsafe extern "C" fn(*mut c_char),
    }

    // The loaded symbols are plain function pointers with no interior state
    // of their own, and `dispatch` drives every plugin from one thread at a
    // time, so sharing a `DynamicPlugin` across threads never races.
    unsafe impl Send for DynamicPlugin {}
    unsafe impl Sync for DynamicPlugin {}

    impl DynamicPlugin {
        pub(crate) fn load(path: &Path) -> Result<Self, PluginError> {
            let library = unsafe { Library::new(path) }
                .map_err(|e| PluginError::LoadFailed(format!("{}: {e}", path.display())))?;

            let abi = unsafe {
                let entry: Symbol<EntryFn> = library.get(ENTRY_SYMBOL).map_err(|e| {
                    PluginError::LoadFailed(format!("{}: missing entry point: {e}", path.display()))
                })?;
                entry()
            };

            if abi.name.is_null() || abi.supported_phases_json.is_null() {
                return Err(PluginError::LoadFailed(format!(
                    "{}: entry point returned a null name or phase list",
                    path.display()
                )));
            }

            let name = unsafe { CStr::from_ptr(abi.name) }.to_string_lossy().into_owned();
            let phases_json = unsafe { CStr::from_ptr(abi.supported_phases_json) }
                .to_string_lossy()
                .into_owned();
            let supported_phases: Vec<Phase> = serde_json::from_str(&phases_json).map_err(|e| {
                PluginError::LoadFailed(format!("{}: malformed supported_phases: {e}", path.display()))
            })?;

            Ok(Self {
                _library: library,
                name,
                priority: abi.priority,
                enabled: abi.enabled != 0,
                supported_phases,
                execute: abi.execute,
                free_result: abi.free_result,
            })
        }
    }

    impl Plugin for DynamicPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn supported_phases(&self) -> &[Phase] {
            &self.supported_phases
        }

        fn execute(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
            let fail = |message: String| PluginError::Failed {
                plugin: self.name.clone(),
                phase: ctx.current_phase.name().to_string(),
                message,
            };

            let input = serde_json::to_string(&*ctx).map_err(|e| fail(format!("failed to serialize context: {e}")))?;
            let c_input = CString::new(input).map_err(|e| fail(format!("context contains a NUL byte: {e}")))?;

            let raw = unsafe { (self.execute)(c_input.as_ptr()) };
            if raw.is_null() {
                return Err(fail("plugin returned a null result".to_string()));
            }
            let output = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
            unsafe { (self.free_result)(raw) };

            match serde_json::from_str::<ExecuteResult>(&output) {
                Ok(ExecuteResult::Ok { context }) => {
                    *ctx = *context;
                    Ok(())
                }
                Ok(ExecuteResult::Err { message }) => Err(fail(message)),
                Err(e) => Err(fail(format!("failed to parse plugin result: {e}"))),
            }
        }
    }
}

/// Loads, orders, and dispatches plugins across the lifecycle.
pub struct PluginManager {
    plugins: Vec<Box<dyn Plugin>>,
    logger: Arc<Logger>,
}

impl PluginManager {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            plugins: Vec::new(),
            logger,
        }
    }

    /// Registers a plugin. A duplicate name replaces the earlier
    /// registration in place, preserving its position in registration
    /// order for priority-tie-break purposes.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        if let Some(pos) = self.plugins.iter().position(|p| p.name() == plugin.name()) {
            self.plugins[pos] = plugin;
        } else {
            self.plugins.push(plugin);
        }
    }

    /// Enumerates `plugin_*.<DLL extension>` files in `dir`, sorted by
    /// filename for determinism, and loads each as a dynamic plugin.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, PluginError> {
        let ext = std::env::consts::DLL_EXTENSION;
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| PluginError::LoadFailed(format!("{}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("plugin_"))
                    && p.extension().and_then(|e| e.to_str()) == Some(ext)
            })
            .collect();
        paths.sort();

        let count = paths.len();
        for path in paths {
            self.load_file(&path)?;
        }
        Ok(count)
    }

    /// Loads a single plugin library.
    pub fn load_file(&mut self, path: &Path) -> Result<(), PluginError> {
        let plugin = dynamic::DynamicPlugin::load(path)?;
        self.register(Box::new(plugin));
        Ok(())
    }

    /// Loads plugins from the conventional `builtin_plugins` directory next
    /// to the running executable, if one exists. A missing directory is not
    /// an error — most installs ship with none.
    pub fn load_builtin_plugins(&mut self) -> Result<usize, PluginError> {
        let exe = std::env::current_exe()
            .map_err(|e| PluginError::LoadFailed(format!("locating current executable: {e}")))?;
        let Some(dir) = exe.parent() else {
            return Ok(0);
        };
        let builtin_dir = dir.join("builtin_plugins");
        if !builtin_dir.is_dir() {
            return Ok(0);
        }
        self.load_dir(&builtin_dir)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Dispatches `phase` to every enabled plugin that supports it, in
    /// (priority, registration-order) order. On a plugin failure: logs at
    /// error, dispatches `on_error` to the remaining enabled participants
    /// (unless `phase` already is `on_error`, avoiding recursion), then
    /// propagates the failure to the caller so the orchestrator can still
    /// run `cleanup`.
    pub fn dispatch(&self, phase: Phase, ctx: &mut PluginContext) -> Result<(), PluginError> {
        ctx.current_phase = phase;
        let mut ordered: Vec<&dyn Plugin> = self
            .plugins
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| p.enabled() && p.supported_phases().contains(&phase))
            .collect();
        ordered.sort_by_key(|p| p.priority());

        for plugin in ordered {
            let result = plugin
                .execute(ctx)
                .and_then(|_| plugin.on_phase(phase, ctx));
            if let Err(e) = result {
                self.logger.error(
                    "plugins",
                    "plugin failed",
                    &[("plugin", plugin.name()), ("phase", phase.name())],
                    Some(LogError::new("PluginError", e.to_string())),
                );
                ctx.error = Some(e.to_string());
                if phase != Phase::OnError {
                    let _ = self.dispatch(Phase::OnError, ctx);
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactorcide_types::JobDescriptor;
    use std::sync::Mutex;

    fn test_logger() -> Arc<Logger> {
        Arc::new(Logger::new(
            reactorcide_log::LogFormat::Text,
            reactorcide_log::Level::Fatal,
            Box::new(std::io::sink()),
        ))
    }

    struct RecordingPlugin {
        name: &'static str,
        priority: i32,
        phases: Vec<Phase>,
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<Phase>,
    }

    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn supported_phases(&self) -> &[Phase] {
            &self.phases
        }
        fn execute(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push(format!("{}:{}", self.name, ctx.current_phase.name()));
            if self.fail_on == Some(ctx.current_phase) {
                return Err(PluginError::Failed {
                    plugin: self.name.to_string(),
                    phase: ctx.current_phase.name().to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn plugins_dispatch_in_priority_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut manager = PluginManager::new(test_logger());
        manager.register(Box::new(RecordingPlugin {
            name: "b",
            priority: 50,
            phases: vec![Phase::PreValidation],
            calls: calls.clone(),
            fail_on: None,
        }));
        manager.register(Box::new(RecordingPlugin {
            name: "a",
            priority: 10,
            phases: vec![Phase::PreValidation],
            calls: calls.clone(),
            fail_on: None,
        }));

        let mut ctx = PluginContext::new(JobDescriptor::default());
        manager.dispatch(Phase::PreValidation, &mut ctx).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["a:pre_validation", "b:pre_validation"]);
    }

    #[test]
    fn duplicate_name_replaces_not_appends() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut manager = PluginManager::new(test_logger());
        manager.register(Box::new(RecordingPlugin {
            name: "a",
            priority: 10,
            phases: vec![Phase::Cleanup],
            calls: calls.clone(),
            fail_on: None,
        }));
        manager.register(Box::new(RecordingPlugin {
            name: "a",
            priority: 99,
            phases: vec![Phase::Cleanup],
            calls: calls.clone(),
            fail_on: None,
        }));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn failure_triggers_on_error_then_propagates() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut manager = PluginManager::new(test_logger());
        manager.register(Box::new(RecordingPlugin {
            name: "pipeline",
            priority: 10,
            phases: vec![Phase::PreContainer],
            calls: calls.clone(),
            fail_on: Some(Phase::PreContainer),
        }));
        manager.register(Box::new(RecordingPlugin {
            name: "cleanup-on-error",
            priority: 10,
            phases: vec![Phase::OnError],
            calls: calls.clone(),
            fail_on: None,
        }));

        let mut ctx = PluginContext::new(JobDescriptor::default());
        let err = manager.dispatch(Phase::PreContainer, &mut ctx).unwrap_err();
        assert!(matches!(err, PluginError::Failed { .. }));
        assert!(calls.lock().unwrap().contains(&"cleanup-on-error:on_error".to_string()));
        assert_eq!(ctx.error, Some("plugin `pipeline` failed in phase `pre_container`: boom".to_string()));
    }

    #[test]
    fn disabled_plugin_is_skipped() {
        struct Disabled;
        impl Plugin for Disabled {
            fn name(&self) -> &str {
                "disabled"
            }
            fn enabled(&self) -> bool {
                false
            }
            fn supported_phases(&self) -> &[Phase] {
                &[Phase::Cleanup]
            }
            fn execute(&self, _ctx: &mut PluginContext) -> Result<(), PluginError> {
                panic!("must not run");
            }
        }
        let mut manager = PluginManager::new(test_logger());
        manager.register(Box::new(Disabled));
        let mut ctx = PluginContext::new(JobDescriptor::default());
        assert!(manager.dispatch(Phase::Cleanup, &mut ctx).is_ok());
    }

    #[test]
    fn load_dir_ignores_non_matching_files_and_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("not_a_plugin.so"), b"").unwrap();
        std::fs::write(dir.path().join("plugin_readme.txt"), b"").unwrap();

        let mut manager = PluginManager::new(test_logger());
        let loaded = manager.load_dir(dir.path()).unwrap();
        assert_eq!(loaded, 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn load_builtin_plugins_is_a_silent_noop_when_the_directory_is_absent() {
        // No crate ships a `builtin_plugins` directory next to the test
        // binary, so this always takes the "absent" path in CI.
        let mut manager = PluginManager::new(test_logger());
        let loaded = manager.load_builtin_plugins().unwrap();
        assert_eq!(loaded, 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn load_dir_on_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PluginManager::new(test_logger());
        assert!(manager.load_dir(&dir.path().join("absent")).is_err());
    }

    /// Compiles a tiny fixture `cdylib` with `rustc` and loads it through
    /// the real `dlopen` path, end to end. Skips (rather than fails) when
    /// no `rustc` is on `PATH`, mirroring how `libloading`'s own test suite
    /// builds throwaway fixture libraries at test time.
    #[test]
    fn load_file_dlopens_a_real_fixture_plugin_and_executes_it() {
        let Some(rustc) = which_rustc() else { return };
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("fixture.rs");
        std::fs::write(&src, FIXTURE_SOURCE).unwrap();

        let ext = std::env::consts::DLL_EXTENSION;
        let out = dir.path().join(format!("plugin_fixture.{ext}"));
        let status = std::process::Command::new(rustc)
            .args(["--crate-type", "cdylib", "-O"])
            .arg(&src)
            .arg("-o")
            .arg(&out)
            .status()
            .expect("spawn rustc");
        assert!(status.success(), "fixture plugin failed to compile");

        let mut manager = PluginManager::new(test_logger());
        manager.load_file(&out).expect("load fixture plugin");
        assert_eq!(manager.len(), 1);

        let mut ctx = PluginContext::new(JobDescriptor::default());
        manager.dispatch(Phase::PreValidation, &mut ctx).expect("dispatch to fixture");
        assert_eq!(
            ctx.metadata.get("fixture_ran"),
            Some(&serde_json::Value::Bool(true))
        );
    }

    fn which_rustc() -> Option<PathBuf> {
        std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join("rustc"))
                .find(|candidate| candidate.is_file())
        })
    }

    // Deliberately dependency-free (plain `rustc --crate-type cdylib`, no
    // `cargo`, no `serde_json`): patches the one known-empty `"metadata":{}`
    // field by string substitution rather than parsing JSON for real.
    const FIXTURE_SOURCE: &str = r#"
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

#[repr(C)]
pub struct PluginAbi {
    name: *const c_char,
    priority: i32,
    enabled: u8,
    supported_phases_json: *const c_char,
    execute: unsafe extern "C" fn(*const c_char) -> *mut c_char,
    free_result: unsafe extern "C" fn(*mut c_char),
}

unsafe extern "C" fn execute(ctx_json: *const c_char) -> *mut c_char {
    let input = unsafe { CStr::from_ptr(ctx_json) }.to_string_lossy().into_owned();
    let patched = input.replacen("\"metadata\":{}", "\"metadata\":{\"fixture_ran\":true}", 1);
    let output = format!("{{\"status\":\"ok\",\"context\":{patched}}}");
    CString::new(output).unwrap().into_raw()
}

unsafe extern "C" fn free_result(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe { drop(CString::from_raw(ptr)) };
    }
}

#[no_mangle]
pub extern "C" fn reactorcide_plugin_abi() -> PluginAbi {
    PluginAbi {
        name: c"fixture".as_ptr(),
        priority: 100,
        enabled: 1,
        supported_phases_json: c"[\"pre_validation\"]".as_ptr(),
        execute,
        free_result,
    }
}
"#;
}
