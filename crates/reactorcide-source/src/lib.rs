//! Source preparation (C7): materializes the two-tree workspace a job runs
//! in — an untrusted `code_dir` tree checked out from the job's own
//! `source_*` settings, and an optional trusted `ci` tree checked out from
//! the separate `ci_source_*` settings — plus the git metadata helpers used
//! for change-triggered evaluation.
//!
//! Container paths (`/job/...`) and host paths (`./job/...`) are two views
//! of the same tree: [`workspace_root`] picks the base depending on whether
//! the caller is running inside the runner container or preparing the tree
//! from the host, and [`container_path_to_host`] maps a `code_dir`/`job_dir`
//! value onto it.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use reactorcide_types::{JobDescriptor, SourceError, SourceType};
use serde::{Deserialize, Serialize};

/// Environment variable that forces container-mode detection (§4.7, §6).
pub const IN_CONTAINER_ENV: &str = "REACTORCIDE_IN_CONTAINER";

/// Canonical in-container workspace mount point.
pub const CONTAINER_MOUNT: &str = "/job";

/// Detects whether the current process is already running inside the
/// runner container, per §4.7: either `REACTORCIDE_IN_CONTAINER=true` is
/// set, or the canonical mount point `/job` exists, is writable, and the
/// current working directory lies under it.
pub fn detect_in_container() -> bool {
    if std::env::var(IN_CONTAINER_ENV).map(|v| v == "true").unwrap_or(false) {
        return true;
    }

    let mount = Path::new(CONTAINER_MOUNT);
    if !mount.is_dir() {
        return false;
    }
    let writable = std::fs::metadata(mount).map(|m| !m.permissions().readonly()).unwrap_or(false);
    if !writable {
        return false;
    }

    std::env::current_dir().map(|cwd| cwd.starts_with(mount)).unwrap_or(false)
}

/// Host-side root of the job workspace: `/job` when running inside the
/// runner container (paths are already rooted there), `./job` when
/// preparing the tree from the host before the container starts.
///
/// `container` forces the container-mode path (used when a caller already
/// knows it, e.g. the job descriptor's own `--container` override); when
/// `false` it falls through to [`detect_in_container`]'s §4.7 autodetection
/// rather than assuming host mode outright.
pub fn workspace_root(container: bool) -> PathBuf {
    if container || detect_in_container() {
        PathBuf::from(CONTAINER_MOUNT)
    } else {
        PathBuf::from("./job")
    }
}

/// Maps a `/job/...`-rooted container path onto `workspace_root`.
pub fn container_path_to_host(container_path: &str, workspace_root: &Path) -> PathBuf {
    let stripped = container_path
        .strip_prefix("/job/")
        .or_else(|| container_path.strip_prefix("/job"))
        .unwrap_or(container_path);
    if stripped.is_empty() {
        workspace_root.to_path_buf()
    } else {
        workspace_root.join(stripped)
    }
}

/// Host paths for the prepared workspace.
#[derive(Debug, Clone)]
pub struct PreparedPaths {
    pub job_root: PathBuf,
    pub code_dir: PathBuf,
    pub job_dir: PathBuf,
    pub ci_dir: Option<PathBuf>,
}

/// Creates the job directory structure (`job_root`, `code_dir`, `job_dir`)
/// without materializing any source tree yet.
pub fn prepare_job_directory(
    descriptor: &JobDescriptor,
    container: bool,
) -> Result<PreparedPaths, SourceError> {
    let job_root = workspace_root(container);
    std::fs::create_dir_all(&job_root)
        .map_err(|e| SourceError::CopyFailed(format!("{}: {e}", job_root.display())))?;

    let code_dir = container_path_to_host(&descriptor.code_dir, &job_root);
    std::fs::create_dir_all(&code_dir)
        .map_err(|e| SourceError::CopyFailed(format!("{}: {e}", code_dir.display())))?;

    let job_dir = container_path_to_host(&descriptor.job_dir, &job_root);
    if job_dir != code_dir {
        std::fs::create_dir_all(&job_dir)
            .map_err(|e| SourceError::CopyFailed(format!("{}: {e}", job_dir.display())))?;
    }

    let ci_dir = if descriptor.ci_source_type != SourceType::None {
        Some(job_root.join("ci"))
    } else {
        None
    };

    Ok(PreparedPaths {
        job_root,
        code_dir,
        job_dir,
        ci_dir,
    })
}

/// Prepares the full workspace: directory structure, then the untrusted
/// `code_dir` tree from `source_*`, then — if configured — the trusted `ci`
/// tree from `ci_source_*`.
pub fn prepare_source(descriptor: &JobDescriptor, container: bool) -> Result<PreparedPaths, SourceError> {
    let paths = prepare_job_directory(descriptor, container)?;

    materialize(
        descriptor.source_type,
        descriptor.source_url.as_deref(),
        descriptor.source_ref.as_deref(),
        &paths.code_dir,
    )?;

    if let Some(ci_dir) = &paths.ci_dir {
        materialize(
            descriptor.ci_source_type,
            descriptor.ci_source_url.as_deref(),
            descriptor.ci_source_ref.as_deref(),
            ci_dir,
        )?;
    }

    Ok(paths)
}

/// Materializes one tree at `dest` per `source_type`. `None` is a no-op
/// (the directory was already created by [`prepare_job_directory`]).
pub fn materialize(
    source_type: SourceType,
    url: Option<&str>,
    git_ref: Option<&str>,
    dest: &Path,
) -> Result<(), SourceError> {
    match source_type {
        SourceType::None => Ok(()),
        SourceType::Git => {
            let url = url.ok_or_else(|| SourceError::CloneFailed("missing source_url".into()))?;
            clone_or_fetch(url, git_ref, dest)
        }
        SourceType::Copy => {
            let url = url.ok_or_else(|| SourceError::CopyFailed("missing source_url".into()))?;
            copy_directory(Path::new(url), dest)
        }
        SourceType::Tarball => Err(SourceError::NotImplemented("tarball".into())),
        SourceType::Hg => Err(SourceError::NotImplemented("hg".into())),
        SourceType::Svn => Err(SourceError::NotImplemented("svn".into())),
    }
}

/// Clones `url` into `dest` (replacing any existing tree), then checks out
/// `git_ref` if given. If the ref isn't reachable right after clone — the
/// case when `git_ref` is a PR head SHA that never lands on the default
/// branch — falls back to a focused `fetch origin <ref>:<ref>` and retries
/// the checkout once. Clone failures and checkout failures are reported as
/// distinct error kinds so the caller can tell which step failed.
pub fn clone_or_fetch(url: &str, git_ref: Option<&str>, dest: &Path) -> Result<(), SourceError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .map_err(|e| SourceError::CloneFailed(format!("clearing {}: {e}", dest.display())))?;
    }

    let clone_output = Command::new("git")
        .args(["clone", url, &dest.to_string_lossy()])
        .output()
        .map_err(|e| SourceError::CloneFailed(format!("spawning git clone: {e}")))?;
    if !clone_output.status.success() {
        return Err(SourceError::CloneFailed(
            String::from_utf8_lossy(&clone_output.stderr).to_string(),
        ));
    }

    if let Some(git_ref) = git_ref {
        checkout_with_fetch_fallback(dest, git_ref)?;
    }

    Ok(())
}

/// Checks out `git_ref` in the repo at `dest`. If the ref isn't reachable
/// (the clone didn't bring it in — typically a PR head SHA off the default
/// branch), runs `git fetch origin <ref>:<ref>` and retries once.
fn checkout_with_fetch_fallback(dest: &Path, git_ref: &str) -> Result<(), SourceError> {
    let checkout_output = Command::new("git")
        .args(["checkout", git_ref])
        .current_dir(dest)
        .output()
        .map_err(|e| SourceError::CheckoutFailed(format!("spawning git checkout: {e}")))?;
    if checkout_output.status.success() {
        return Ok(());
    }

    let fetch_output = Command::new("git")
        .args(["fetch", "origin", &format!("{git_ref}:{git_ref}")])
        .current_dir(dest)
        .output()
        .map_err(|e| SourceError::CheckoutFailed(format!("spawning git fetch: {e}")))?;
    if !fetch_output.status.success() {
        return Err(SourceError::CheckoutFailed(format!(
            "checkout of {git_ref} failed ({}), and fetch fallback also failed: {}",
            String::from_utf8_lossy(&checkout_output.stderr).trim(),
            String::from_utf8_lossy(&fetch_output.stderr).trim(),
        )));
    }

    let retry_output = Command::new("git")
        .args(["checkout", git_ref])
        .current_dir(dest)
        .output()
        .map_err(|e| SourceError::CheckoutFailed(format!("spawning git checkout (retry): {e}")))?;
    if !retry_output.status.success() {
        return Err(SourceError::CheckoutFailed(
            String::from_utf8_lossy(&retry_output.stderr).to_string(),
        ));
    }

    Ok(())
}

/// Copies `source_dir` to `dest`, replacing any existing tree at `dest`.
pub fn copy_directory(source_dir: &Path, dest: &Path) -> Result<(), SourceError> {
    if !source_dir.exists() {
        return Err(SourceError::CopyFailed(format!(
            "source directory does not exist: {}",
            source_dir.display()
        )));
    }
    if !source_dir.is_dir() {
        return Err(SourceError::CopyFailed(format!(
            "source path is not a directory: {}",
            source_dir.display()
        )));
    }
    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .map_err(|e| SourceError::CopyFailed(format!("clearing {}: {e}", dest.display())))?;
    }
    copy_dir_recursive(source_dir, dest)
        .map_err(|e| SourceError::CopyFailed(format!("{} -> {}: {e}", source_dir.display(), dest.display())))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(target, &dst_path)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &dst_path).map(|_| ())?;
            let _ = target;
        } else {
            std::fs::copy(entry.path(), &dst_path)?;
        }
    }
    Ok(())
}

/// Removes the entire job workspace, including both the `code_dir` and
/// `ci` trees.
pub fn cleanup_job_directory(job_root: &Path) -> Result<(), SourceError> {
    if job_root.exists() {
        std::fs::remove_dir_all(job_root)
            .map_err(|e| SourceError::CopyFailed(format!("removing {}: {e}", job_root.display())))?;
    }
    Ok(())
}

/// Git metadata for audit trail and change-triggered evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitContext {
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub dirty: Option<bool>,
}

impl GitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_commit(&self) -> bool {
        self.commit.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.unwrap_or(true)
    }

    pub fn short_commit(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| if c.len() > 7 { &c[..7] } else { c.as_str() })
    }
}

pub fn is_git_clean(path: &Path) -> Result<bool> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(path)
        .output()
        .context("failed to run git status")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git status failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(output.stdout.is_empty())
}

pub fn is_git_repo(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn get_commit_hash(path: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(path)
        .output()
        .context("failed to run git rev-parse")?;

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git rev-parse failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn get_branch(path: &Path) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(path)
        .output()
        .context("failed to run git rev-parse")?;

    if !output.status.success() {
        return Ok(None);
    }

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch == "HEAD" {
        return Ok(None);
    }
    Ok(Some(branch))
}

pub fn get_tag(path: &Path) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(["describe", "--exact-match", "--tags"])
        .current_dir(path)
        .output()
        .context("failed to run git describe")?;

    if !output.status.success() {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
}

pub fn get_git_context(path: &Path) -> GitContext {
    GitContext {
        commit: get_commit_hash(path).ok(),
        branch: get_branch(path).ok().flatten(),
        tag: get_tag(path).ok().flatten(),
        dirty: is_git_clean(path).ok().map(|c| !c),
    }
}

/// Files changed relative to `base_ref` (e.g. `"HEAD~1"` or a branch name),
/// used by path-filtered job triggers. Falls back to the working tree's
/// uncommitted changes when `base_ref` is `None`.
pub fn get_changed_files(path: &Path, base_ref: Option<&str>) -> Result<Vec<String>> {
    let output = match base_ref {
        Some(base) => Command::new("git")
            .args(["diff", "--name-only", base])
            .current_dir(path)
            .output()
            .context("failed to run git diff")?,
        None => Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(path)
            .output()
            .context("failed to run git status")?,
    };

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "git changed-files lookup failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let files = if base_ref.is_some() {
        text.lines().map(str::to_string).collect()
    } else {
        text.lines().map(|line| line.chars().skip(3).collect()).collect()
    };

    Ok(files)
}

pub fn get_remote_url(path: &Path, remote: &str) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(["remote", "get-url", remote])
        .current_dir(path)
        .output()
        .context("failed to run git remote")?;

    if !output.status.success() {
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
}

pub fn is_on_branch(path: &Path, branch_name: &str) -> bool {
    get_branch(path).ok().flatten().map(|b| b == branch_name).unwrap_or(false)
}

pub fn is_on_tag(path: &Path) -> bool {
    get_tag(path).ok().flatten().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_git_repo(dir: &Path) {
        Command::new("git").args(["init"]).current_dir(dir).output().expect("git init");
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .expect("git config");
        Command::new("git")
            .args(["config", "user.name", "Test User"])
            .current_dir(dir)
            .output()
            .expect("git config");
    }

    fn make_commit(dir: &Path, msg: &str) {
        Command::new("git")
            .args(["commit", "--allow-empty", "-m", msg])
            .current_dir(dir)
            .output()
            .expect("git commit");
    }

    fn base_descriptor() -> JobDescriptor {
        JobDescriptor {
            code_dir: "/job/src".into(),
            job_dir: "/job".into(),
            job_command: "echo hi".into(),
            runner_image: "alpine".into(),
            ..Default::default()
        }
    }

    #[test]
    fn container_path_to_host_strips_job_prefix() {
        let root = Path::new("/job");
        assert_eq!(container_path_to_host("/job/src", root), root.join("src"));
        assert_eq!(container_path_to_host("/job", root), root.to_path_buf());
    }

    #[test]
    #[serial_test::serial]
    fn workspace_root_picks_host_or_container_base() {
        unsafe { std::env::remove_var(IN_CONTAINER_ENV) };
        assert_eq!(workspace_root(true), PathBuf::from("/job"));
        // No crate in this sandbox ships a real `/job` mount, so absent the
        // forced flag or the env var, detection always falls through to host mode.
        assert_eq!(workspace_root(false), PathBuf::from("./job"));
    }

    #[test]
    #[serial_test::serial]
    fn detect_in_container_follows_env_var() {
        unsafe { std::env::remove_var(IN_CONTAINER_ENV) };
        assert!(!detect_in_container());

        unsafe { std::env::set_var(IN_CONTAINER_ENV, "true") };
        assert!(detect_in_container());

        unsafe { std::env::set_var(IN_CONTAINER_ENV, "false") };
        assert!(!detect_in_container());

        unsafe { std::env::remove_var(IN_CONTAINER_ENV) };
    }

    #[test]
    #[serial_test::serial]
    fn prepare_job_directory_creates_code_and_job_dirs() {
        let td = tempdir().unwrap();
        std::env::set_current_dir(td.path()).unwrap();

        let mut descriptor = base_descriptor();
        descriptor.job_dir = "/job/work".into();
        let paths = prepare_job_directory(&descriptor, false).unwrap();

        assert!(paths.code_dir.exists());
        assert!(paths.job_dir.exists());
        assert_ne!(paths.code_dir, paths.job_dir);
    }

    #[test]
    fn materialize_none_is_noop() {
        let td = tempdir().unwrap();
        let dest = td.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        assert!(materialize(SourceType::None, None, None, &dest).is_ok());
    }

    #[test]
    fn materialize_tarball_is_not_implemented() {
        let td = tempdir().unwrap();
        let err = materialize(SourceType::Tarball, Some("x"), None, td.path()).unwrap_err();
        assert!(matches!(err, SourceError::NotImplemented(_)));
    }

    #[test]
    fn copy_directory_copies_files_and_replaces_existing_dest() {
        let td = tempdir().unwrap();
        let src = td.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), "hello").unwrap();
        std::fs::write(src.join("nested/b.txt"), "world").unwrap();

        let dest = td.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        copy_directory(&src, &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(dest.join("nested/b.txt")).unwrap(), "world");
        assert!(!dest.join("stale.txt").exists());
    }

    #[test]
    fn copy_directory_rejects_missing_source() {
        let td = tempdir().unwrap();
        let err = copy_directory(&td.path().join("missing"), &td.path().join("dest")).unwrap_err();
        assert!(matches!(err, SourceError::CopyFailed(_)));
    }

    #[test]
    fn cleanup_job_directory_removes_tree() {
        let td = tempdir().unwrap();
        let job_root = td.path().join("job");
        std::fs::create_dir_all(job_root.join("src")).unwrap();
        cleanup_job_directory(&job_root).unwrap();
        assert!(!job_root.exists());
    }

    #[test]
    fn cleanup_job_directory_tolerates_missing_tree() {
        let td = tempdir().unwrap();
        assert!(cleanup_job_directory(&td.path().join("absent")).is_ok());
    }

    #[test]
    fn is_git_repo_detects_repo() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        assert!(is_git_repo(td.path()));
    }

    #[test]
    fn is_git_repo_returns_false_for_non_repo() {
        let td = tempdir().expect("tempdir");
        assert!(!is_git_repo(td.path()));
    }

    #[test]
    fn get_commit_hash_returns_hash() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "test");

        let hash = get_commit_hash(td.path()).expect("commit hash");
        assert_eq!(hash.len(), 40);
    }

    #[test]
    fn get_git_context_populates_fields() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "test");

        let context = get_git_context(td.path());

        assert!(context.has_commit());
        assert!(!context.is_dirty());
        assert!(context.short_commit().is_some());
    }

    #[test]
    fn short_commit_truncates() {
        let mut context = GitContext::new();
        context.commit = Some("0123456789abcdef0123456789abcdef01234567".to_string());
        assert_eq!(context.short_commit(), Some("0123456"));
    }

    #[test]
    fn get_changed_files_empty_when_clean() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "test");

        let files = get_changed_files(td.path(), None).expect("changed files");
        assert!(files.is_empty());
    }

    #[test]
    fn get_changed_files_against_base_ref() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        make_commit(td.path(), "initial");
        std::fs::write(td.path().join("new.txt"), "content").unwrap();
        Command::new("git").args(["add", "."]).current_dir(td.path()).output().unwrap();
        make_commit(td.path(), "add file");

        let files = get_changed_files(td.path(), Some("HEAD~1")).expect("changed files");
        assert!(files.iter().any(|f| f == "new.txt"));
    }

    #[test]
    fn get_remote_url_none_when_no_remote() {
        let td = tempdir().expect("tempdir");
        init_git_repo(td.path());
        assert!(get_remote_url(td.path(), "origin").expect("remote url").is_none());
    }

    #[test]
    fn clone_or_fetch_falls_back_to_fetch_for_unreachable_ref() {
        let td = tempdir().expect("tempdir");
        let bare = td.path().join("origin.git");
        std::fs::create_dir_all(&bare).unwrap();
        Command::new("git").args(["init", "--bare"]).current_dir(&bare).output().unwrap();

        let seed = td.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        init_git_repo(&seed);
        std::fs::write(seed.join("main.txt"), "on default branch").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&seed).output().unwrap();
        make_commit(&seed, "initial");
        Command::new("git")
            .args(["remote", "add", "origin", bare.to_str().unwrap()])
            .current_dir(&seed)
            .output()
            .unwrap();
        Command::new("git").args(["push", "origin", "HEAD:main"]).current_dir(&seed).output().unwrap();

        Command::new("git").args(["checkout", "-b", "feature"]).current_dir(&seed).output().unwrap();
        std::fs::write(seed.join("feature.txt"), "only on feature branch").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&seed).output().unwrap();
        make_commit(&seed, "feature work");
        let feature_sha = get_commit_hash(&seed).unwrap();
        Command::new("git")
            .args(["push", "origin", "feature"])
            .current_dir(&seed)
            .output()
            .unwrap();

        Command::new("git")
            .args(["symbolic-ref", "HEAD", "refs/heads/main"])
            .current_dir(&bare)
            .output()
            .unwrap();

        let dest = td.path().join("workspace");
        clone_or_fetch(bare.to_str().unwrap(), Some(&feature_sha), &dest).expect("clone+fetch-fallback");

        assert!(dest.join("feature.txt").exists());
        assert_eq!(get_commit_hash(&dest).unwrap(), feature_sha);
    }
}
