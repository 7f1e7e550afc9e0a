//! Git plumbing for the supervised repository.
//!
//! Pulls are fast-forward only: a divergence is surfaced as a failure, never
//! merged silently on a supervisor host. A dirty tree is stashed first and
//! the stash is restored whether or not the pull succeeded.

use crate::exec::{CommandSpec, ExecOutput, run};
use crate::ProcResult;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Deadline for ordinary git plumbing calls.
const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// HEAD identity at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    /// Short (8 hex) SHA, or `"unknown"` when git is unavailable.
    pub sha: String,
    /// Seconds since the commit was authored; `None` means unknown
    /// (treated as infinitely old).
    pub age_seconds: Option<u64>,
}

impl CommitInfo {
    pub fn unknown() -> Self {
        Self {
            sha: "unknown".to_string(),
            age_seconds: None,
        }
    }
}

/// Result record for [`GitRepo::pull_ff`].
#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub success: bool,
    pub before: String,
    pub after: String,
    /// `--oneline` summaries of the commits pulled, newest first.
    pub commits: Vec<String>,
    pub stashed: bool,
    pub stash_restored: bool,
    pub error: Option<String>,
}

impl PullOutcome {
    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }
}

/// Handle to a git working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, args: &[&str]) -> ProcResult<ExecOutput> {
        run(&CommandSpec::new("git", args)
            .cwd(&self.dir)
            .timeout(GIT_TIMEOUT))
    }

    /// Full SHA of HEAD, empty string on failure.
    pub fn head_sha(&self) -> String {
        match self.git(&["rev-parse", "HEAD"]) {
            Ok(out) if out.success() => out.first_line(),
            _ => String::new(),
        }
    }

    /// Short SHA plus age of HEAD. Degrades to `unknown` without erroring so
    /// callers outside a repo still get a usable record.
    pub fn head_commit(&self) -> CommitInfo {
        let sha = match self.git(&["rev-parse", "--short=8", "HEAD"]) {
            Ok(out) if out.success() => out.first_line(),
            _ => return CommitInfo::unknown(),
        };

        let age_seconds = self
            .git(&["log", "-1", "--format=%ct"])
            .ok()
            .filter(|out| out.success())
            .and_then(|out| out.first_line().parse::<u64>().ok())
            .and_then(|commit_time| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .ok()?
                    .as_secs();
                Some(now.saturating_sub(commit_time))
            });

        CommitInfo { sha, age_seconds }
    }

    /// Whether the working tree has uncommitted changes.
    pub fn is_dirty(&self) -> bool {
        matches!(
            self.git(&["status", "--porcelain"]),
            Ok(out) if out.success() && !out.stdout.trim().is_empty()
        )
    }

    /// Paths changed between two SHAs.
    pub fn changed_paths(&self, before: &str, after: &str) -> Vec<String> {
        let range = format!("{before}..{after}");
        match self.git(&["diff", "--name-only", &range]) {
            Ok(out) if out.success() => lines(&out.stdout),
            _ => Vec::new(),
        }
    }

    /// Unified diff between two SHAs, scoped to one path.
    pub fn diff_scoped(&self, before: &str, after: &str, path: &str) -> String {
        let range = format!("{before}..{after}");
        match self.git(&["diff", &range, "--", path]) {
            Ok(out) if out.success() => out.stdout,
            _ => String::new(),
        }
    }

    /// `--oneline` summaries between two SHAs.
    pub fn log_oneline(&self, before: &str, after: &str) -> Vec<String> {
        let range = format!("{before}..{after}");
        match self.git(&["log", "--oneline", &range]) {
            Ok(out) if out.success() => lines(&out.stdout),
            _ => Vec::new(),
        }
    }

    fn stash_push(&self) -> bool {
        let message = format!("vigil auto-stash {}", Utc::now().format("%Y%m%d-%H%M%S"));
        matches!(
            self.git(&["stash", "push", "-m", &message]),
            Ok(out) if out.success()
        )
    }

    fn stash_pop(&self) -> bool {
        matches!(self.git(&["stash", "pop"]), Ok(out) if out.success())
    }

    /// Fast-forward-only pull with automatic stash/restore of a dirty tree.
    pub fn pull_ff(&self) -> PullOutcome {
        let before = self.head_sha();
        let mut stashed = false;
        let mut stash_restored = false;

        if self.is_dirty() {
            stashed = true;
            if !self.stash_push() {
                return PullOutcome {
                    success: false,
                    before: before.clone(),
                    after: before,
                    commits: Vec::new(),
                    stashed,
                    stash_restored,
                    error: Some("failed to stash local changes".to_string()),
                };
            }
        }

        let pull = self.git(&["pull", "--ff-only"]);
        let (pulled, pull_error) = match pull {
            Ok(out) if out.success() => (true, None),
            Ok(out) => (false, Some(out.combined())),
            Err(e) => (false, Some(e.to_string())),
        };

        // Restore local changes whether or not the pull succeeded; record
        // the pop outcome rather than resolving conflicts.
        if stashed {
            stash_restored = self.stash_pop();
            if !stash_restored {
                warn!(repo = %self.dir.display(), "stash pop failed after pull");
            }
        }

        if !pulled {
            return PullOutcome {
                success: false,
                before: before.clone(),
                after: before,
                commits: Vec::new(),
                stashed,
                stash_restored,
                error: pull_error.map(|e| format!("git pull --ff-only failed: {e}")),
            };
        }

        let after = self.head_sha();
        let commits = if before == after {
            Vec::new()
        } else {
            self.log_oneline(&before, &after)
        };

        info!(
            repo = %self.dir.display(),
            commits = commits.len(),
            stashed,
            "fast-forward pull completed"
        );

        PullOutcome {
            success: true,
            before,
            after,
            commits,
            stashed,
            stash_restored,
            error: None,
        }
    }

    /// `git revert HEAD --no-edit`. Returns the revert stderr on failure.
    pub fn revert_head(&self) -> Result<(), String> {
        match self.git(&["revert", "HEAD", "--no-edit"]) {
            Ok(out) if out.success() => {
                info!(repo = %self.dir.display(), "created revert commit");
                Ok(())
            }
            Ok(out) => Err(out.combined()),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Init a repo with one commit and a local committer identity.
    fn init_repo(dir: &Path) -> GitRepo {
        let repo = GitRepo::new(dir);
        git_ok(&repo, &["init", "-q", "-b", "main"]);
        git_ok(&repo, &["config", "user.email", "ops@vigil.test"]);
        git_ok(&repo, &["config", "user.name", "vigil tests"]);
        std::fs::write(dir.join("README.md"), "service\n").expect("write");
        git_ok(&repo, &["add", "."]);
        git_ok(&repo, &["commit", "-q", "-m", "initial"]);
        repo
    }

    fn git_ok(repo: &GitRepo, args: &[&str]) {
        let out = repo.git(args).expect("git run");
        assert!(out.success(), "git {:?} failed: {}", args, out.combined());
    }

    fn commit_file(repo: &GitRepo, name: &str, content: &str, message: &str) {
        std::fs::write(repo.dir().join(name), content).expect("write");
        git_ok(repo, &["add", "."]);
        git_ok(repo, &["commit", "-q", "-m", message]);
    }

    #[test]
    fn test_head_commit_fresh_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        let head = repo.head_commit();
        assert_eq!(head.sha.len(), 8);
        assert!(head.age_seconds.expect("age") < 60);
    }

    #[test]
    fn test_head_commit_outside_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = GitRepo::new(dir.path());
        let head = repo.head_commit();
        assert_eq!(head.sha, "unknown");
        assert_eq!(head.age_seconds, None);
    }

    #[test]
    fn test_dirty_detection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        assert!(!repo.is_dirty());
        std::fs::write(dir.path().join("README.md"), "edited\n").expect("write");
        assert!(repo.is_dirty());
    }

    #[test]
    fn test_changed_paths_and_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        let before = repo.head_sha();
        commit_file(&repo, "pyproject.toml", "[project]\n", "add pyproject");
        let after = repo.head_sha();

        assert_eq!(repo.changed_paths(&before, &after), vec!["pyproject.toml"]);
        let log = repo.log_oneline(&before, &after);
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("add pyproject"));
    }

    #[test]
    fn test_pull_ff_no_remote_changes_is_idempotent() {
        let upstream_dir = tempfile::tempdir().expect("tempdir");
        init_repo(upstream_dir.path());

        let clone_dir = tempfile::tempdir().expect("tempdir");
        let out = run(&CommandSpec::new(
            "git",
            &[
                "clone",
                "-q",
                upstream_dir.path().to_str().expect("path"),
                clone_dir.path().to_str().expect("path"),
            ],
        ))
        .expect("clone");
        assert!(out.success(), "{}", out.combined());

        let clone = GitRepo::new(clone_dir.path());
        let first = clone.pull_ff();
        let second = clone.pull_ff();

        assert!(first.success && second.success);
        assert_eq!(first.before, first.after);
        assert_eq!(second.before, second.after);
        assert_eq!(first.after, second.after);
        assert!(first.commits.is_empty() && second.commits.is_empty());
    }

    #[test]
    fn test_pull_ff_fetches_upstream_commits() {
        let upstream_dir = tempfile::tempdir().expect("tempdir");
        let upstream = init_repo(upstream_dir.path());

        let clone_dir = tempfile::tempdir().expect("tempdir");
        let out = run(&CommandSpec::new(
            "git",
            &[
                "clone",
                "-q",
                upstream_dir.path().to_str().expect("path"),
                clone_dir.path().to_str().expect("path"),
            ],
        ))
        .expect("clone");
        assert!(out.success(), "{}", out.combined());

        commit_file(&upstream, "feature.txt", "new\n", "add feature");

        let clone = GitRepo::new(clone_dir.path());
        let pull = clone.pull_ff();
        assert!(pull.success, "{:?}", pull.error);
        assert_eq!(pull.commit_count(), 1);
        assert_ne!(pull.before, pull.after);
    }

    #[test]
    fn test_pull_ff_stash_round_trip() {
        let upstream_dir = tempfile::tempdir().expect("tempdir");
        let upstream = init_repo(upstream_dir.path());

        let clone_dir = tempfile::tempdir().expect("tempdir");
        let out = run(&CommandSpec::new(
            "git",
            &[
                "clone",
                "-q",
                upstream_dir.path().to_str().expect("path"),
                clone_dir.path().to_str().expect("path"),
            ],
        ))
        .expect("clone");
        assert!(out.success(), "{}", out.combined());

        commit_file(&upstream, "feature.txt", "new\n", "add feature");

        // Dirty the clone with a local edit to a different file. Stashing
        // creates commit objects, so the clone needs an identity too.
        let clone = GitRepo::new(clone_dir.path());
        git_ok(&clone, &["config", "user.email", "ops@vigil.test"]);
        git_ok(&clone, &["config", "user.name", "vigil tests"]);
        std::fs::write(clone_dir.path().join("local-notes.txt"), "draft\n").expect("write");
        run(&CommandSpec::new("git", &["add", "local-notes.txt"]).cwd(clone_dir.path()))
            .expect("git add");

        let pull = clone.pull_ff();
        assert!(pull.success, "{:?}", pull.error);
        assert!(pull.stashed);
        assert!(pull.stash_restored);

        // The local modification survived the round trip.
        let restored =
            std::fs::read_to_string(clone_dir.path().join("local-notes.txt")).expect("read");
        assert_eq!(restored, "draft\n");
    }

    #[test]
    fn test_revert_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        commit_file(&repo, "broken.txt", "bad change\n", "bad commit");

        repo.revert_head().expect("revert");
        assert!(!dir.path().join("broken.txt").exists());
    }

    #[test]
    fn test_diff_scoped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(dir.path());
        commit_file(&repo, "pyproject.toml", "telethon==1.36.0\n", "pin telethon");
        let before = repo.head_sha();
        commit_file(&repo, "pyproject.toml", "telethon==1.37.0\n", "bump telethon");
        let after = repo.head_sha();

        let diff = repo.diff_scoped(&before, &after, "pyproject.toml");
        assert!(diff.contains("+telethon==1.37.0"));
        assert!(diff.contains("-telethon==1.36.0"));
    }
}
