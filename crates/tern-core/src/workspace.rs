//! Working-directory binding.
//!
//! Each conversation owns its working directory for the duration of a
//! turn: either the repository itself, or an isolated git worktree on a
//! per-conversation branch. After a turn completes, produced changes are
//! committed on that branch.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};

use crate::store::Conversation;

/// Result of binding a conversation to a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundWorkspace {
    pub path: PathBuf,
    /// Branch the conversation works on; `None` when bound to the
    /// repository's current checkout.
    pub branch: Option<String>,
}

/// Supplies working directories and commits produced changes.
pub trait WorkspaceBinder: Send + Sync {
    /// Ensures the conversation has a working directory, creating its
    /// worktree and branch on first use.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be provisioned.
    fn ensure_working_directory(&self, conversation: &Conversation) -> Result<BoundWorkspace>;

    /// Commits any changes under `path` on the conversation's branch.
    /// Returns the committed file paths; empty when the tree was clean.
    ///
    /// # Errors
    /// Returns an error if the commit fails.
    fn commit_changes(
        &self,
        conversation: &Conversation,
        path: &Path,
        message: &str,
    ) -> Result<Vec<String>>;
}

/// Binder that hands out the repository path as-is and never commits.
///
/// Used for conversations without worktree isolation and in tests.
#[derive(Debug, Default)]
pub struct NullBinder;

impl WorkspaceBinder for NullBinder {
    fn ensure_working_directory(&self, conversation: &Conversation) -> Result<BoundWorkspace> {
        Ok(BoundWorkspace {
            path: conversation.repo_path.clone(),
            branch: None,
        })
    }

    fn commit_changes(
        &self,
        _conversation: &Conversation,
        _path: &Path,
        _message: &str,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Binder backed by the git CLI.
#[derive(Debug, Default)]
pub struct GitBinder;

impl GitBinder {
    pub fn new() -> Self {
        Self
    }
}

impl WorkspaceBinder for GitBinder {
    fn ensure_working_directory(&self, conversation: &Conversation) -> Result<BoundWorkspace> {
        if !conversation.settings.use_worktree {
            return Ok(BoundWorkspace {
                path: conversation.repo_path.clone(),
                branch: None,
            });
        }

        let repo_root = git_root(&conversation.repo_path)?;
        let branch = branch_name_for(&conversation.id);
        let path = ensure_worktree(&repo_root, &conversation.id, &branch)?;
        Ok(BoundWorkspace {
            path,
            branch: Some(branch),
        })
    }

    fn commit_changes(
        &self,
        _conversation: &Conversation,
        path: &Path,
        message: &str,
    ) -> Result<Vec<String>> {
        run_git(path, &["add", "-A"]).context("git add")?;

        let staged = run_git(path, &["diff", "--cached", "--name-only"])?;
        let files: Vec<String> = staged
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if files.is_empty() {
            return Ok(Vec::new());
        }

        run_git(path, &["commit", "-m", message]).context("git commit")?;
        Ok(files)
    }
}

/// Ensures a worktree exists for the conversation, registered with git.
///
/// Idempotent: an already-registered worktree is returned as-is; a path
/// that exists but is not registered is an error rather than something to
/// silently adopt.
fn ensure_worktree(repo_root: &Path, id: &str, branch: &str) -> Result<PathBuf> {
    let worktree_path = worktree_path_for(repo_root, id);

    if is_worktree_registered(repo_root, &worktree_path)? {
        return Ok(worktree_path);
    }
    if worktree_path.exists() {
        bail!(
            "Worktree path exists but is not registered: {}",
            worktree_path.display()
        );
    }
    if let Some(parent) = worktree_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create worktree directory {}", parent.display()))?;
    }

    let path_arg = worktree_path.display().to_string();
    let add_result = if branch_exists(repo_root, branch)? {
        run_git(repo_root, &["worktree", "add", &path_arg, branch])
    } else {
        run_git(
            repo_root,
            &["worktree", "add", "-b", branch, &path_arg, "HEAD"],
        )
    };

    // A concurrent add may have won the race; registration is the truth.
    if let Err(err) = add_result {
        if is_worktree_registered(repo_root, &worktree_path)? {
            return Ok(worktree_path);
        }
        return Err(err);
    }
    if is_worktree_registered(repo_root, &worktree_path)? {
        return Ok(worktree_path);
    }
    Err(anyhow!(
        "Worktree creation did not register: {}",
        worktree_path.display()
    ))
}

fn git_root(path: &Path) -> Result<PathBuf> {
    let stdout = run_git(path, &["rev-parse", "--show-toplevel"])?;
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        bail!("git rev-parse returned empty repo root");
    }
    Ok(PathBuf::from(trimmed))
}

fn worktree_path_for(repo_root: &Path, id: &str) -> PathBuf {
    let parent = repo_root.parent().unwrap_or(repo_root);
    let repo_name = repo_root
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("repo");
    let hash = stable_hash(&repo_root.display().to_string());
    parent
        .join(".tern")
        .join("worktrees")
        .join(format!("{repo_name}-{hash}"))
        .join(sanitize_segment(id))
}

fn is_worktree_registered(repo_root: &Path, worktree_path: &Path) -> Result<bool> {
    let stdout = run_git(repo_root, &["worktree", "list", "--porcelain"])?;
    let target = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());
    Ok(stdout.lines().any(|line| {
        line.strip_prefix("worktree ").is_some_and(|rest| {
            let candidate = PathBuf::from(rest.trim());
            candidate.canonicalize().unwrap_or(candidate) == target
        })
    }))
}

fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let ref_name = format!("refs/heads/{branch}");
    let status = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(["show-ref", "--verify", "--quiet", &ref_name])
        .status()
        .context("git show-ref --verify")?;
    Ok(status.success())
}

fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(args)
        .output()
        .with_context(|| format!("git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Branch used for a conversation's commits.
pub fn branch_name_for(id: &str) -> String {
    format!("tern/{}", sanitize_segment(id))
}

fn sanitize_segment(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let trimmed = if trimmed.is_empty() {
        "conversation"
    } else {
        trimmed
    };
    trimmed.chars().take(64).collect()
}

fn stable_hash(input: &str) -> String {
    // FNV-1a 64-bit
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::backend::AgentKind;

    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn init_repo(path: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let status = Command::new("git")
                .arg("-C")
                .arg(path)
                .args(&args)
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        }
        fs::write(path.join("README.md"), "seed\n").unwrap();
        run_git(path, &["add", "-A"]).unwrap();
        run_git(path, &["commit", "-q", "-m", "seed"]).unwrap();
    }

    #[test]
    fn test_branch_name_sanitizes() {
        assert_eq!(branch_name_for("abc 123"), "tern/abc-123");
        assert_eq!(branch_name_for("///"), "tern/conversation");
    }

    #[test]
    fn test_null_binder_uses_repo_path() {
        let conversation =
            Conversation::new("c1", PathBuf::from("/tmp/repo"), AgentKind::Agent);
        let binder = NullBinder;
        let bound = binder.ensure_working_directory(&conversation).unwrap();
        assert_eq!(bound.path, PathBuf::from("/tmp/repo"));
        assert!(bound.branch.is_none());
        assert!(binder
            .commit_changes(&conversation, &bound.path, "msg")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_git_binder_without_worktree_setting_binds_repo() {
        let conversation =
            Conversation::new("c1", PathBuf::from("/tmp/repo"), AgentKind::Agent);
        let bound = GitBinder::new()
            .ensure_working_directory(&conversation)
            .unwrap();
        assert_eq!(bound.path, PathBuf::from("/tmp/repo"));
    }

    #[test]
    fn test_git_binder_provisions_worktree_and_commits() {
        if !git_available() {
            return;
        }
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        init_repo(&repo);

        let mut conversation = Conversation::new("conv-1", repo.clone(), AgentKind::Agent);
        conversation.settings.use_worktree = true;

        let binder = GitBinder::new();
        let bound = binder.ensure_working_directory(&conversation).unwrap();
        assert_eq!(bound.branch.as_deref(), Some("tern/conv-1"));
        assert!(bound.path.exists());

        // Idempotent on the second call.
        let again = binder.ensure_working_directory(&conversation).unwrap();
        assert_eq!(again.path, bound.path);

        // Clean tree commits nothing.
        assert!(binder
            .commit_changes(&conversation, &bound.path, "no-op")
            .unwrap()
            .is_empty());

        // Produced changes are committed on the conversation branch.
        fs::write(bound.path.join("new.txt"), "content\n").unwrap();
        let files = binder
            .commit_changes(&conversation, &bound.path, "agent changes")
            .unwrap();
        assert_eq!(files, vec!["new.txt".to_string()]);
    }
}
