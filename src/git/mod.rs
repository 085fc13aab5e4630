//! Git operations the orchestrator and the sidecar need, over `git2`.
//!
//! Worktree-mutating operations (checkout, stash, reset, clean, commit) are
//! used by the primary process only. The sidecar uses the read-only history
//! helpers in [`history`].

pub mod history;
mod preserve;

pub use history::FileStat;
pub use preserve::{DEFAULT_PRESERVE, PreserveSet};

use anyhow::{Context, Result, bail};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, IndexAddOption, Oid, Repository, ResetType, Signature, StashFlags, Status,
    StatusOptions,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct GitOps {
    repo: Repository,
    workdir: PathBuf,
}

impl GitOps {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        let workdir = repo
            .workdir()
            .context("Repository has no working directory")?
            .to_path_buf();
        Ok(Self { repo, workdir })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn signature(&self) -> Result<Signature<'static>> {
        match self.repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("autosdd", "autosdd@localhost")?),
        }
    }

    /// Get the HEAD commit if it exists (None on an unborn branch)
    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Current HEAD SHA (None on an unborn branch)
    pub fn head_sha(&self) -> Option<String> {
        self.head_commit().map(|c| c.id().to_string())
    }

    /// Short name of the checked-out branch, None when detached.
    pub fn current_branch(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(str::to_string)
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Repo-relative paths with uncommitted changes, ignoring preserved ones.
    pub fn dirty_paths(&self, preserve: &PreserveSet) -> Result<Vec<(String, Status)>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .include_ignored(false)
            .recurse_untracked_dirs(true);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;

        Ok(statuses
            .iter()
            .filter_map(|entry| {
                let path = entry.path()?.to_string();
                let status = entry.status();
                if status.is_ignored() || preserve.matches(&path) {
                    return None;
                }
                Some((path, status))
            })
            .collect())
    }

    pub fn is_clean(&self, preserve: &PreserveSet) -> Result<bool> {
        Ok(self.dirty_paths(preserve)?.is_empty())
    }

    /// Stage and stash every non-preserved change so a checkout starts from a
    /// clean tree. Returns whether anything was stashed.
    pub fn stash_dirty(&mut self, message: &str, preserve: &PreserveSet) -> Result<bool> {
        if self.head_commit().is_none() || self.is_clean(preserve)? {
            return Ok(false);
        }
        self.stage_changes(preserve)?;
        let sig = self.signature()?;
        let oid = self
            .repo
            .stash_save(&sig, message, Some(StashFlags::DEFAULT))
            .context("Failed to stash uncommitted changes")?;
        info!(stash = %oid, "Stashed uncommitted changes before checkout");
        Ok(true)
    }

    fn resolve_commit(&self, rev: &str) -> Result<git2::Commit<'_>> {
        self.repo
            .revparse_single(rev)
            .with_context(|| format!("Unknown revision: {rev}"))?
            .peel_to_commit()
            .with_context(|| format!("Revision is not a commit: {rev}"))
    }

    /// Create (or reset) branch `name` at `from` and check it out.
    pub fn checkout_new_branch(&self, name: &str, from: &str) -> Result<()> {
        let commit = self.resolve_commit(from)?;
        if self.current_branch().as_deref() == Some(name) {
            // git refuses to force-move the checked-out branch
            return self.reset_hard(&commit.id().to_string());
        }
        self.repo
            .branch(name, &commit, true)
            .with_context(|| format!("Failed to create branch {name}"))?;
        self.checkout_branch(name)
    }

    pub fn checkout_branch(&self, name: &str) -> Result<()> {
        let refname = format!("refs/heads/{name}");
        let obj = self
            .repo
            .revparse_single(&refname)
            .with_context(|| format!("Branch not found: {name}"))?;
        self.repo
            .checkout_tree(&obj, Some(CheckoutBuilder::new().safe()))
            .with_context(|| format!("Failed to check out {name}"))?;
        self.repo.set_head(&refname)?;
        debug!(branch = name, "checked out branch");
        Ok(())
    }

    /// Reset tracked files and HEAD to `sha`.
    pub fn reset_hard(&self, sha: &str) -> Result<()> {
        let commit = self.resolve_commit(sha)?;
        self.repo
            .reset(commit.as_object(), ResetType::Hard, None)
            .with_context(|| format!("Failed to reset to {sha}"))?;
        debug!(sha, "hard reset");
        Ok(())
    }

    /// Remove untracked, non-ignored files, sparing anything matched by
    /// `preserve`, then any directories the removal left empty. Returns the
    /// removed file paths.
    pub fn clean_untracked(&self, preserve: &PreserveSet) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for (path, status) in self.dirty_paths(preserve)? {
            if !status.contains(Status::WT_NEW) {
                continue;
            }
            let full = self.workdir.join(&path);
            match fs::remove_file(&full) {
                Ok(()) => {
                    self.remove_empty_parents(&full);
                    removed.push(path);
                }
                Err(e) => warn!(path = %full.display(), error = %e, "Failed to remove untracked path"),
            }
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed untracked paths");
        }
        Ok(removed)
    }

    /// Remove `file`'s ancestors below the workdir while they are empty.
    fn remove_empty_parents(&self, file: &Path) {
        let mut dir = file.parent();
        while let Some(current) = dir {
            if current == self.workdir || !current.starts_with(&self.workdir) {
                break;
            }
            // fails, and stops the walk, on the first non-empty directory
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    /// Add every non-preserved change, including deletions, to the index.
    fn stage_changes(&self, preserve: &PreserveSet) -> Result<git2::Index> {
        let mut index = self.repo.index()?;
        let mut skip_preserved = |path: &Path, _spec: &[u8]| -> i32 {
            if preserve.matches(&path.to_string_lossy()) {
                1
            } else {
                0
            }
        };
        let cb: &mut git2::IndexMatchedPath<'_> = &mut skip_preserved;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, Some(&mut *cb))?;
        index.update_all(["*"].iter(), Some(&mut *cb))?;
        index.write()?;
        Ok(index)
    }

    fn commit_index(&self, index: &mut git2::Index, message: &str) -> Result<Option<String>> {
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;

        // Handle unborn branch (new repo with no commits yet)
        let commit_id = match self.head_commit() {
            Some(parent) if parent.tree_id() == tree_id => return Ok(None),
            Some(parent) => {
                self.repo
                    .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
            }
            None => self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };
        Ok(Some(commit_id.to_string()))
    }

    /// Commit every non-preserved change. `None` when there was nothing to
    /// commit.
    pub fn commit_all(&self, message: &str, preserve: &PreserveSet) -> Result<Option<String>> {
        let mut index = self.stage_changes(preserve)?;
        self.commit_index(&mut index, message)
    }

    /// Commit exactly `paths` (repo-relative), even when they are preserved or
    /// ignored.
    pub fn commit_paths(&self, paths: &[&Path], message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        for path in paths {
            if self.workdir.join(path).exists() {
                index
                    .add_path(path)
                    .with_context(|| format!("Failed to stage {}", path.display()))?;
            } else {
                index.remove_path(path).ok();
            }
        }
        index.write()?;
        self.commit_index(&mut index, message)
    }

    /// Delete local branches starting with `prefix` whose tip is already
    /// reachable from `into`. Returns the deleted names.
    pub fn prune_merged(&self, prefix: &str, into: &str) -> Result<Vec<String>> {
        let target = self.resolve_commit(into)?.id();
        let current = self.current_branch();
        let mut pruned = Vec::new();

        for entry in self.repo.branches(Some(BranchType::Local))? {
            let (mut branch, _) = entry?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            if !name.starts_with(prefix) || current.as_deref() == Some(name.as_str()) {
                continue;
            }
            let Some(tip) = branch.get().target() else {
                continue;
            };
            if self.is_merged(tip, target)? {
                branch.delete()?;
                pruned.push(name);
            }
        }

        if !pruned.is_empty() {
            info!(count = pruned.len(), into, "Pruned merged branches");
        }
        Ok(pruned)
    }

    fn is_merged(&self, tip: Oid, into: Oid) -> Result<bool> {
        Ok(tip == into || self.repo.graph_descendant_of(into, tip)?)
    }

    /// Assert the repo has at least one commit.
    pub fn require_head(&self) -> Result<String> {
        match self.head_sha() {
            Some(sha) => Ok(sha),
            None => bail!(
                "Repository at {} has no commits; create an initial commit first",
                self.workdir.display()
            ),
        }
    }
}
