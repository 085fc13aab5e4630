//! Read-only history queries used by the evaluation sidecar.

use super::GitOps;
use anyhow::{Context, Result};
use git2::{DiffFormat, ObjectType, Oid, Sort, TreeWalkMode, TreeWalkResult};
use regex::Regex;

/// Per-file line counts of one commit's diff against its first parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    pub added: usize,
    pub removed: usize,
}

impl GitOps {
    fn find_commit(&self, sha: &str) -> Result<git2::Commit<'_>> {
        let oid = Oid::from_str(sha).with_context(|| format!("Invalid commit id: {sha}"))?;
        self.repo
            .find_commit(oid)
            .with_context(|| format!("Commit not found: {sha}"))
    }

    /// Non-merge commits reachable from `until` but not from `since`, oldest
    /// first.
    pub fn commits_between(&self, since: &str, until: &str) -> Result<Vec<String>> {
        let mut walk = self.repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        walk.push(Oid::from_str(until)?)?;
        walk.hide(Oid::from_str(since)?)?;

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid?;
            if self.repo.find_commit(oid)?.parent_count() > 1 {
                continue;
            }
            commits.push(oid.to_string());
        }
        Ok(commits)
    }

    /// First line of the commit message.
    pub fn commit_summary(&self, sha: &str) -> Result<String> {
        let commit = self.find_commit(sha)?;
        Ok(commit.summary().unwrap_or_default().to_string())
    }

    pub fn parent_count(&self, sha: &str) -> Result<usize> {
        Ok(self.find_commit(sha)?.parent_count())
    }

    /// First parent SHA, None for a root commit.
    pub fn first_parent(&self, sha: &str) -> Result<Option<String>> {
        let commit = self.find_commit(sha)?;
        Ok(commit.parent_id(0).ok().map(|oid| oid.to_string()))
    }

    fn commit_diff(&self, sha: &str) -> Result<git2::Diff<'_>> {
        let commit = self.find_commit(sha)?;
        let new_tree = commit.tree()?;
        let old_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        Ok(self
            .repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), None)?)
    }

    /// Per-file added/removed line counts for `sha`.
    pub fn diff_numstat(&self, sha: &str) -> Result<Vec<FileStat>> {
        let diff = self.commit_diff(sha)?;
        let mut stats = Vec::new();

        for idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(idx) else {
                continue;
            };
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let (added, removed) = match git2::Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, added, removed) = patch.line_stats()?;
                    (added, removed)
                }
                // binary files carry no line stats
                None => (0, 0),
            };
            stats.push(FileStat {
                path: path.to_string_lossy().to_string(),
                added,
                removed,
            });
        }
        Ok(stats)
    }

    /// Unified diff text for `sha`, with `+`/`-`/` ` line prefixes.
    pub fn diff_text(&self, sha: &str) -> Result<String> {
        let diff = self.commit_diff(sha)?;
        let mut buf = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                buf.push(line.origin() as u8);
            }
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    /// Whether a `.ts`/`.tsx` file in `sha`'s tree already declares a type
    /// or interface named `name`.
    pub fn type_declared_in_tree(&self, sha: &str, name: &str) -> Result<bool> {
        let tree = self.find_commit(sha)?.tree()?;
        let pattern = Regex::new(&format!(r"(?:type|interface)\s+{}\b", regex::escape(name)))?;

        let mut blobs = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |_root, entry| {
            let is_ts = entry
                .name()
                .is_some_and(|n| n.ends_with(".ts") || n.ends_with(".tsx"));
            if is_ts && entry.kind() == Some(ObjectType::Blob) {
                blobs.push(entry.id());
            }
            TreeWalkResult::Ok
        })?;

        for id in blobs {
            let blob = self.repo.find_blob(id)?;
            if let Ok(text) = std::str::from_utf8(blob.content())
                && pattern.is_match(text)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{commit_file, init_repo};
    use super::*;
    use git2::{Repository, Signature};
    use std::path::Path;
    use tempfile::tempdir;

    fn setup() -> (GitOps, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let git = GitOps::open(dir.path()).unwrap();
        (git, dir)
    }

    fn merge_commit(dir: &Path, other: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let other = repo.find_commit(Oid::from_str(other).unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let tree = head.tree().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Merge", &tree, &[&head, &other])
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_commits_between_oldest_first_skipping_merges() {
        let (git, dir) = setup();
        let start = commit_file(dir.path(), "a.txt", "1", "init");
        let c1 = commit_file(dir.path(), "b.txt", "2", "feat: one");
        let c2 = commit_file(dir.path(), "c.txt", "3", "feat: two");
        merge_commit(dir.path(), &start);
        let c3 = commit_file(dir.path(), "d.txt", "4", "feat: three");

        let commits = git.commits_between(&start, &c3).unwrap();
        assert_eq!(commits, vec![c1, c2, c3]);
    }

    #[test]
    fn test_commits_between_same_commit_is_empty() {
        let (git, dir) = setup();
        let sha = commit_file(dir.path(), "a.txt", "1", "init");
        assert!(git.commits_between(&sha, &sha).unwrap().is_empty());
    }

    #[test]
    fn test_summary_and_parents() {
        let (git, dir) = setup();
        let root = commit_file(dir.path(), "a.txt", "1", "init");
        let sha = commit_file(dir.path(), "b.txt", "2", "feat: Auth: Signup\n\nbody");
        assert_eq!(git.commit_summary(&sha).unwrap(), "feat: Auth: Signup");
        assert_eq!(git.parent_count(&sha).unwrap(), 1);
        assert_eq!(git.first_parent(&sha).unwrap(), Some(root.clone()));
        assert_eq!(git.first_parent(&root).unwrap(), None);
    }

    #[test]
    fn test_diff_numstat_counts_lines() {
        let (git, dir) = setup();
        commit_file(dir.path(), "a.txt", "one\ntwo\n", "init");
        let sha = commit_file(dir.path(), "a.txt", "one\nthree\nfour\n", "edit");

        let stats = git.diff_numstat(&sha).unwrap();
        assert_eq!(
            stats,
            vec![FileStat {
                path: "a.txt".into(),
                added: 2,
                removed: 1
            }]
        );
    }

    #[test]
    fn test_diff_text_has_prefixes() {
        let (git, dir) = setup();
        commit_file(dir.path(), "a.ts", "import x from 'x';\n", "init");
        let sha = commit_file(
            dir.path(),
            "a.ts",
            "import x from 'x';\nimport y from 'y';\n",
            "edit",
        );
        let text = git.diff_text(&sha).unwrap();
        assert!(text.contains("+import y from 'y';"));
        assert!(text.contains("+++ b/a.ts"));
    }

    #[test]
    fn test_type_declared_in_tree() {
        let (git, dir) = setup();
        let sha = commit_file(
            dir.path(),
            "src/types.ts",
            "export interface UserProfile {\n  id: string;\n}\n",
            "init",
        );
        assert!(git.type_declared_in_tree(&sha, "UserProfile").unwrap());
        assert!(!git.type_declared_in_tree(&sha, "User").unwrap());
        assert!(!git.type_declared_in_tree(&sha, "Missing").unwrap());
    }
}
