use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{CommitGraph, Vcs};
use super::process::{CommandOutput, Invocation};
use crate::error::{PipelineError, Result};
use crate::identity::PatchSource;
use crate::pipeline::StageKind;

const MERGE_LOG: &str = "merge.log";

/// A kernel tree managed with the `git` CLI.
pub struct GitTree {
    tree: PathBuf,
    patch_dir: PathBuf,
    downloaded: usize,
}

impl GitTree {
    pub fn new(tree: impl Into<PathBuf>, patch_dir: impl Into<PathBuf>) -> Self {
        Self {
            tree: tree.into(),
            patch_dir: patch_dir.into(),
            downloaded: 0,
        }
    }

    fn git(&self) -> Invocation {
        Invocation::new(StageKind::Merge, "git")
            .current_dir(&self.tree)
            .env("GIT_COMMITTER_NAME", "kpatch-ci")
            .env("GIT_COMMITTER_EMAIL", "kpatch-ci@localhost")
    }

    fn git_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let invocation = self.git().args(args.iter().copied());
        let output = invocation.run()?;
        if !output.succeeded() {
            return Err(PipelineError::environment(
                StageKind::Merge,
                format!("`{}` failed: {}", invocation.command_line(), output.describe_failure()),
            ));
        }
        Ok(output)
    }

    fn resolve(&self, reference: &str) -> Result<String> {
        for candidate in [format!("origin/{reference}"), reference.to_string()] {
            let output = self
                .git()
                .args(["rev-parse", "--verify", "--quiet"])
                .arg(format!("{candidate}^{{commit}}"))
                .run()?;
            if output.succeeded() {
                return Ok(output.stdout.trim().to_string());
            }
        }
        Err(PipelineError::environment(
            StageKind::Merge,
            format!("reference '{reference}' does not exist in {}", self.tree.display()),
        ))
    }

    /// Local path of a patch, downloading the mbox of remote ones.
    fn materialise(&mut self, patch: &PatchSource) -> Result<PathBuf> {
        match patch {
            PatchSource::Local(path) => {
                if !path.is_file() {
                    return Err(PipelineError::environment(
                        StageKind::Merge,
                        format!("patch file {} does not exist", path.display()),
                    ));
                }
                fs::canonicalize(path).map_err(|err| PipelineError::io(path, err))
            }
            PatchSource::Remote(url) => {
                let mbox_url = format!("{}/mbox/", url.trim_end_matches('/'));
                debug!(url = %mbox_url, "Downloading patch");
                let body = reqwest::blocking::get(&mbox_url)
                    .and_then(|response| response.error_for_status())
                    .and_then(|response| response.text())
                    .map_err(|err| {
                        PipelineError::environment(
                            StageKind::Merge,
                            format!("failed to download {mbox_url}: {err}"),
                        )
                    })?;

                fs::create_dir_all(&self.patch_dir)
                    .map_err(|err| PipelineError::io(&self.patch_dir, err))?;
                self.downloaded += 1;
                let target = self.patch_dir.join(format!("{:04}.mbox", self.downloaded));
                fs::write(&target, body).map_err(|err| PipelineError::io(&target, err))?;
                fs::canonicalize(&target).map_err(|err| PipelineError::io(&target, err))
            }
        }
    }

    fn log_path(&self) -> PathBuf {
        self.patch_dir.join(MERGE_LOG)
    }
}

impl Vcs for GitTree {
    fn fetch(&mut self, repo: &str, reference: &str, depth: Option<u32>) -> Result<()> {
        if !self.tree.join(".git").exists() {
            fs::create_dir_all(&self.tree).map_err(|err| PipelineError::io(&self.tree, err))?;
            self.git_checked(&["init", "-q"])?;
        }

        let has_origin = self.git().args(["remote", "get-url", "origin"]).run()?;
        if has_origin.succeeded() {
            self.git_checked(&["remote", "set-url", "origin", repo])?;
        } else {
            self.git_checked(&["remote", "add", "origin", repo])?;
        }

        let mut fetch = self.git().args(["fetch", "-q", "--no-tags"]);
        if let Some(depth) = depth {
            fetch = fetch.arg(format!("--depth={depth}"));
        }
        let fetch = fetch.args(["origin", "+refs/heads/*:refs/remotes/origin/*"]);
        let output = fetch.run()?;
        if !output.succeeded() {
            return Err(PipelineError::environment(
                StageKind::Merge,
                format!("fetching {repo} failed: {}", output.describe_failure()),
            ));
        }
        info!(repo, reference, "Fetched base repository");
        Ok(())
    }

    fn checkout(&mut self, reference: &str) -> Result<String> {
        let commit = self.resolve(reference)?;
        self.git_checked(&["checkout", "-q", "--force", "--detach", &commit])?;
        self.git_checked(&["clean", "-q", "-d", "-f", "-x"])?;
        let _ = fs::remove_file(self.log_path());
        Ok(commit)
    }

    fn apply_patch(&mut self, patch: &PatchSource) -> Result<()> {
        let file = self.materialise(patch)?;
        let log = self.log_path();
        let output = self
            .git()
            .args(["am", "-q"])
            .arg(file.to_string_lossy())
            .log(&log)
            .run()?;
        if output.succeeded() {
            return Ok(());
        }

        warn!(patch = %patch, "Patch does not apply");
        let abort = self.git().args(["am", "--abort"]).log(&log).run()?;
        if !abort.succeeded() {
            warn!(error = %abort.describe_failure(), "git am --abort failed");
        }
        Err(PipelineError::MergeConflict {
            patch: patch.id(),
            commit: self.head().unwrap_or_default(),
            log: Some(log),
        })
    }

    fn head(&self) -> Result<String> {
        Ok(self.git_checked(&["rev-parse", "HEAD"])?.stdout.trim().to_string())
    }

    fn commit_date(&self, commit: &str) -> Result<i64> {
        let output = self.git_checked(&["show", "-s", "--format=%ct", commit])?;
        output.stdout.trim().parse().map_err(|_| {
            PipelineError::environment(
                StageKind::Merge,
                format!("unexpected commit date for {commit}: '{}'", output.stdout.trim()),
            )
        })
    }

    fn tree_path(&self) -> &Path {
        &self.tree
    }

    fn merge_log(&self) -> Option<PathBuf> {
        let log = self.log_path();
        log.exists().then_some(log)
    }
}

fn exclusions(bad: &str, good: &[String]) -> Vec<String> {
    std::iter::once(bad.to_string())
        .chain(good.iter().map(|commit| format!("^{commit}")))
        .collect()
}

fn commit_lines(stdout: &str) -> impl Iterator<Item = String> + '_ {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Walks the whole history graph, merged side branches included.
impl CommitGraph for GitTree {
    fn candidates(&self, bad: &str, good: &[String]) -> Result<Vec<String>> {
        let mut args = vec!["rev-list".to_string(), "--reverse".into(), "--topo-order".into()];
        args.extend(exclusions(bad, good));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.git_checked(&args)?;
        Ok(commit_lines(&output.stdout).collect())
    }

    /// `rev-list --bisect-all` lists the candidates best split first.
    fn midpoint(&self, bad: &str, good: &[String], exclude: &[String]) -> Result<Option<String>> {
        let mut args = vec!["rev-list".to_string(), "--bisect-all".into()];
        args.extend(exclusions(bad, good));
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.git_checked(&args)?;
        Ok(commit_lines(&output.stdout).find(|commit| !exclude.contains(commit)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(dir: &Path, script: &str) {
        let status = std::process::Command::new("sh")
            .args(["-c", script])
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "{script}");
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok()
    }

    /// Upstream repo with three commits on master touching `file`.
    fn upstream(root: &Path) -> PathBuf {
        let repo = root.join("upstream");
        fs::create_dir_all(&repo).unwrap();
        sh(
            &repo,
            "git init -q -b master . && \
             git config user.name t && git config user.email t@t && \
             echo one > file && git add file && git commit -qm one && \
             echo two >> file && git commit -qam two && \
             echo three >> file && git commit -qam three",
        );
        repo
    }

    #[test]
    fn checkout_range_and_conflicting_patch() {
        if !git_available() {
            return;
        }
        let temp = tempdir().unwrap();
        let repo = upstream(temp.path());
        let mut tree = GitTree::new(temp.path().join("tree"), temp.path().join("patches"));

        tree.fetch(&repo.to_string_lossy(), "master", None).unwrap();
        let head = tree.checkout("master").unwrap();
        assert_eq!(tree.head().unwrap(), head);
        assert!(tree.commit_date(&head).unwrap() > 0);

        let base = tree.checkout("master~2").unwrap();
        let range = tree.candidates(&head, &[base]).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range.last().unwrap(), &head);
        tree.checkout("master").unwrap();

        let bogus = temp.path().join("bogus.patch");
        fs::write(
            &bogus,
            "From 0000000000000000000000000000000000000000 Mon Sep 17 00:00:00 2001\n\
             From: t <t@t>\nSubject: [PATCH] bogus\n\n---\n\
             diff --git a/file b/file\n--- a/file\n+++ b/file\n@@ -1 +1 @@\n-nothing\n+else\n",
        )
        .unwrap();
        let err = tree
            .apply_patch(&PatchSource::Local(bogus.clone()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::MergeConflict { .. }));
        assert_eq!(tree.head().unwrap(), head);
        assert!(tree.merge_log().is_some());
    }

    #[test]
    fn merged_side_branch_commits_are_candidates() {
        if !git_available() {
            return;
        }
        let temp = tempdir().unwrap();
        let repo = temp.path().join("upstream");
        fs::create_dir_all(&repo).unwrap();
        sh(
            &repo,
            "git init -q -b master . && \
             git config user.name t && git config user.email t@t && \
             echo one > file && git add file && git commit -qm one && \
             git checkout -qb side && echo s > side && git add side && git commit -qm side && \
             git checkout -q master && echo m > main && git add main && git commit -qm main && \
             git merge -q --no-edit -m merge side",
        );
        let mut tree = GitTree::new(temp.path().join("tree"), temp.path().join("patches"));
        tree.fetch(&repo.to_string_lossy(), "master", None).unwrap();
        let side = tree.checkout("master^2").unwrap();
        let main = tree.checkout("master~1").unwrap();
        let base = tree.checkout("master~2").unwrap();
        let merge = tree.checkout("master").unwrap();

        let candidates = tree.candidates(&merge, &[base.clone()]).unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.contains(&side), "{candidates:?}");
        assert_eq!(candidates.last(), Some(&merge));

        let next = tree
            .midpoint(&merge, &[base.clone()], &[merge.clone()])
            .unwrap()
            .unwrap();
        assert!(next == side || next == main, "{next}");

        // Once the side branch is known good, only the mainline commit is left.
        let next = tree
            .midpoint(&merge, &[base, side], &[merge.clone()])
            .unwrap();
        assert_eq!(next, Some(main));
    }
}
