//! Repository automation: mirror the remote, prepare a feature branch, write
//! the generated files, commit, push, and open (or reuse) a pull request.
//!
//! The git side is synchronous `git2` and runs on the blocking pool; only the
//! pull request calls are async.

use std::cell::RefCell;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, Cred, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::github::{CreatePullError, NewPullRequest, PullRequestHost};
use super::models::{GeneratedChange, GeneratedFile, PublishedChange};
use crate::config::EnhancerConfig;
use crate::errors::RepoError;

const REMOTE: &str = "origin";
const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Turns a change set into a pull request. Real implementation: `RepoAutomation`.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish(
        &self,
        summary: &str,
        change: &GeneratedChange,
    ) -> Result<PublishedChange, RepoError>;
}

/// Deterministic branch name for a request summary.
///
/// Lower-cases, collapses every run of non-ASCII-alphanumerics into one `-`,
/// trims, bounds the slug to `max_len` and adds `prefix`. A summary with no
/// usable characters falls back to `enhancement-<8 hex of sha256(summary)>`.
pub fn safe_branch_name(summary: &str, prefix: &str, max_len: usize) -> String {
    let slug = summary
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    // Slug is pure ASCII, so byte slicing is safe.
    let slug = if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    };

    if slug.is_empty() {
        let digest = Sha256::digest(summary.as_bytes());
        let hex: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
        format!("{}enhancement-{}", prefix, hex)
    } else {
        format!("{}{}", prefix, slug)
    }
}

/// Validate a generated path and normalize it to a checkout-relative path.
fn safe_relative_path(path: &str) -> Result<PathBuf, RepoError> {
    let unsafe_path = || RepoError::UnsafePath {
        path: path.to_string(),
    };
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(unsafe_path()),
        }
    }
    let first = out.components().next();
    if first.is_none() || first.is_some_and(|c| c.as_os_str() == ".git") {
        return Err(unsafe_path());
    }
    Ok(out)
}

/// Where and as whom the git side operates.
#[derive(Debug, Clone)]
pub struct GitSettings {
    pub remote_url: String,
    pub checkout_path: PathBuf,
    pub default_branch: String,
    pub token: Option<String>,
    pub author_name: String,
    pub author_email: String,
}

/// Result of the git half of publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBranch {
    pub committed: bool,
    pub pushed: bool,
}

/// Synchronous git2 operations on the single configured checkout.
pub struct GitWorkspace {
    settings: GitSettings,
}

impl GitWorkspace {
    pub fn new(settings: GitSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GitSettings {
        &self.settings
    }

    fn sync_err(&self, message: impl std::fmt::Display) -> RepoError {
        RepoError::Sync {
            path: self.settings.checkout_path.clone(),
            message: message.to_string(),
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = self.settings.token.as_deref() {
            let mut attempts = 0;
            callbacks.credentials(move |_url, _username, _allowed| {
                attempts += 1;
                if attempts > MAX_CREDENTIAL_ATTEMPTS {
                    return Err(git2::Error::from_str("credentials rejected by remote"));
                }
                Cred::userpass_plaintext("x-access-token", token)
            });
        }
        callbacks
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks());
        options.prune(git2::FetchPrune::On);
        options
    }

    fn clone_fresh(&self) -> Result<Repository, RepoError> {
        let path = &self.settings.checkout_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.sync_err(e))?;
        }
        info!(path = %path.display(), "cloning repository");
        RepoBuilder::new()
            .fetch_options(self.fetch_options())
            .clone(&self.settings.remote_url, path)
            .map_err(|e| self.sync_err(format!("clone failed: {}", e.message())))
    }

    /// Step 1: make the checkout a clean mirror of the remote default branch.
    ///
    /// A valid repository is fetched and its default branch reset to the
    /// remote tip; an invalid one is removed and re-cloned.
    pub fn ensure_checkout(&self) -> Result<Repository, RepoError> {
        let path = &self.settings.checkout_path;
        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(e) if path.exists() => {
                warn!(path = %path.display(), "checkout is not a usable repository ({}); re-cloning", e.message());
                std::fs::remove_dir_all(path).map_err(|e| self.sync_err(e))?;
                self.clone_fresh()?
            }
            Err(_) => self.clone_fresh()?,
        };

        repo.remote_set_url(REMOTE, &self.settings.remote_url)
            .map_err(|e| self.sync_err(e.message()))?;
        {
            let mut remote = repo
                .find_remote(REMOTE)
                .map_err(|e| self.sync_err(e.message()))?;
            remote
                .fetch(
                    &["+refs/heads/*:refs/remotes/origin/*"],
                    Some(&mut self.fetch_options()),
                    None,
                )
                .map_err(|e| self.sync_err(format!("fetch failed: {}", e.message())))?;
        }

        let default = &self.settings.default_branch;
        let remote_tip = self.remote_tip(&repo, default).ok_or_else(|| {
            self.sync_err(format!("remote has no branch '{}'", default))
        })?;

        let local_ref = format!("refs/heads/{}", default);
        if let Ok(local) = repo.refname_to_id(&local_ref)
            && local != remote_tip
            && !repo.graph_descendant_of(remote_tip, local).unwrap_or(false)
        {
            warn!(branch = %default, "local default branch diverged from remote; resetting");
        }
        repo.reference(&local_ref, remote_tip, true, "enhancer: sync default branch")
            .map_err(|e| self.sync_err(e.message()))?;
        self.switch_to(&repo, default)
            .map_err(|e| self.sync_err(e.message()))?;

        debug!(branch = %default, tip = %remote_tip, "checkout synced");
        Ok(repo)
    }

    fn remote_tip(&self, repo: &Repository, branch: &str) -> Option<Oid> {
        repo.refname_to_id(&format!("refs/remotes/{}/{}", REMOTE, branch))
            .ok()
    }

    fn switch_to(&self, repo: &Repository, branch: &str) -> Result<(), git2::Error> {
        repo.set_head(&format!("refs/heads/{}", branch))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force().remove_untracked(true)))
    }

    /// Step 2: check out `branch`, creating it when needed.
    ///
    /// Preference: existing local branch (fast-forwarded to the remote copy
    /// when the remote is ahead), then the remote branch, then the default tip.
    pub fn ensure_branch(&self, repo: &Repository, branch: &str) -> Result<(), RepoError> {
        let branch_err = |message: &str| RepoError::Branch {
            branch: branch.to_string(),
            message: message.to_string(),
        };
        let local_ref = format!("refs/heads/{}", branch);
        let remote_tip = self.remote_tip(repo, branch);

        let target = match (repo.refname_to_id(&local_ref).ok(), remote_tip) {
            (Some(local), Some(remote))
                if local != remote
                    && repo.graph_descendant_of(remote, local).unwrap_or(false) =>
            {
                debug!(branch, "fast-forwarding local branch to remote");
                remote
            }
            (Some(local), _) => local,
            (None, Some(remote)) => remote,
            (None, None) => self
                .remote_tip(repo, &self.settings.default_branch)
                .ok_or_else(|| branch_err("default branch tip is missing"))?,
        };

        repo.reference(&local_ref, target, true, "enhancer: prepare branch")
            .map_err(|e| branch_err(e.message()))?;
        self.switch_to(repo, branch)
            .map_err(|e| branch_err(e.message()))?;
        Ok(())
    }

    /// Reject `rel` when any component that already exists under the
    /// checkout is a symlink; writing through it could land outside the tree.
    fn reject_symlinked(&self, rel: &Path, original: &str) -> Result<(), RepoError> {
        let mut current = self.settings.checkout_path.clone();
        for component in rel.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(RepoError::UnsafePath {
                        path: original.to_string(),
                    });
                }
                Ok(_) => {}
                // Nothing below a missing component exists yet.
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Step 3: write every file in full. Returns the checkout-relative paths.
    pub fn materialize(&self, files: &[GeneratedFile]) -> Result<Vec<PathBuf>, RepoError> {
        // Validate everything before touching the tree.
        let relative = files
            .iter()
            .map(|f| -> Result<PathBuf, RepoError> {
                let rel = safe_relative_path(&f.path)?;
                self.reject_symlinked(&rel, &f.path)?;
                Ok(rel)
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (rel, file) in relative.iter().zip(files) {
            let full = self.settings.checkout_path.join(rel);
            let io_err = |source| RepoError::Materialize {
                path: full.clone(),
                source,
            };
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
            std::fs::write(&full, &file.content).map_err(io_err)?;
        }
        Ok(relative)
    }

    /// Step 4: stage exactly `paths` and commit. `None` when the tree did
    /// not change.
    pub fn commit(
        &self,
        repo: &Repository,
        branch: &str,
        paths: &[PathBuf],
        message: &str,
    ) -> Result<Option<Oid>, RepoError> {
        let commit_err = |e: git2::Error| RepoError::Commit {
            branch: branch.to_string(),
            message: e.message().to_string(),
        };

        let mut index = repo.index().map_err(commit_err)?;
        for path in paths {
            index.add_path(path).map_err(commit_err)?;
        }
        index.write().map_err(commit_err)?;
        let tree_id = index.write_tree().map_err(commit_err)?;

        let parent = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(commit_err)?;
        if parent.tree_id() == tree_id {
            debug!(branch, "generated files match the branch; skipping commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id).map_err(commit_err)?;
        let sig = git2::Signature::now(&self.settings.author_name, &self.settings.author_email)
            .map_err(commit_err)?;
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .map_err(commit_err)?;
        info!(branch, commit = %oid, files = paths.len(), "committed generated change");
        Ok(Some(oid))
    }

    /// Step 5: push `branch` and record its upstream.
    pub fn push(&self, repo: &Repository, branch: &str) -> Result<(), RepoError> {
        let push_err = |message: String| RepoError::Push {
            branch: branch.to_string(),
            message,
        };

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let mut callbacks = self.callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(status) = status {
                *rejection.borrow_mut() = Some(format!("{}: {}", refname, status));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        let mut remote = repo
            .find_remote(REMOTE)
            .map_err(|e| push_err(e.message().to_string()))?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .map_err(|e| push_err(e.message().to_string()))?;
        if let Some(message) = rejection.take() {
            return Err(push_err(message));
        }

        // Cosmetic; the push itself succeeded.
        if let Err(e) = repo
            .find_branch(branch, BranchType::Local)
            .and_then(|mut b| b.set_upstream(Some(format!("{}/{}", REMOTE, branch).as_str())))
        {
            warn!(branch, "could not set upstream: {}", e.message());
        }
        info!(branch, "pushed branch");
        Ok(())
    }

    /// Steps 1-5 for one change set.
    pub fn prepare(
        &self,
        branch: &str,
        files: &[GeneratedFile],
        message: &str,
    ) -> Result<PreparedBranch, RepoError> {
        let repo = self.ensure_checkout()?;
        self.ensure_branch(&repo, branch)?;
        let paths = self.materialize(files)?;
        let committed = self.commit(&repo, branch, &paths, message)?.is_some();

        let local_tip = repo
            .refname_to_id(&format!("refs/heads/{}", branch))
            .map_err(|e| RepoError::Branch {
                branch: branch.to_string(),
                message: e.message().to_string(),
            })?;
        let default = &self.settings.default_branch;
        let no_changes = self.remote_tip(&repo, default).is_some_and(|base| {
            base == local_tip || repo.graph_descendant_of(base, local_tip).unwrap_or(false)
        });
        if no_changes {
            return Err(RepoError::NoChanges {
                branch: branch.to_string(),
                base: default.clone(),
            });
        }

        let pushed = self.remote_tip(&repo, branch) != Some(local_tip);
        if pushed {
            self.push(&repo, branch)?;
        } else {
            debug!(branch, "remote branch already up to date; skipping push");
        }
        Ok(PreparedBranch { committed, pushed })
    }
}

/// Async publisher: git steps on the blocking pool, then the pull request.
pub struct RepoAutomation {
    workspace: Arc<GitWorkspace>,
    host: Arc<dyn PullRequestHost>,
    branch_prefix: String,
    branch_max_len: usize,
    risky_paths: Vec<glob::Pattern>,
}

impl RepoAutomation {
    pub fn new(
        settings: GitSettings,
        host: Arc<dyn PullRequestHost>,
        branch_prefix: &str,
        branch_max_len: usize,
        risky_paths: &[String],
    ) -> Self {
        let risky_paths = risky_paths
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, "ignoring invalid risky path pattern: {}", e);
                    None
                }
            })
            .collect();
        Self {
            workspace: Arc::new(GitWorkspace::new(settings)),
            host,
            branch_prefix: branch_prefix.to_string(),
            branch_max_len,
            risky_paths,
        }
    }

    pub fn from_config(
        config: &EnhancerConfig,
        host: Arc<dyn PullRequestHost>,
    ) -> anyhow::Result<Self> {
        let repo = &config.toml.repository;
        let remote_url = repo.remote_url.clone().ok_or_else(|| {
            anyhow::anyhow!("repository.remote_url is not set (export ENHANCER_REMOTE_URL)")
        })?;
        let settings = GitSettings {
            remote_url,
            checkout_path: config.checkout_path(),
            default_branch: repo.default_branch.clone(),
            token: repo.token.clone(),
            author_name: repo.author_name.clone(),
            author_email: repo.author_email.clone(),
        };
        Ok(Self::new(
            settings,
            host,
            &repo.branch_prefix,
            repo.branch_max_len,
            &repo.risky_paths,
        ))
    }

    pub fn branch_for(&self, summary: &str) -> String {
        safe_branch_name(summary, &self.branch_prefix, self.branch_max_len)
    }

    /// True when any file in the change matches a risky path pattern.
    pub fn is_risky(&self, change: &GeneratedChange) -> bool {
        change.files.iter().any(|f| {
            let path = f.path.trim_start_matches("./");
            self.risky_paths.iter().any(|p| p.matches(path))
        })
    }

    async fn open_pull_request(&self, request: NewPullRequest) -> Result<(String, bool), RepoError> {
        let pr_err = |message: String| RepoError::PullRequest {
            branch: request.head.clone(),
            message,
        };
        match self.host.create_pull_request(&request).await {
            Ok(pr) => {
                info!(branch = %request.head, url = %pr.html_url, draft = pr.draft, "opened pull request");
                Ok((pr.html_url, false))
            }
            Err(CreatePullError::AlreadyExists(_)) => {
                match self
                    .host
                    .find_open_pull_request(&request.head, &request.base)
                    .await
                {
                    Ok(Some(pr)) => {
                        info!(branch = %request.head, url = %pr.html_url, "reusing open pull request");
                        Ok((pr.html_url, true))
                    }
                    Ok(None) => Err(pr_err(
                        "host reported an existing pull request but none is open".to_string(),
                    )),
                    Err(e) => Err(pr_err(format!("{:#}", e))),
                }
            }
            Err(e) => Err(pr_err(e.to_string())),
        }
    }
}

#[async_trait]
impl ChangePublisher for RepoAutomation {
    async fn publish(
        &self,
        summary: &str,
        change: &GeneratedChange,
    ) -> Result<PublishedChange, RepoError> {
        let branch = self.branch_for(summary);
        let message = if change.commit_message.trim().is_empty() {
            summary.to_string()
        } else {
            change.commit_message.clone()
        };

        let workspace = self.workspace.clone();
        let files = change.files.clone();
        let git_branch = branch.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            workspace.prepare(&git_branch, &files, &message)
        })
        .await
        .map_err(|e| RepoError::Task(e.to_string()))??;

        let draft = self.is_risky(change);
        if draft {
            info!(branch = %branch, "change touches risky paths; opening as draft");
        }
        let title = if change.pr_title.trim().is_empty() {
            summary.to_string()
        } else {
            change.pr_title.clone()
        };
        let request = NewPullRequest {
            title,
            body: change.pr_body.clone(),
            head: branch.clone(),
            base: self.workspace.settings().default_branch.clone(),
            draft,
        };
        let (pr_url, reused_pr) = self.open_pull_request(request).await?;

        Ok(PublishedChange {
            branch,
            pr_url,
            committed: prepared.committed,
            reused_pr,
        })
    }
}
