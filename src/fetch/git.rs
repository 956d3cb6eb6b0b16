use std::path::Path;

use git2::{AutotagOption, ErrorClass, ErrorCode, FetchOptions, Oid, RemoteCallbacks, Repository};
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{GitLock, GitRef};
use crate::utils::{self, CancelToken};

/// Resolves `git_ref` (branch, tag, or commit-ish) against the remote,
/// materializes the working tree of its `directory` into `dest`, and returns
/// the lock pinning the resolved 40-hex commit.
pub fn fetch(git_ref: &GitRef, dest: &Path, cancel: &CancelToken) -> Result<GitLock> {
    let commit = materialize(&git_ref.repo, &git_ref.r#ref, &git_ref.directory, dest, cancel)?;
    Ok(GitLock {
        repo: git_ref.repo.clone(),
        directory: git_ref.directory.clone(),
        r#ref: git_ref.r#ref.clone(),
        commit,
    })
}

/// Re-materializes a previously resolved commit. The commit is fetched by
/// its SHA, so the content is byte-identical to the original resolve.
pub fn fetch_lock(lock: &GitLock, dest: &Path, cancel: &CancelToken) -> Result<()> {
    let commit = materialize(&lock.repo, &lock.commit, &lock.directory, dest, cancel)?;
    if commit != lock.commit {
        return Err(Error::Internal(format!(
            "lock commit {} resolved to {}",
            lock.commit, commit
        )));
    }
    Ok(())
}

fn materialize(
    repo_url: &str,
    reference: &str,
    directory: &str,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<String> {
    cancel.check()?;
    let scratch = tempfile::Builder::new().prefix("krmpkg-git-").tempdir()?;
    let repo =
        Repository::init(scratch.path()).map_err(|e| map_git_error(repo_url, reference, e))?;

    let mut remote = repo
        .remote_anonymous(repo_url)
        .map_err(|e| map_git_error(repo_url, reference, e))?;

    let mut options = FetchOptions::new();
    options.remote_callbacks(make_callbacks(cancel));
    options.download_tags(AutotagOption::None);
    // Branches and tags cover named refs; a raw SHA needs a second, direct
    // fetch below.
    let refspecs = [
        "+refs/heads/*:refs/remotes/origin/*".to_string(),
        "+refs/tags/*:refs/tags/*".to_string(),
    ];
    remote
        .fetch(&refspecs, Some(&mut options), None)
        .map_err(|e| map_fetch_error(repo_url, reference, cancel, e))?;

    let oid = match resolve_reference(&repo, reference) {
        Some(oid) => oid,
        None => {
            // Commit-ish that no named ref points at: fetch it directly.
            debug!(reference, "ref not found among heads/tags, fetching by SHA");
            let mut options = FetchOptions::new();
            options.remote_callbacks(make_callbacks(cancel));
            remote
                .fetch(&[reference], Some(&mut options), None)
                .map_err(|_| Error::InvalidRef {
                    source_name: repo_url.to_string(),
                    reference: reference.to_string(),
                })?;
            Oid::from_str(reference).map_err(|_| Error::InvalidRef {
                source_name: repo_url.to_string(),
                reference: reference.to_string(),
            })?
        }
    };

    let commit = repo.find_commit(oid).map_err(|_| Error::InvalidRef {
        source_name: repo_url.to_string(),
        reference: reference.to_string(),
    })?;
    repo.checkout_tree(
        commit.as_object(),
        Some(git2::build::CheckoutBuilder::new().force()),
    )
    .map_err(|e| map_git_error(repo_url, reference, e))?;
    repo.set_head_detached(oid)
        .map_err(|e| map_git_error(repo_url, reference, e))?;

    cancel.check()?;
    export_subtree(scratch.path(), directory, dest, repo_url)?;
    Ok(oid.to_string())
}

fn make_callbacks(cancel: &CancelToken) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let token = cancel.clone();
    callbacks.transfer_progress(move |_| !token.is_cancelled());
    callbacks.credentials(|_url, username, allowed| {
        if allowed.contains(git2::CredentialType::SSH_KEY)
            && let Some(username) = username
        {
            return git2::Cred::ssh_key_from_agent(username);
        }
        git2::Cred::default()
    });
    callbacks
}

fn resolve_reference(repo: &Repository, reference: &str) -> Option<Oid> {
    for candidate in [
        format!("refs/remotes/origin/{reference}"),
        format!("refs/tags/{reference}"),
    ] {
        if let Ok(r) = repo.find_reference(&candidate)
            && let Ok(commit) = r.peel_to_commit()
        {
            return Some(commit.id());
        }
    }
    // A SHA (possibly abbreviated) already present after the ref fetch.
    repo.revparse_single(reference)
        .ok()
        .and_then(|o| o.peel_to_commit().ok())
        .map(|c| c.id())
}

/// Copies the working tree under `directory` into `dest`, leaving the `.git`
/// metadata behind.
fn export_subtree(worktree: &Path, directory: &str, dest: &Path, repo_url: &str) -> Result<()> {
    let source = worktree.join(directory.trim_start_matches('/'));
    if !source.is_dir() {
        return Err(Error::InvalidDirectory {
            source_name: repo_url.to_string(),
            directory: directory.to_string(),
        });
    }
    utils::create_dir_with_mode(dest)?;
    for entry in utils::sorted_entries(&source)? {
        if entry.file_name() == ".git" {
            continue;
        }
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            utils::copy_dir_contents(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn map_fetch_error(
    repo_url: &str,
    reference: &str,
    cancel: &CancelToken,
    error: git2::Error,
) -> Error {
    if cancel.is_cancelled() {
        // The transfer callback aborted the download.
        return Error::Cancelled;
    }
    map_git_error(repo_url, reference, error)
}

fn map_git_error(repo_url: &str, reference: &str, error: git2::Error) -> Error {
    match (error.class(), error.code()) {
        (_, ErrorCode::Auth) | (ErrorClass::Ssh, ErrorCode::Certificate) => {
            Error::AuthRequired(repo_url.to_string())
        }
        (ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl, _) => {
            Error::UpstreamUnavailable(repo_url.to_string())
        }
        (ErrorClass::Reference, _) | (_, ErrorCode::NotFound) => Error::InvalidRef {
            source_name: repo_url.to_string(),
            reference: reference.to_string(),
        },
        _ => Error::Internal(format!("git operation failed on `{repo_url}`: {error}")),
    }
}
