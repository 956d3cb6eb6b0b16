use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Serialize;

use crate::commands::update::set_ref;
use crate::error::Error;
use crate::fetch;
use crate::pkg::{self, DiffKind, FileDiff, Package};
use crate::utils::{self, CancelToken};

#[derive(Debug, Parser, Default)]
#[command(about = "Show how the local package differs from its upstream.")]
pub struct Options {
    /// Path to the local package
    #[arg(default_value = ".")]
    pub package: PathBuf,
    /// Compare against this ref instead of the recorded origin
    #[arg(long = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DiffResult {
    pub package: String,
    pub files: Vec<FileDiff>,
    pub patch: String,
}

impl fmt::Display for DiffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.files.is_empty() {
            write!(f, "package {} has no differences", self.package)
        } else {
            write!(f, "{}", self.patch.trim_end())
        }
    }
}

pub async fn diff(options: &Options, cancel: &CancelToken) -> anyhow::Result<DiffResult> {
    let root = utils::absolutize(&options.package)?;
    let package = Package::load(&root)?;
    let root = utils::canonicalize(&root)?;

    let snapshot = tempfile::Builder::new().prefix("krmpkg-diff-").tempdir()?;
    match &options.reference {
        Some(reference) => {
            let mut upstream = package
                .manifest
                .upstream()
                .cloned()
                .ok_or_else(|| Error::NoUpstream(package.path.clone()))?;
            set_ref(&mut upstream, reference);
            fetch::fetch_upstream(&upstream, snapshot.path(), cancel).await?;
        }
        None => {
            let lock = package
                .manifest
                .upstream_lock()
                .ok_or_else(|| Error::NoUpstream(package.path.clone()))?;
            fetch::fetch_lock(lock, snapshot.path(), cancel).await?;
        }
    }

    let files = pkg::diff(snapshot.path(), &root)
        .with_context(|| format!("could not diff `{}`", root.display()))?;
    let patch = render_patch(snapshot.path(), &root, &files)?;
    Ok(DiffResult {
        package: package.name().to_string(),
        files,
        patch,
    })
}

fn render_patch(base: &Path, local: &Path, files: &[FileDiff]) -> anyhow::Result<String> {
    let read = |root: &Path, rel: &str| -> String {
        std::fs::read(root.join(rel))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };
    let mut rendered = String::new();
    for file in files {
        let (old, new) = match file.kind {
            DiffKind::Added => (String::new(), read(local, &file.path)),
            DiffKind::Removed => (read(base, &file.path), String::new()),
            DiffKind::Modified => (read(base, &file.path), read(local, &file.path)),
        };
        let patch = diffy::create_patch(&old, &new);
        // diffy emits its own ---/+++ header; name the file once above it.
        rendered.push_str(&format!("diff upstream/{0} local/{0}\n", file.path));
        rendered.push_str(&patch.to_string());
        rendered.push('\n');
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::get::fetch_into;
    use crate::manifest::Upstream;
    use crate::utils::test::{commit_all, init_repo, write_deployment, write_kptfile};

    async fn fixture() -> (assert_fs::TempDir, PathBuf) {
        let dir = assert_fs::TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        init_repo(&remote);
        write_kptfile(&remote.join("app"), "app");
        write_deployment(&remote.join("app"), "deploy.yaml", "web", 3);
        commit_all(&remote, "publish");

        let local = dir.path().join("app");
        fetch_into(
            &Upstream::new_git(&remote.to_string_lossy(), "/app", "master"),
            &local,
            None,
            false,
            &CancelToken::new(),
        )
        .await
        .unwrap();
        (dir, local)
    }

    #[tokio::test]
    async fn test_clean_package_has_no_differences() {
        let (_dir, local) = fixture().await;
        let options = Options {
            package: local,
            ..Default::default()
        };
        let result = diff(&options, &CancelToken::new()).await.unwrap();
        assert!(result.files.is_empty());
        assert!(result.to_string().contains("no differences"));
    }

    #[tokio::test]
    async fn test_local_edit_shows_up_as_patch() {
        let (_dir, local) = fixture().await;
        write_deployment(&local, "deploy.yaml", "web", 4);
        let options = Options {
            package: local,
            ..Default::default()
        };
        let result = diff(&options, &CancelToken::new()).await.unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].kind, DiffKind::Modified);
        assert!(result.patch.contains("-  replicas: 3"));
        assert!(result.patch.contains("+  replicas: 4"));
    }

    #[tokio::test]
    async fn test_diff_without_lock_requires_a_ref() {
        let dir = assert_fs::TempDir::new().unwrap();
        let local = dir.path().join("pkg");
        write_kptfile(&local, "pkg");
        let options = Options {
            package: local,
            ..Default::default()
        };
        let err = diff(&options, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::NoUpstream(_))
        ));
    }
}
