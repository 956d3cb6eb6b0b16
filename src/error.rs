use std::path::PathBuf;

use crate::resource::ResourceId;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the engine. Command entry points wrap these in
/// `anyhow` with call-site context; everything below them stays typed so
/// callers can branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("upstream `{0}` is unreachable")]
    UpstreamUnavailable(String),

    #[error("reference `{reference}` does not resolve in `{source_name}`")]
    InvalidRef {
        source_name: String,
        reference: String,
    },

    #[error("directory `{directory}` does not exist in `{source_name}`")]
    InvalidDirectory {
        source_name: String,
        directory: String,
    },

    #[error("authentication required for `{0}`")]
    AuthRequired(String),

    #[error("package not found at `{0}`")]
    PackageNotFound(PathBuf),

    #[error("no manifest file in `{0}`")]
    ManifestMissing(PathBuf),

    #[error("malformed manifest `{path}`: {reason}")]
    ManifestMalformed { path: PathBuf, reason: String },

    #[error("package `{0}` has no upstream reference")]
    NoUpstream(PathBuf),

    #[error("unknown update strategy `{0}`")]
    StrategyUnknown(String),

    #[error("strategy rejected the update: {0}")]
    StrategyRejected(String),

    #[error("package `{0}` has local modifications")]
    LocalModified(PathBuf),

    #[error(transparent)]
    MergeConflict(#[from] MergeConflict),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Structural conflicts the resource and manifest mergers refuse to resolve
/// silently. The offending path or identity is always carried so the caller
/// can point at it.
#[derive(Debug, thiserror::Error)]
pub enum MergeConflict {
    #[error("subpackage `{0}` was added in both the local package and upstream")]
    BothAddedSubpackage(PathBuf),

    #[error("`{field_path}` of {subject} has an incompatible structure upstream and locally")]
    IncompatibleStructure { subject: String, field_path: String },

    #[error("list at `{field_path}` of {id} has duplicate values for key `{key}`")]
    AmbiguousListKey {
        id: ResourceId,
        field_path: String,
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_conflict_messages_carry_context() {
        let err = Error::from(MergeConflict::BothAddedSubpackage(PathBuf::from("abc")));
        assert!(err.to_string().contains("abc"));

        let err = MergeConflict::IncompatibleStructure {
            subject: ResourceId::new("apps/v1", "Deployment", "", "foo").to_string(),
            field_path: "spec.replicas".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("spec.replicas"));
        assert!(msg.contains("Deployment"));
    }
}
