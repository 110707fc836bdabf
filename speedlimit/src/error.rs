//! Categorical error taxonomy for the control plane. Every
//! fallible operation on `Reconciler` and its collaborators returns
//! `Result<T, LimiterError>`; the CLI binary is the only place these get
//! flattened into `anyhow::Error` for display.
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LimiterError>;

#[derive(Debug, Error)]
pub enum LimiterError {
    /// Required kernel feature, bpffs mount, or cgroup v2 root absent.
    #[error("precondition missing: {0}")]
    PreconditionMissing(String),

    /// A pin or rule directory unexpectedly already exists where the
    /// caller expected to create one. Reconciler call sites generally fold
    /// this into idempotent success rather than propagating it.
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    /// A pin, rule directory, or kernel object the caller expected to find
    /// is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The kernel rejected a load/attach/detach/map operation: verifier
    /// rejection, attach conflict, or permission denial.
    #[error("kernel refused {op}: {source}")]
    KernelRefused {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A rate or bucket size parsed to zero, carried an unrecognised
    /// suffix, or a path exceeded filesystem limits.
    #[error("malformed rule input: {0}")]
    RuleMalformed(String),

    /// `/proc/<pid>/...` could not be read because the process no longer
    /// exists.
    #[error("process {0} vanished")]
    ProcessVanished(i32),

    /// The requested attach mode differs from the mode currently attached
    /// at the anchor. Reconciler resolves this automatically via reload;
    /// this variant exists for components that only detect the conflict.
    #[error("attach mode mismatch: requested {requested:?}, currently {current:?}")]
    ReconcileConflict {
        requested: crate::attacher::AttachMode,
        current: crate::attacher::AttachMode,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    pub fn kernel_refused(op: &'static str, source: std::io::Error) -> Self {
        LimiterError::KernelRefused { op, source }
    }
}
