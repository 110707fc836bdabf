//! Control plane for the per-cgroup egress bandwidth limiter: lifecycle
//! management of the in-kernel filter, rule materialisation as cgroup
//! directories, and PID migration with anti-reuse bookkeeping.
//!
//! The CLI binary (`src/bin/speedlimitctl.rs`) is a thin shell over
//! [`Reconciler`]; all the logic that matters lives in this library so it
//! can be exercised directly from tests.

pub mod attacher;
pub mod error;
pub mod keying;
pub mod kernel_store;
pub mod logging;
pub mod process_mover;
mod raw_bpf;
pub mod reconciler;
pub mod rule;
pub mod settings;
pub mod sizeparse;

pub use attacher::{AttachMode, Attacher};
pub use error::{LimiterError, Result};
pub use kernel_store::KernelObjectStore;
pub use process_mover::ProcessMover;
pub use reconciler::{AttachedProgramInfo, ListedRule, MoveTarget, Reconciler};
pub use rule::{Rule, RuleRegistry};
pub use settings::Settings;
pub use sizeparse::parse_size;
