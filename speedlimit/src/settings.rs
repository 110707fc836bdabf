//! Resolves the filesystem namespace a single invocation operates
//! against. Nothing here is persisted: every invocation recomputes it from
//! built-in defaults, an optional TOML file, then environment overrides —
//! the "global on-disk state instead of a central registry" design note
//! extends to configuration itself.
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{LimiterError, Result};

const DEFAULT_APP_NAME: &str = "speedlimit";
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
const DEFAULT_BPFFS_ROOT: &str = "/sys/fs/bpf";
const DEFAULT_RUN_ROOT: &str = "/run";

#[derive(Debug, Clone, Deserialize, Default)]
struct FileOverrides {
    app_name: Option<String>,
    anchor_cgroup: Option<PathBuf>,
    bpf_obj_path: Option<PathBuf>,
}

impl FileOverrides {
    /// Layers `other` on top of `self`, `other` winning wherever it sets a
    /// field.
    fn merge(&mut self, other: FileOverrides) {
        if other.app_name.is_some() {
            self.app_name = other.app_name;
        }
        if other.anchor_cgroup.is_some() {
            self.anchor_cgroup = other.anchor_cgroup;
        }
        if other.bpf_obj_path.is_some() {
            self.bpf_obj_path = other.bpf_obj_path;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    /// Cgroup at whose egress hook the filter attaches; ancestor of every
    /// rule directory.
    pub anchor_cgroup: PathBuf,
    /// Subtree the tool creates and owns rule directories under.
    pub managed_root: PathBuf,
    /// bpffs directory the link/maps are pinned under.
    pub pin_dir: PathBuf,
    /// Directory holding `last_rule` and `orig_cgrp/<pid>`.
    pub runtime_dir: PathBuf,
    /// Default filter object file, used when a command doesn't override it.
    pub bpf_obj_path: PathBuf,
}

impl Settings {
    /// Built-in defaults, ignoring any file or environment overrides.
    pub fn defaults() -> Self {
        Self::from_app_name(DEFAULT_APP_NAME, PathBuf::from(DEFAULT_CGROUP_ROOT))
    }

    fn from_app_name(app_name: &str, cgroup_root: PathBuf) -> Self {
        let anchor_cgroup = cgroup_root.clone();
        let managed_root = cgroup_root.join(app_name);
        let pin_dir = Path::new(DEFAULT_BPFFS_ROOT).join(app_name);
        let runtime_dir = Path::new(DEFAULT_RUN_ROOT).join(app_name);
        let bpf_obj_path = Self::default_bpf_obj_path(app_name);
        Settings {
            app_name: app_name.to_string(),
            anchor_cgroup,
            managed_root,
            pin_dir,
            runtime_dir,
            bpf_obj_path,
        }
    }

    /// Resolves settings the way a CLI invocation does: defaults, then
    /// `SPEEDLIMIT_CONFIG` (a TOML file, only an error if explicitly
    /// pointed at and unreadable/malformed), then `SPEEDLIMIT_*` env vars.
    ///
    /// `app_name`, `anchor_cgroup`, and `bpf_obj_path` overrides are all
    /// collected from both sources before any of them are applied, then
    /// rebased onto the defaults in a single `from_app_name` call. Applying
    /// them one at a time (file's `app_name`, then an env `anchor_cgroup`,
    /// then env `bpf_obj_path`, ...) would have each later field recomputed
    /// via `from_app_name` stomp on whatever an earlier override had set,
    /// since every field but `app_name`/`anchor_cgroup` is templated off
    /// them.
    pub fn resolve() -> Result<Self> {
        let mut overrides = FileOverrides::default();

        if let Ok(path) = env::var("SPEEDLIMIT_CONFIG") {
            overrides.merge(Self::read_file_overrides(Path::new(&path))?);
        }
        if let Ok(app_name) = env::var("SPEEDLIMIT_APP_NAME") {
            overrides.app_name = Some(app_name);
        }
        if let Ok(anchor) = env::var("SPEEDLIMIT_ANCHOR_CGROUP") {
            overrides.anchor_cgroup = Some(PathBuf::from(anchor));
        }
        if let Ok(obj) = env::var("SPEEDLIMIT_BPF_OBJ") {
            overrides.bpf_obj_path = Some(PathBuf::from(obj));
        }

        Ok(Self::defaults().with_overrides(overrides))
    }

    fn read_file_overrides(path: &Path) -> Result<FileOverrides> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            LimiterError::RuleMalformed(format!(
                "SPEEDLIMIT_CONFIG points at {} which could not be read: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&text).map_err(|e| {
            LimiterError::RuleMalformed(format!("invalid config at {}: {e}", path.display()))
        })
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let overrides = Self::read_file_overrides(path)?;
        *self = self.clone().with_overrides(overrides);
        Ok(())
    }

    fn default_bpf_obj_path(app_name: &str) -> PathBuf {
        PathBuf::from(format!("/usr/lib/{app_name}/speedlimit.bpf.o"))
    }

    /// Rebases `app_name`/`anchor_cgroup` (and everything templated off
    /// them) in one shot, then layers an explicit `bpf_obj_path` override on
    /// top if one was given. A `bpf_obj_path` that was already customized
    /// away from its old app_name's default survives the rebase; one that
    /// was still just the template retemplates onto the new app_name, the
    /// same as `managed_root`/`pin_dir`/`runtime_dir` do.
    fn with_overrides(self, overrides: FileOverrides) -> Self {
        let rebase_needed = overrides.app_name.is_some() || overrides.anchor_cgroup.is_some();
        let mut settings = if rebase_needed {
            let customized_bpf_obj_path = (self.bpf_obj_path != Self::default_bpf_obj_path(&self.app_name))
                .then_some(self.bpf_obj_path);
            let anchor_cgroup = overrides.anchor_cgroup.unwrap_or(self.anchor_cgroup);
            let app_name = overrides.app_name.unwrap_or(self.app_name);
            let mut rebased = Self::from_app_name(&app_name, anchor_cgroup);
            if let Some(bpf_obj_path) = customized_bpf_obj_path {
                rebased.bpf_obj_path = bpf_obj_path;
            }
            rebased
        } else {
            self
        };
        if let Some(obj) = overrides.bpf_obj_path {
            settings.bpf_obj_path = obj;
        }
        settings
    }

    pub fn link_pin_path(&self) -> PathBuf {
        self.pin_dir.join("link")
    }

    pub fn config_map_pin_path(&self) -> PathBuf {
        self.pin_dir.join("rate_limit_config_map")
    }

    pub fn state_map_pin_path(&self) -> PathBuf {
        self.pin_dir.join("rate_limit_state_map")
    }

    pub fn last_rule_path(&self) -> PathBuf {
        self.runtime_dir.join("last_rule")
    }

    pub fn orig_cgrp_dir(&self) -> PathBuf {
        self.runtime_dir.join("orig_cgrp")
    }

    pub fn orig_cgrp_path(&self, pid: i32) -> PathBuf {
        self.orig_cgrp_dir().join(pid.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_managed_root_under_anchor() {
        let s = Settings::defaults();
        assert_eq!(s.managed_root, PathBuf::from("/sys/fs/cgroup/speedlimit"));
        assert_eq!(s.pin_dir, PathBuf::from("/sys/fs/bpf/speedlimit"));
        assert_eq!(s.runtime_dir, PathBuf::from("/run/speedlimit"));
    }

    #[test]
    fn file_override_changes_app_name_consistently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speedlimit.toml");
        std::fs::write(&path, "app_name = \"custom\"\n").unwrap();

        let mut s = Settings::defaults();
        s.apply_file(&path).unwrap();
        assert_eq!(s.managed_root, PathBuf::from("/sys/fs/cgroup/custom"));
        assert_eq!(s.pin_dir, PathBuf::from("/sys/fs/bpf/custom"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let mut s = Settings::defaults();
        let err = s.apply_file(Path::new("/nonexistent/speedlimit.toml"));
        assert!(err.is_err());
    }

    #[test]
    fn app_name_override_retemplates_an_unset_bpf_obj_path() {
        let mut s = Settings::defaults();
        s = s.with_overrides(FileOverrides {
            app_name: Some("custom".to_string()),
            anchor_cgroup: None,
            bpf_obj_path: None,
        });
        assert_eq!(s.bpf_obj_path, PathBuf::from("/usr/lib/custom/speedlimit.bpf.o"));
    }

    #[test]
    fn app_name_override_preserves_a_customized_bpf_obj_path() {
        let mut s = Settings::defaults();
        s.bpf_obj_path = PathBuf::from("/custom/speedlimit.bpf.o");
        s = s.with_overrides(FileOverrides {
            app_name: Some("custom".to_string()),
            anchor_cgroup: None,
            bpf_obj_path: None,
        });
        assert_eq!(s.bpf_obj_path, PathBuf::from("/custom/speedlimit.bpf.o"));
    }

    #[test]
    fn file_override_of_app_name_and_anchor_together_keeps_managed_root_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speedlimit.toml");
        std::fs::write(
            &path,
            "app_name = \"custom\"\nanchor_cgroup = \"/sys/fs/cgroup/other\"\n",
        )
        .unwrap();

        let mut s = Settings::defaults();
        s.apply_file(&path).unwrap();
        assert_eq!(s.anchor_cgroup, PathBuf::from("/sys/fs/cgroup/other"));
        assert_eq!(s.managed_root, PathBuf::from("/sys/fs/cgroup/other/custom"));
        assert_eq!(s.pin_dir, PathBuf::from("/sys/fs/bpf/custom"));
    }
}
