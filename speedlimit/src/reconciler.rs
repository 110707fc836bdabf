//! Composes the lower components into the seven top-level operations.
//! Every operation here is written to be safe to retry: it inspects
//! on-disk/kernel state before acting rather than trusting any
//! in-memory record of what a previous invocation did.
use std::path::{Path, PathBuf};

use tracing::info;

use crate::attacher::{AttachMode, Attacher};
use crate::keying;
use crate::kernel_store::KernelObjectStore;
use crate::process_mover::ProcessMover;
use crate::rule::{Rule, RuleRegistry};
use crate::settings::Settings;
use speedlimit_common::RateLimitConfig;

use crate::error::{LimiterError, Result};

/// How the caller wants to locate the target of a `move`.
pub enum MoveTarget {
    Path(PathBuf),
    Key(u64),
    Last,
}

pub struct ListedRule {
    pub path: PathBuf,
    pub key: u64,
    pub rate_bps: u64,
    pub bucket_size: u64,
    pub process_count: usize,
}

pub struct AttachedProgramInfo {
    pub id: u32,
    pub mode: AttachMode,
}

pub struct Reconciler<'a> {
    settings: &'a Settings,
    registry: RuleRegistry<'a>,
    attacher: Attacher<'a>,
    mover: ProcessMover<'a>,
    store: KernelObjectStore<'a>,
}

impl<'a> Reconciler<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Reconciler {
            settings,
            registry: RuleRegistry::new(settings),
            attacher: Attacher::new(settings),
            mover: ProcessMover::new(settings),
            store: KernelObjectStore::new(settings),
        }
    }

    /// Ensures the filter is loaded, materialises the rule directory,
    /// writes its config into the kernel map, records it as the last rule,
    /// and optionally moves a PID into it.
    pub fn set(
        &self,
        pid: Option<i32>,
        rate_bps: u64,
        bucket_size: Option<u64>,
        mode: AttachMode,
        obj_path: &Path,
    ) -> Result<PathBuf> {
        if rate_bps == 0 {
            return Err(LimiterError::RuleMalformed("rate must be > 0".into()));
        }
        let bucket_size = bucket_size.unwrap_or(rate_bps);
        if bucket_size == 0 {
            return Err(LimiterError::RuleMalformed("bucket must be > 0".into()));
        }

        let rule = Rule { bucket_size, rate_bps };
        let path = self.registry.ensure_rule(rule)?;
        self.attacher.ensure_loaded(obj_path, mode)?;

        let key = keying::key(&path);
        if key == 0 {
            return Err(LimiterError::kernel_refused(
                "stat rule dir",
                std::io::Error::other("rule directory has no usable inode"),
            ));
        }
        self.write_config(key, rule)?;
        self.registry.write_last_rule(&path, key)?;

        if let Some(pid) = pid {
            self.mover.save_original_cgroup(pid)?;
            self.mover.move_pid(pid, &path)?;
        }

        info!(path = %path.display(), key, rate_bps, bucket_size, "rule applied");
        Ok(path)
    }

    /// Resolves the target rule directory by path, key, or "last", then
    /// migrates `pid` into it with save-before-move bookkeeping.
    pub fn move_pid(&self, pid: i32, target: MoveTarget) -> Result<PathBuf> {
        let path = match target {
            MoveTarget::Path(path) => path,
            MoveTarget::Key(key) => self.find_rule_by_key(key)?,
            MoveTarget::Last => {
                self.registry
                    .last_rule()?
                    .map(|(path, _)| path)
                    .ok_or_else(|| LimiterError::NotFound("no last rule recorded".into()))?
            }
        };
        if !path.is_dir() {
            return Err(LimiterError::NotFound(path.display().to_string()));
        }
        self.mover.save_original_cgroup(pid)?;
        self.mover.move_pid(pid, &path)?;
        Ok(path)
    }

    fn find_rule_by_key(&self, key: u64) -> Result<PathBuf> {
        self.registry
            .enumerate()?
            .into_iter()
            .find(|r| r.key == key)
            .map(|r| r.path)
            .ok_or_else(|| LimiterError::NotFound(format!("no rule directory with key {key}")))
    }

    /// Restores `pid` to its pre-limit cgroup. Filter and configs are left
    /// untouched so a later `move --last` reapplies the limit for free.
    pub fn unset(&self, pid: i32) -> Result<()> {
        let current = match read_proc_cgroup_path(pid) {
            Ok(path) => path,
            Err(_) => return Ok(()),
        };
        if !current.starts_with(&self.settings.managed_root) {
            return Ok(());
        }
        self.mover.restore_original_cgroup(pid)
    }

    /// Detach, reload from `obj_path` (or the configured default), then
    /// backfill every enumerated rule's config into the fresh map.
    pub fn reload(&self, obj_path: Option<&Path>, mode: Option<AttachMode>) -> Result<()> {
        let obj_path = obj_path.unwrap_or(&self.settings.bpf_obj_path);
        let mode = match mode {
            Some(m) => m,
            None => self.attacher.current_mode()?,
        };
        self.attacher.reload(obj_path, mode, &self.registry)
    }

    /// Detaches every attachment of the expected program and unpins the
    /// maps. Rule directories and PID records are left alone.
    pub fn unload(&self) -> Result<(u32, bool)> {
        let result = self.attacher.detach_all()?;
        self.store.unpin(&self.settings.config_map_pin_path())?;
        self.store.unpin(&self.settings.state_map_pin_path())?;
        Ok(result)
    }

    /// Full teardown: detach at the anchor, unpin link and maps, and
    /// remove the pin namespace. Idempotent — a second run is a no-op.
    pub fn purge(&self) -> Result<()> {
        self.attacher.detach_all()?;
        self.store.purge()
    }

    pub fn list(&self) -> Result<Vec<ListedRule>> {
        self.registry
            .enumerate()?
            .into_iter()
            .map(|r| {
                let process_count = count_cgroup_procs(&r.path).unwrap_or(0);
                Ok(ListedRule {
                    path: r.path,
                    key: r.key,
                    rate_bps: r.rule.rate_bps,
                    bucket_size: r.rule.bucket_size,
                    process_count,
                })
            })
            .collect()
    }

    pub fn list_pids(&self, rule_dir: &Path) -> Result<Vec<i32>> {
        let text = std::fs::read_to_string(rule_dir.join("cgroup.procs"))
            .map_err(|e| LimiterError::kernel_refused("read cgroup.procs", e))?;
        Ok(text
            .lines()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .collect())
    }

    pub fn list_bpf(&self) -> Result<Vec<AttachedProgramInfo>> {
        let ids = self.store.enumerate_programs(speedlimit_common::PROG_NAME)?;
        let mode = self.attacher.current_mode()?;
        Ok(ids.into_iter().map(|id| AttachedProgramInfo { id, mode }).collect())
    }

    fn write_config(&self, key: u64, rule: Rule) -> Result<()> {
        let map_data = aya::maps::MapData::from_pin(self.settings.config_map_pin_path())
            .map_err(|_| LimiterError::NotFound("config map not pinned".into()))?;
        let mut map: aya::maps::HashMap<_, u64, RateLimitConfig> =
            aya::maps::HashMap::try_from(map_data)
                .map_err(|e| LimiterError::kernel_refused("open config map", std::io::Error::other(e)))?;
        map.insert(
            key,
            RateLimitConfig { rate_bps: rule.rate_bps, bucket_size: rule.bucket_size },
            0,
        )
        .map_err(|e| LimiterError::kernel_refused("write config", std::io::Error::other(e)))
    }
}

fn read_proc_cgroup_path(pid: i32) -> Result<PathBuf> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/cgroup"))
        .map_err(|_| LimiterError::ProcessVanished(pid))?;
    crate::process_mover::parse_cgroup_v2_line(&contents).ok_or_else(|| {
        LimiterError::RuleMalformed(format!("/proc/{pid}/cgroup has no cgroup v2 (0::) line"))
    })
}

fn count_cgroup_procs(dir: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(dir.join("cgroup.procs"))
        .map_err(|e| LimiterError::kernel_refused("read cgroup.procs", e))?;
    Ok(text.lines().filter(|l| !l.trim().is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn settings_under(dir: &Path) -> Settings {
        let mut s = Settings::defaults();
        s.managed_root = dir.join("managed");
        s.runtime_dir = dir.join("run");
        s.pin_dir = dir.join("pin");
        s.anchor_cgroup = dir.join("cgroup_root");
        s
    }

    #[test]
    fn set_rejects_zero_rate() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let reconciler = Reconciler::new(&settings);
        let err = reconciler.set(None, 0, None, AttachMode::Link, Path::new("/tmp/obj"));
        assert!(matches!(err, Err(LimiterError::RuleMalformed(_))));
    }

    #[test]
    fn list_counts_processes_per_rule() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let registry = RuleRegistry::new(&settings);
        let path = registry.ensure_rule(Rule { bucket_size: 1024, rate_bps: 1024 }).unwrap();
        fs::write(path.join("cgroup.procs"), b"100\n200\n").unwrap();

        let reconciler = Reconciler::new(&settings);
        let listed = reconciler.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].process_count, 2);
    }

    #[test]
    fn unset_on_untracked_pid_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let reconciler = Reconciler::new(&settings);
        // No /proc/<pid>/cgroup reachable for this pid in the test sandbox,
        // so unset must swallow the lookup failure rather than propagate it.
        assert!(reconciler.unset(i32::MAX).is_ok());
    }
}
