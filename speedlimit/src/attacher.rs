//! Loads and attaches the in-kernel filter, and detects/reconciles which of
//! the two mutually exclusive attach modes is currently live.
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use aya::programs::{CgroupAttachMode, CgroupSkb, CgroupSkbAttachType};
use aya::Ebpf;
use tracing::{info, warn};

use crate::error::{LimiterError, Result};
use crate::kernel_store::KernelObjectStore;
use crate::raw_bpf;
use crate::rule::RuleRegistry;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// A link object pinned at a well-known path. Persistent, single-owner.
    Link,
    /// `BPF_F_ALLOW_MULTI` attach, not pinned; coexists with other tools.
    Direct,
}

pub struct Attacher<'a> {
    settings: &'a Settings,
    store: KernelObjectStore<'a>,
}

impl<'a> Attacher<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Attacher {
            settings,
            store: KernelObjectStore::new(settings),
        }
    }

    /// True iff the link pin exists, or a program named `speedlimit_common::PROG_NAME`
    /// is currently attached to the anchor's egress hook.
    pub fn is_loaded(&self) -> Result<bool> {
        if self.store.link_pin_exists() {
            return Ok(true);
        }
        let ids = self.store.enumerate_programs(speedlimit_common::PROG_NAME)?;
        Ok(!ids.is_empty())
    }

    /// Link if the link pin exists or any attached program of the expected
    /// name carries an associated link object; Direct otherwise. Defaults
    /// to Link when nothing can be determined.
    pub fn current_mode(&self) -> Result<AttachMode> {
        if self.store.link_pin_exists() {
            return Ok(AttachMode::Link);
        }
        let ids = self.store.enumerate_programs(speedlimit_common::PROG_NAME)?;
        if ids.is_empty() {
            return Ok(AttachMode::Link);
        }
        Ok(AttachMode::Direct)
    }

    /// If the filter is already attached compatibly, a no-op; otherwise
    /// loads the object and attaches it at `self.settings.anchor_cgroup`
    /// in `mode`.
    pub fn ensure_loaded(&self, obj_path: &Path, mode: AttachMode) -> Result<()> {
        if self.is_loaded()? {
            let current = self.current_mode()?;
            if current == mode {
                return Ok(());
            }
            warn!(?current, requested = ?mode, "attach mode mismatch, reattaching");
            self.detach_all()?;
        }
        self.load_and_attach(obj_path, mode)
    }

    fn load_and_attach(&self, obj_path: &Path, mode: AttachMode) -> Result<()> {
        self.store.ensure_namespace()?;

        let data = std::fs::read(obj_path)
            .map_err(|e| LimiterError::kernel_refused("read object file", e))?;
        let mut ebpf = Ebpf::load(&data)
            .map_err(|e| LimiterError::kernel_refused("load object", std::io::Error::other(e)))?;

        let program: &mut CgroupSkb = ebpf
            .program_mut(speedlimit_common::PROG_NAME)
            .ok_or_else(|| {
                LimiterError::PreconditionMissing(format!(
                    "object file has no program named {}",
                    speedlimit_common::PROG_NAME
                ))
            })?
            .try_into()
            .map_err(|e| LimiterError::kernel_refused("as cgroup_skb program", std::io::Error::other(e)))?;
        program
            .load()
            .map_err(|e| LimiterError::kernel_refused("verifier load", std::io::Error::other(e)))?;

        let anchor = OpenOptions::new()
            .read(true)
            .open(&self.settings.anchor_cgroup)
            .map_err(|e| LimiterError::kernel_refused("open anchor cgroup", e))?;

        let attach_mode = match mode {
            AttachMode::Link => CgroupAttachMode::Single,
            AttachMode::Direct => CgroupAttachMode::AllowMultiple,
        };
        let link_id = program
            .attach(anchor, CgroupSkbAttachType::Egress, attach_mode)
            .map_err(|e| LimiterError::kernel_refused("attach", std::io::Error::other(e)))?;

        if matches!(mode, AttachMode::Link) {
            let owned_link = program
                .take_link(link_id)
                .map_err(|e| LimiterError::kernel_refused("take_link", std::io::Error::other(e)))?;
            self.store.prepare_for_pin(&self.settings.link_pin_path())?;
            owned_link
                .pin(self.settings.link_pin_path())
                .map_err(|e| LimiterError::kernel_refused("pin link", std::io::Error::other(e)))?;
        }

        let config_map = ebpf
            .take_map(speedlimit_common::CONFIG_MAP_NAME)
            .ok_or_else(|| {
                LimiterError::PreconditionMissing(format!(
                    "object file has no map named {}",
                    speedlimit_common::CONFIG_MAP_NAME
                ))
            })?;
        self.store
            .prepare_for_pin(&self.settings.config_map_pin_path())?;
        config_map
            .pin(self.settings.config_map_pin_path())
            .map_err(|e| LimiterError::kernel_refused("pin config map", std::io::Error::other(e)))?;

        let state_map = ebpf
            .take_map(speedlimit_common::STATE_MAP_NAME)
            .ok_or_else(|| {
                LimiterError::PreconditionMissing(format!(
                    "object file has no map named {}",
                    speedlimit_common::STATE_MAP_NAME
                ))
            })?;
        self.store
            .prepare_for_pin(&self.settings.state_map_pin_path())?;
        state_map
            .pin(self.settings.state_map_pin_path())
            .map_err(|e| LimiterError::kernel_refused("pin state map", std::io::Error::other(e)))?;

        info!(?mode, path = %obj_path.display(), "attached filter");
        Ok(())
    }

    /// Detaches every attachment of the expected program name at the anchor
    /// and at every descendant under ManagedRoot. Tolerant of partial
    /// failure; returns `(detached_count, any_failed)`.
    pub fn detach_all(&self) -> Result<(u32, bool)> {
        let mut detached = 0u32;
        let mut failed = false;

        if self.store.link_pin_exists() {
            match self.store.unpin(&self.settings.link_pin_path()) {
                Ok(()) => detached += 1,
                Err(e) => {
                    warn!(error = %e, "failed to unpin link");
                    failed = true;
                }
            }
        }

        let mut cgroup_paths = vec![self.settings.anchor_cgroup.clone()];
        match RuleRegistry::new(self.settings).enumerate() {
            Ok(rules) => cgroup_paths.extend(rules.into_iter().map(|r| r.path)),
            Err(e) => {
                warn!(error = %e, "failed to enumerate managed rule directories for detach");
                failed = true;
            }
        }

        for cgroup_path in cgroup_paths {
            match self.detach_direct_at(&cgroup_path) {
                Ok((n, any_failed)) => {
                    detached += n;
                    failed |= any_failed;
                }
                Err(e) => {
                    warn!(error = %e, path = %cgroup_path.display(), "failed to query/detach at cgroup");
                    failed = true;
                }
            }
        }

        Ok((detached, failed))
    }

    /// Queries `cgroup_path`'s egress hook via `BPF_PROG_QUERY` and
    /// `BPF_PROG_DETACH`es every attached program whose name matches
    /// `speedlimit_common::PROG_NAME`. This is the only way to tear down a
    /// direct-attach program: it was never pinned, so there is no owned
    /// link fd whose removal alone would detach it.
    fn detach_direct_at(&self, cgroup_path: &Path) -> Result<(u32, bool)> {
        let cgroup_file = match OpenOptions::new().read(true).open(cgroup_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, false)),
            Err(e) => return Err(LimiterError::kernel_refused("open cgroup for detach", e)),
        };
        let cgroup_fd = cgroup_file.as_raw_fd();

        let attached_ids = raw_bpf::prog_query_egress(cgroup_fd)
            .map_err(|e| LimiterError::kernel_refused("bpf_prog_query", e))?;
        if attached_ids.is_empty() {
            return Ok((0, false));
        }

        let expected_ids: HashSet<u32> = self
            .store
            .enumerate_programs(speedlimit_common::PROG_NAME)?
            .into_iter()
            .collect();

        let mut detached = 0u32;
        let mut failed = false;
        for id in attached_ids {
            if !expected_ids.contains(&id) {
                continue;
            }
            let prog_fd = match raw_bpf::prog_get_fd_by_id(id) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(error = %e, id, "failed to open program fd by id");
                    failed = true;
                    continue;
                }
            };
            let result = raw_bpf::prog_detach_egress(prog_fd, cgroup_fd);
            raw_bpf::close_fd(prog_fd);
            match result {
                Ok(()) => detached += 1,
                Err(e) => {
                    warn!(error = %e, id, path = %cgroup_path.display(), "bpf_prog_detach failed");
                    failed = true;
                }
            }
        }
        Ok((detached, failed))
    }

    /// `detach_all` + `ensure_loaded` + `RuleRegistry::backfill`. Because
    /// configuration lives in directory names on disk, reload is lossless.
    pub fn reload(&self, obj_path: &Path, mode: AttachMode, registry: &RuleRegistry) -> Result<()> {
        self.detach_all()?;
        self.load_and_attach(obj_path, mode)?;
        let config_map_path = self.settings.config_map_pin_path();
        registry.backfill(&config_map_path)
    }

    pub fn store(&self) -> &KernelObjectStore<'a> {
        &self.store
    }
}
