//! Moves PIDs between cgroups and carries the save-before-move /
//! restore-on-unset bookkeeping that makes `unset` safe against PID reuse.
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use procfs::process::Process;

use crate::error::{LimiterError, Result};
use crate::settings::Settings;

pub struct ProcessMover<'a> {
    settings: &'a Settings,
}

/// A process's pre-limit cgroup path plus the start-time witness used to
/// detect PID reuse before trusting the path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OriginalCgroup {
    path: PathBuf,
    start_time_ticks: u64,
}

impl<'a> ProcessMover<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        ProcessMover { settings }
    }

    /// Writes `pid` into `target`'s `cgroup.procs`.
    pub fn move_pid(&self, pid: i32, target: &Path) -> Result<()> {
        let procs = target.join("cgroup.procs");
        fs::write(&procs, pid.to_string())
            .map_err(|e| LimiterError::kernel_refused("write cgroup.procs", e))
    }

    /// If no record exists yet for `pid`, captures its current cgroup path
    /// and start-time. Existing records are left untouched (first write
    /// wins), so repeated `set` on the same PID doesn't clobber the
    /// original location with an already-limited one.
    pub fn save_original_cgroup(&self, pid: i32) -> Result<()> {
        let record_path = self.settings.orig_cgrp_path(pid);
        if record_path.exists() {
            return Ok(());
        }

        let current_path = read_proc_cgroup_v2_path(pid)?;
        let start_time = read_proc_starttime(pid)?;

        fs::create_dir_all(self.settings.orig_cgrp_dir())
            .map_err(|e| LimiterError::kernel_refused("mkdir orig_cgrp", e))?;
        fs::write(
            &record_path,
            format!("{}\n{}\n", current_path.display(), start_time),
        )
        .map_err(|e| LimiterError::kernel_refused("write orig_cgrp record", e))
    }

    /// Restores `pid` to its recorded original cgroup if the start-time
    /// witness still matches; otherwise (no record, or the PID has been
    /// reused by a new process) falls back to the cgroup v2 root. The
    /// record is only deleted once the move actually succeeds, so a failed
    /// restore (transient I/O error, target removed concurrently) can be
    /// retried against the same witness instead of silently falling back to
    /// the anchor on the next attempt.
    pub fn restore_original_cgroup(&self, pid: i32) -> Result<()> {
        let record_path = self.settings.orig_cgrp_path(pid);
        let record = read_original_cgroup_record(&record_path)?;

        let target = match &record {
            Some(rec) => match read_proc_starttime(pid) {
                Ok(current_start) if current_start == rec.start_time_ticks => rec.path.clone(),
                _ => self.settings.anchor_cgroup.clone(),
            },
            None => self.settings.anchor_cgroup.clone(),
        };

        self.move_pid(pid, &target)?;
        let _ = fs::remove_file(&record_path);
        Ok(())
    }
}

fn read_original_cgroup_record(path: &Path) -> Result<Option<OriginalCgroup>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LimiterError::kernel_refused("read orig_cgrp record", e)),
    };
    let mut lines = text.lines();
    let path = lines.next().map(PathBuf::from);
    let start_time = lines.next().and_then(|l| l.parse::<u64>().ok());
    match (path, start_time) {
        (Some(path), Some(start_time_ticks)) => Ok(Some(OriginalCgroup { path, start_time_ticks })),
        _ => Ok(None),
    }
}

/// Parses the cgroup v2 (`0::`) line of `/proc/<pid>/cgroup` into an
/// absolute cgroupfs path. The `0::` line is always relative to the real
/// cgroupfs mount, regardless of where `Settings::anchor_cgroup` points.
fn read_proc_cgroup_v2_path(pid: i32) -> Result<PathBuf> {
    let contents = fs::read_to_string(format!("/proc/{pid}/cgroup"))
        .map_err(|_| LimiterError::ProcessVanished(pid))?;
    parse_cgroup_v2_line(&contents).ok_or_else(|| {
        LimiterError::RuleMalformed(format!("/proc/{pid}/cgroup has no cgroup v2 (0::) line"))
    })
}

/// Shared by the control plane wherever a `/proc/<pid>/cgroup` listing needs
/// to be resolved to an absolute cgroupfs path: finds the `0::` line among
/// `contents`'s lines and joins it onto the real cgroupfs mount root.
pub(crate) fn parse_cgroup_v2_line(contents: &str) -> Option<PathBuf> {
    contents.lines().find_map(|line| {
        line.strip_prefix("0::").map(|rel| {
            if rel == "/" {
                PathBuf::from("/sys/fs/cgroup")
            } else {
                Path::new("/sys/fs/cgroup").join(rel.trim_start_matches('/'))
            }
        })
    })
}

/// Start-time (field 22 of `/proc/<pid>/stat`), the kernel's own
/// monotonic-for-the-process-lifetime counter, used as the PID-reuse
/// witness.
fn read_proc_starttime(pid: i32) -> Result<u64> {
    let process = Process::new(pid).map_err(|_| LimiterError::ProcessVanished(pid))?;
    let stat = process
        .stat()
        .map_err(|_| LimiterError::ProcessVanished(pid))?;
    Ok(stat.starttime)
}

/// A cgroup is empty iff `cgroup.procs` yields zero bytes on the first
/// read. Opened read-only: this is a control file, not a listing to parse.
pub fn is_cgroup_empty(cgroup_dir: &Path) -> Result<bool> {
    let mut file = fs::File::open(cgroup_dir.join("cgroup.procs"))
        .map_err(|e| LimiterError::kernel_refused("open cgroup.procs", e))?;
    let mut buf = [0u8; 1];
    let n = file
        .read(&mut buf)
        .map_err(|e| LimiterError::kernel_refused("read cgroup.procs", e))?;
    Ok(n == 0)
}
