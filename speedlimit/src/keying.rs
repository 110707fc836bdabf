//! Derives the key a rule's eBPF map entries live under. The kernel's own
//! `bpf_skb_cgroup_id()` helper returns the cgroup's kernfs node id, which
//! on a non-namespaced host is the same value as the directory's inode
//! number — so the control plane can compute the key purely in userspace,
//! with no syscall beyond `stat`, and the filter derives the matching key
//! independently inside the kernel.
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Returns the key a cgroup directory maps to, or `0` if the directory
/// can't be stat'd (removed mid-operation, permission denied). `0` is never
/// a valid cgroup id, so callers treat it as "no such rule."
pub fn key(rule_dir: &Path) -> u64 {
    match fs::metadata(rule_dir) {
        Ok(meta) => meta.ino(),
        Err(_) => 0,
    }
}
