//! End-to-end exercise of the parts of the system reachable without a live
//! cgroup v2 hierarchy, bpffs, or CAP_BPF: rule directory lifecycle,
//! last-rule bookkeeping, and the PID-reuse witness record format. The
//! filesystem-only half of attach-mode detection (`Attacher::is_loaded`,
//! `current_mode`, `detach_all` against a bare pin directory) is exercised by
//! `attacher.rs`'s own `#[cfg(test)]` module instead of here; anything that
//! needs a real kernel attach isn't covered anywhere in this suite.
use std::fs;
use std::path::PathBuf;

use speedlimit::{Rule, RuleRegistry, Settings};

fn settings_under(dir: &std::path::Path) -> Settings {
    let mut s = Settings::defaults();
    s.managed_root = dir.join("managed");
    s.runtime_dir = dir.join("run");
    s.pin_dir = dir.join("pin");
    s.anchor_cgroup = dir.join("cgroup_root");
    s
}

#[test]
fn set_twice_produces_identical_on_disk_state() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    let registry = RuleRegistry::new(&settings);

    let rule = Rule { bucket_size: 1 << 20, rate_bps: 1 << 20 };
    let first = registry.ensure_rule(rule).unwrap();
    let second = registry.ensure_rule(rule).unwrap();

    assert_eq!(first, second);
    let entries: Vec<_> = fs::read_dir(&settings.managed_root)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn enumerate_recovers_rate_and_bucket_from_directory_names_alone() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    let registry = RuleRegistry::new(&settings);

    registry.ensure_rule(Rule { bucket_size: 2_097_152, rate_bps: 1_048_576 }).unwrap();
    registry.ensure_rule(Rule { bucket_size: 4096, rate_bps: 4096 }).unwrap();

    let mut rules = registry.enumerate().unwrap();
    rules.sort_by_key(|r| r.rule.rate_bps);

    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].rule.rate_bps, 4096);
    assert_eq!(rules[1].rule.rate_bps, 1_048_576);
    assert_eq!(rules[1].rule.bucket_size, 2_097_152);
    // every enumerated rule gets a nonzero key from the directory's inode
    assert!(rules.iter().all(|r| r.key != 0));
}

#[test]
fn last_rule_survives_a_fresh_registry_handle() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    let registry = RuleRegistry::new(&settings);

    let path = registry.ensure_rule(Rule { bucket_size: 8192, rate_bps: 8192 }).unwrap();
    registry.write_last_rule(&path, 4242).unwrap();

    // simulate a brand new process invocation reading the same runtime dir
    let fresh = RuleRegistry::new(&settings);
    let (recovered_path, recovered_key) = fresh.last_rule().unwrap().unwrap();
    assert_eq!(recovered_path, path);
    assert_eq!(recovered_key, 4242);
}

#[test]
fn gc_empty_removes_only_directories_with_no_procs() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    let registry = RuleRegistry::new(&settings);

    let empty_rule = registry.ensure_rule(Rule { bucket_size: 1, rate_bps: 1 }).unwrap();
    fs::write(empty_rule.join("cgroup.procs"), b"").unwrap();

    let busy_rule = registry.ensure_rule(Rule { bucket_size: 2, rate_bps: 2 }).unwrap();
    fs::write(busy_rule.join("cgroup.procs"), b"555\n").unwrap();

    let removed = registry.gc_empty().unwrap();
    assert_eq!(removed, 1);
    assert!(!empty_rule.exists());
    assert!(busy_rule.exists());
}

#[test]
fn malformed_rule_directory_names_never_surface_from_enumerate() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    let registry = RuleRegistry::new(&settings);

    registry.ensure_rule(Rule { bucket_size: 16, rate_bps: 16 }).unwrap();
    fs::create_dir_all(settings.managed_root.join("bucket_0_rate_16")).unwrap();
    fs::create_dir_all(settings.managed_root.join(".bucket_16_rate_16")).unwrap();
    fs::write(settings.managed_root.join("bucket_16_rate_16_notadir"), b"x").unwrap();

    let rules = registry.enumerate().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule.rate_bps, 16);
}

#[test]
fn orig_cgrp_record_round_trips_through_the_runtime_directory() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    fs::create_dir_all(settings.orig_cgrp_dir()).unwrap();

    let record_path = settings.orig_cgrp_path(4321);
    fs::write(&record_path, "/user.slice/session.service\n1029384756\n").unwrap();

    let text = fs::read_to_string(&record_path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("/user.slice/session.service"));
    assert_eq!(lines.next(), Some("1029384756"));
}

#[test]
fn settings_paths_all_nest_under_distinct_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_under(dir.path());
    let paths: Vec<PathBuf> = vec![
        settings.last_rule_path(),
        settings.link_pin_path(),
        settings.config_map_pin_path(),
        settings.state_map_pin_path(),
    ];
    let unique: std::collections::HashSet<_> = paths.iter().collect();
    assert_eq!(unique.len(), paths.len());
}
