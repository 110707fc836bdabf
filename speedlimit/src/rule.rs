//! Materialises rules as cgroup directories. A rule directory's
//! name is its own persistence: `ensure_rule`/`enumerate`/`backfill` all
//! read or write that single fact, never a side registry.
use std::fs;
use std::path::{Path, PathBuf};

use aya::maps::{HashMap as AyaHashMap, MapData};
use tracing::debug;

use crate::error::{LimiterError, Result};
use crate::keying;
use crate::settings::Settings;
use speedlimit_common::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub bucket_size: u64,
    pub rate_bps: u64,
}

#[derive(Debug, Clone)]
pub struct EnumeratedRule {
    pub path: PathBuf,
    pub key: u64,
    pub rule: Rule,
}

pub struct RuleRegistry<'a> {
    settings: &'a Settings,
}

impl<'a> RuleRegistry<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        RuleRegistry { settings }
    }

    fn dirname(rule: Rule) -> String {
        format!("bucket_{}_rate_{}", rule.bucket_size, rule.rate_bps)
    }

    /// Parses `bucket_<B>_rate_<R>`, rejecting anything else (hidden
    /// entries, non-directories, malformed numerals).
    pub fn parse_dirname(name: &str) -> Option<Rule> {
        let rest = name.strip_prefix("bucket_")?;
        let (bucket_str, rest) = rest.split_once("_rate_")?;
        if rest.is_empty() || bucket_str.is_empty() {
            return None;
        }
        let bucket_size: u64 = bucket_str.parse().ok()?;
        let rate_bps: u64 = rest.parse().ok()?;
        if bucket_size == 0 || rate_bps == 0 {
            return None;
        }
        Some(Rule { bucket_size, rate_bps })
    }

    /// Idempotent: creating the same `(B, R)` twice yields the same path.
    pub fn ensure_rule(&self, rule: Rule) -> Result<PathBuf> {
        fs::create_dir_all(&self.settings.managed_root)
            .map_err(|e| LimiterError::kernel_refused("mkdir managed_root", e))?;
        let path = self.settings.managed_root.join(Self::dirname(rule));
        match fs::create_dir(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "created rule directory");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(path),
            Err(e) => Err(LimiterError::kernel_refused("mkdir rule dir", e)),
        }
    }

    pub fn last_rule(&self) -> Result<Option<(PathBuf, u64)>> {
        let text = match fs::read_to_string(self.settings.last_rule_path()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LimiterError::kernel_refused("read last_rule", e)),
        };
        let mut lines = text.lines();
        let path = lines.next().map(PathBuf::from);
        let key = lines.next().and_then(|l| l.parse::<u64>().ok());
        match (path, key) {
            (Some(path), Some(key)) => Ok(Some((path, key))),
            _ => Ok(None),
        }
    }

    pub fn write_last_rule(&self, path: &Path, key: u64) -> Result<()> {
        if let Some(parent) = self.settings.last_rule_path().parent() {
            fs::create_dir_all(parent).map_err(|e| LimiterError::kernel_refused("mkdir runtime_dir", e))?;
        }
        fs::write(
            self.settings.last_rule_path(),
            format!("{}\n{}\n", path.display(), key),
        )
        .map_err(|e| LimiterError::kernel_refused("write last_rule", e))
    }

    /// Every well-formed child directory of ManagedRoot.
    pub fn enumerate(&self) -> Result<Vec<EnumeratedRule>> {
        let entries = match fs::read_dir(&self.settings.managed_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LimiterError::kernel_refused("readdir managed_root", e)),
        };

        let mut rules = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| LimiterError::kernel_refused("readdir entry", e))?;
            let file_type = entry
                .file_type()
                .map_err(|e| LimiterError::kernel_refused("stat entry", e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rule) = Self::parse_dirname(name) else {
                continue;
            };
            let path = entry.path();
            let key = keying::key(&path);
            rules.push(EnumeratedRule { path, key, rule });
        }
        Ok(rules)
    }

    /// Writes `RuleConfig[key] = {rate, bucket}` for every enumerated rule.
    /// Silently skipped when the config map isn't pinned yet (first-load
    /// case: there is nothing to backfill into).
    pub fn backfill(&self, config_map_pin_path: &Path) -> Result<()> {
        let map_data = match MapData::from_pin(config_map_pin_path) {
            Ok(data) => data,
            Err(_) => return Ok(()),
        };
        let mut map: AyaHashMap<_, u64, RateLimitConfig> = AyaHashMap::try_from(map_data)
            .map_err(|e| LimiterError::kernel_refused("open config map", std::io::Error::other(e)))?;

        for rule in self.enumerate()? {
            if rule.key == 0 {
                continue;
            }
            let cfg = RateLimitConfig {
                rate_bps: rule.rule.rate_bps,
                bucket_size: rule.rule.bucket_size,
            };
            map.insert(rule.key, cfg, 0)
                .map_err(|e| LimiterError::kernel_refused("backfill config", std::io::Error::other(e)))?;
        }
        Ok(())
    }

    /// Removes rule directories whose `cgroup.procs` is empty.
    pub fn gc_empty(&self) -> Result<u32> {
        let mut removed = 0;
        for rule in self.enumerate()? {
            if crate::process_mover::is_cgroup_empty(&rule.path)? {
                match fs::remove_dir(&rule.path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(LimiterError::kernel_refused("rmdir empty rule", e)),
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_under(dir: &Path) -> Settings {
        let mut s = Settings::defaults();
        s.managed_root = dir.join("managed");
        s.runtime_dir = dir.join("run");
        s
    }

    #[test]
    fn parses_well_formed_names() {
        let rule = RuleRegistry::parse_dirname("bucket_1048576_rate_524288").unwrap();
        assert_eq!(rule.bucket_size, 1048576);
        assert_eq!(rule.rate_bps, 524288);
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(RuleRegistry::parse_dirname("bucket_0_rate_100").is_none());
        assert!(RuleRegistry::parse_dirname("bucket_100_rate_0").is_none());
        assert!(RuleRegistry::parse_dirname("bucket_abc_rate_100").is_none());
        assert!(RuleRegistry::parse_dirname("not_a_rule_dir").is_none());
        assert!(RuleRegistry::parse_dirname(".hidden").is_none());
    }

    #[test]
    fn ensure_rule_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let registry = RuleRegistry::new(&settings);
        let rule = Rule { bucket_size: 1024, rate_bps: 1024 };
        let p1 = registry.ensure_rule(rule).unwrap();
        let p2 = registry.ensure_rule(rule).unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn enumerate_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let registry = RuleRegistry::new(&settings);
        registry.ensure_rule(Rule { bucket_size: 2048, rate_bps: 1024 }).unwrap();
        fs::create_dir_all(settings.managed_root.join("garbage")).unwrap();
        fs::write(settings.managed_root.join("bucket_1_rate_file"), b"x").unwrap();

        let rules = registry.enumerate().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule.bucket_size, 2048);
    }

    #[test]
    fn last_rule_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let registry = RuleRegistry::new(&settings);
        assert!(registry.last_rule().unwrap().is_none());

        registry.write_last_rule(Path::new("/sys/fs/cgroup/speedlimit/bucket_1_rate_1"), 42).unwrap();
        let (path, key) = registry.last_rule().unwrap().unwrap();
        assert_eq!(path, PathBuf::from("/sys/fs/cgroup/speedlimit/bucket_1_rate_1"));
        assert_eq!(key, 42);
    }
}
