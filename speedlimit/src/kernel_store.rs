//! Owns the bpffs namespace that pins kernel objects: one
//! directory holding the link pin and the two map pins. Every path this
//! module touches is derived from `Settings`, never hardcoded twice.
use std::fs;
use std::path::{Path, PathBuf};

use aya::maps::MapData;
use tracing::debug;

use crate::error::{LimiterError, Result};
use crate::settings::Settings;

pub struct KernelObjectStore<'a> {
    settings: &'a Settings,
}

impl<'a> KernelObjectStore<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        KernelObjectStore { settings }
    }

    /// Ensures the pin directory exists under bpffs.
    pub fn ensure_namespace(&self) -> Result<()> {
        fs::create_dir_all(&self.settings.pin_dir)
            .map_err(|e| LimiterError::kernel_refused("mkdir pin_dir", e))
    }

    /// Clears whatever is pinned at `path` before the caller pins a fresh
    /// object there, giving replace (unlink-then-pin) semantics.
    /// Callers invoke this immediately before `aya`'s own `.pin(path)` on
    /// the map or link handle they're holding.
    pub fn prepare_for_pin(&self, path: &Path) -> Result<()> {
        self.unpin(path)
    }

    /// Removes a pin if present. Idempotent: a missing pin is success.
    pub fn unpin(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LimiterError::kernel_refused("unpin", e)),
        }
    }

    /// Opens a pinned map handle, or `NotFound` if nothing is pinned there.
    pub fn open_pinned_map(&self, path: &Path) -> Result<MapData> {
        MapData::from_pin(path).map_err(|_| LimiterError::NotFound(path.display().to_string()))
    }

    /// True iff the link pin file is present under the namespace.
    pub fn link_pin_exists(&self) -> bool {
        self.settings.link_pin_path().exists()
    }

    /// Iterates kernel program ids, yielding only those whose name matches
    /// `name`.
    pub fn enumerate_programs(&self, name: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for info in aya::programs::loaded_programs() {
            let info = info
                .map_err(|e| LimiterError::kernel_refused("enumerate_programs", std::io::Error::other(e)))?;
            if info.name_as_str() == Some(name) {
                ids.push(info.id());
            }
        }
        debug!(program = name, count = ids.len(), "enumerated kernel programs");
        Ok(ids)
    }

    /// Removes the whole pin tree in one shot.
    pub fn purge(&self) -> Result<()> {
        match fs::remove_dir_all(&self.settings.pin_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LimiterError::kernel_refused("purge pin_dir", e)),
        }
    }

    pub fn config_map_pin_path(&self) -> PathBuf {
        self.settings.config_map_pin_path()
    }

    pub fn state_map_pin_path(&self) -> PathBuf {
        self.settings.state_map_pin_path()
    }

    pub fn link_pin_path(&self) -> PathBuf {
        self.settings.link_pin_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_under(dir: &Path) -> Settings {
        let mut s = Settings::defaults();
        s.pin_dir = dir.join("pin");
        s
    }

    #[test]
    fn ensure_namespace_creates_pin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let store = KernelObjectStore::new(&settings);
        store.ensure_namespace().unwrap();
        assert!(settings.pin_dir.is_dir());
    }

    #[test]
    fn unpin_missing_path_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let store = KernelObjectStore::new(&settings);
        store.unpin(&settings.link_pin_path()).unwrap();
    }

    #[test]
    fn purge_removes_whole_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_under(dir.path());
        let store = KernelObjectStore::new(&settings);
        store.ensure_namespace().unwrap();
        fs::write(settings.link_pin_path(), b"x").unwrap();
        store.purge().unwrap();
        assert!(!settings.pin_dir.exists());
    }
}
