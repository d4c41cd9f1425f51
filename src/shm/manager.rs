//! Tracking of the shared-memory regions mapped by this process.

use super::SharedMemoryRegion;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Owns the regions this process has created or attached, keyed by their
/// server-side name.
///
/// Dropping the manager detaches every region but never unlinks; the OS
/// objects outlive the process until [`SharedMemoryManager::destroy`] (or
/// another process) removes them.
#[derive(Debug, Default)]
pub struct SharedMemoryManager {
    regions: BTreeMap<String, SharedMemoryRegion>,
}

impl SharedMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&mut self, region: SharedMemoryRegion) -> &mut SharedMemoryRegion {
        let name = region.name().to_string();
        debug!(name = %name, "Tracking shared memory region");
        self.regions.entry(name).or_insert(region)
    }

    fn ensure_untracked(&self, name: &str) -> Result<()> {
        if self.regions.contains_key(name) {
            return Err(Error::RegionExists(name.to_string()));
        }
        Ok(())
    }

    /// Creates and tracks a new region.
    pub fn create(&mut self, name: &str, key: &str, byte_size: u64) -> Result<&mut SharedMemoryRegion> {
        self.ensure_untracked(name)?;
        let region = SharedMemoryRegion::create(name, key, byte_size)?;
        Ok(self.track(region))
    }

    /// Attaches to an existing OS segment and tracks it under `name`.
    pub fn attach(&mut self, name: &str, key: &str) -> Result<&mut SharedMemoryRegion> {
        self.ensure_untracked(name)?;
        let region = SharedMemoryRegion::attach_as(name, key)?;
        Ok(self.track(region))
    }

    pub fn get(&self, name: &str) -> Option<&SharedMemoryRegion> {
        self.regions.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SharedMemoryRegion> {
        self.regions.get_mut(name)
    }

    /// Server-side names of all tracked regions, sorted.
    pub fn mapped_regions(&self) -> Vec<String> {
        self.regions.keys().cloned().collect()
    }

    /// Stops tracking `name` and hands the still-attached region back.
    pub fn release(&mut self, name: &str) -> Result<SharedMemoryRegion> {
        self.regions
            .remove(name)
            .ok_or_else(|| Error::RegionNotFound(name.to_string()))
    }

    /// Detaches and unlinks `name`.
    ///
    /// The caller must have unregistered the region from the server first.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let mut region = self.release(name)?;
        region.detach();
        region.unlink()
    }

    /// Detaches and unlinks every tracked region, returning the first error.
    pub fn destroy_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for name in self.mapped_regions() {
            if let Err(e) = self.destroy(&name) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Datatype, TensorData};

    fn test_key(name: &str) -> String {
        format!("/tritonstream-mgr-{}-{}", std::process::id(), name)
    }

    #[test]
    fn test_tracks_by_name() {
        let mut manager = SharedMemoryManager::new();
        manager.create("b", &test_key("b"), 32).unwrap();
        manager.create("a", &test_key("a"), 32).unwrap();

        assert_eq!(manager.mapped_regions(), vec!["a".to_string(), "b".to_string()]);
        assert!(matches!(
            manager.create("a", &test_key("a2"), 32),
            Err(Error::RegionExists(_))
        ));

        manager.destroy_all().unwrap();
        assert!(manager.mapped_regions().is_empty());
    }

    #[test]
    fn test_attach_sees_writes_from_creator() {
        let mut owner = SharedMemoryManager::new();
        let key = test_key("shared");
        let region = owner.create("shared", &key, 16).unwrap();
        region
            .write_tensor(&TensorData::Uint32(vec![7, 8, 9, 10]), 0)
            .unwrap();

        let mut reader = SharedMemoryManager::new();
        let attached = reader.attach("shared", &key).unwrap();
        assert_eq!(attached.byte_size(), 16);
        assert_eq!(
            attached.read(Datatype::Uint32, &[4], 0).unwrap(),
            TensorData::Uint32(vec![7, 8, 9, 10])
        );

        let released = reader.release("shared").unwrap();
        assert!(released.is_attached());
        assert!(reader.get("shared").is_none());

        owner.destroy("shared").unwrap();
        assert!(matches!(owner.destroy("shared"), Err(Error::RegionNotFound(_))));
    }
}
