//! POSIX shared-memory regions for zero-copy tensor transfer.
//!
//! A [`SharedMemoryRegion`] pairs the server-side region name with the
//! host-wide OS key (`/name` for `shm_open`) and keeps the segment mapped into
//! this process while attached. Tensor contents are stored in the raw
//! native-width layout (see [`crate::tensor::codec`]).
//!
//! Registration with the server is a separate control-plane call made through
//! [`crate::InferenceClient`]; it must follow a successful `create`/`attach`,
//! and the matching unregister must precede [`SharedMemoryRegion::unlink`].

pub mod manager;

pub use manager::SharedMemoryManager;

use crate::error::{Error, Result};
use crate::tensor::codec::{decode_raw, deserialize_bytes_prefix, encode_raw};
use crate::tensor::{element_count, Datatype, TensorData};
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fmt;
use std::fs::File;
use tracing::{debug, info};

/// A named shared-memory segment.
pub struct SharedMemoryRegion {
    name: String,
    key: String,
    byte_size: u64,
    map: Option<MmapMut>,
}

fn open_segment(key: &str, flags: OFlag) -> Result<File> {
    let fd = shm_open(key, flags, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| match errno {
        Errno::EEXIST => Error::RegionExists(key.to_string()),
        Errno::ENOENT => Error::RegionNotFound(key.to_string()),
        other => Error::SharedMemory(other),
    })?;
    Ok(File::from(fd))
}

fn map_segment(file: &File) -> Result<MmapMut> {
    // SAFETY: the mapping is private to this handle; concurrent writers in
    // other processes can only change byte values, never the mapping length.
    let map = unsafe { MmapMut::map_mut(file)? };
    Ok(map)
}

impl SharedMemoryRegion {
    /// Creates a new segment of `byte_size` bytes under `key`.
    ///
    /// Fails with [`Error::RegionExists`] if `key` is already bound on the host.
    pub fn create(name: impl Into<String>, key: impl Into<String>, byte_size: u64) -> Result<Self> {
        let name = name.into();
        let key = key.into();
        if byte_size == 0 {
            return Err(Error::InvalidData(format!(
                "shared memory region {} must have a nonzero size",
                key
            )));
        }

        let file = open_segment(&key, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR)?;
        let map = file
            .set_len(byte_size)
            .map_err(Error::from)
            .and_then(|()| map_segment(&file));
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                let _ = shm_unlink(key.as_str());
                return Err(e);
            }
        };

        info!(name = %name, key = %key, byte_size, "Created shared memory region");
        Ok(Self {
            name,
            key,
            byte_size,
            map: Some(map),
        })
    }

    /// Attaches to an existing segment; the server-side name defaults to the
    /// key without its leading slash.
    pub fn attach(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let name = key.trim_start_matches('/').to_string();
        Self::attach_as(name, key)
    }

    /// Attaches to an existing segment under an explicit server-side name.
    ///
    /// Fails with [`Error::RegionNotFound`] if `key` is not bound.
    pub fn attach_as(name: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let key = key.into();

        let file = open_segment(&key, OFlag::O_RDWR)?;
        let byte_size = file.metadata()?.len();
        let map = map_segment(&file)?;

        debug!(name = %name, key = %key, byte_size, "Attached shared memory region");
        Ok(Self {
            name,
            key,
            byte_size,
            map: Some(map),
        })
    }

    /// Creates the segment, or attaches if `key` already exists and is at
    /// least `byte_size` bytes long.
    pub fn create_or_attach(
        name: impl Into<String>,
        key: impl Into<String>,
        byte_size: u64,
    ) -> Result<Self> {
        let name = name.into();
        let key = key.into();
        match Self::create(name.clone(), key.clone(), byte_size) {
            Err(Error::RegionExists(_)) => {
                let region = Self::attach_as(name, key)?;
                if region.byte_size < byte_size {
                    return Err(Error::OutOfBounds {
                        offset: 0,
                        required: byte_size,
                        byte_size: region.byte_size,
                    });
                }
                Ok(region)
            }
            other => other,
        }
    }

    /// Server-side region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host-wide OS key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn is_attached(&self) -> bool {
        self.map.is_some()
    }

    /// Unmaps the segment from this process. The OS object survives.
    pub fn detach(&mut self) {
        if self.map.take().is_some() {
            debug!(key = %self.key, "Detached shared memory region");
        }
    }

    /// Removes the OS name so no further attach can succeed. Existing
    /// mappings, including this one, stay valid until detached.
    pub fn unlink(&self) -> Result<()> {
        shm_unlink(self.key.as_str()).map_err(|errno| match errno {
            Errno::ENOENT => Error::RegionNotFound(self.key.clone()),
            other => Error::SharedMemory(other),
        })?;
        info!(name = %self.name, key = %self.key, "Unlinked shared memory region");
        Ok(())
    }

    fn bounds(&self, offset: u64, required: u64) -> Result<std::ops::Range<usize>> {
        let out_of_bounds = || Error::OutOfBounds {
            offset,
            required,
            byte_size: self.byte_size,
        };
        let end = offset.checked_add(required).ok_or_else(out_of_bounds)?;
        if end > self.byte_size {
            return Err(out_of_bounds());
        }
        // Both values fit in the mapping, which fits in the address space.
        Ok(offset as usize..end as usize)
    }

    fn mapped(&self) -> Result<&MmapMut> {
        self.map
            .as_ref()
            .ok_or_else(|| Error::RegionDetached(self.key.clone()))
    }

    /// Copies `bytes` into the region at `offset`.
    pub fn write(&mut self, bytes: &[u8], offset: u64) -> Result<()> {
        let range = self.bounds(offset, bytes.len() as u64)?;
        let key = self.key.clone();
        let map = self.map.as_mut().ok_or(Error::RegionDetached(key))?;
        map[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Writes `data` in the raw layout at `offset` and returns the number of
    /// bytes written.
    pub fn write_tensor(&mut self, data: &TensorData, offset: u64) -> Result<u64> {
        let bytes = encode_raw(data.datatype(), data)?;
        self.write(&bytes, offset)?;
        Ok(bytes.len() as u64)
    }

    /// Writes several tensors back to back starting at `offset`. Returns the
    /// total number of bytes written.
    pub fn write_tensors(&mut self, tensors: &[TensorData], offset: u64) -> Result<u64> {
        let mut cursor = offset;
        for tensor in tensors {
            cursor += self.write_tensor(tensor, cursor)?;
        }
        Ok(cursor - offset)
    }

    /// Returns an owned copy of `len` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let range = self.bounds(offset, len)?;
        Ok(self.mapped()?[range].to_vec())
    }

    /// Reads a tensor of `datatype` and `shape` from `offset`.
    ///
    /// The result is an owned copy; the segment may be unlinked by another
    /// process at any time afterwards.
    pub fn read(&self, datatype: Datatype, shape: &[i64], offset: u64) -> Result<TensorData> {
        self.read_window(datatype, shape, offset, self.byte_size.saturating_sub(offset))
    }

    /// Like [`read`](Self::read), but the tensor must lie within the
    /// `window` bytes starting at `offset`. BYTES length prefixes are never
    /// followed past the window.
    pub fn read_window(
        &self,
        datatype: Datatype,
        shape: &[i64],
        offset: u64,
        window: u64,
    ) -> Result<TensorData> {
        let count = element_count(shape)?;

        let Some(size) = datatype.element_size() else {
            let range = self.bounds(offset, window)?;
            let (elements, _) = deserialize_bytes_prefix(&self.mapped()?[range], count)?;
            return Ok(TensorData::Bytes(elements));
        };

        let required = (count as u64).checked_mul(size as u64).ok_or_else(|| {
            Error::InvalidData(format!("shape {:?} overflows", shape))
        })?;
        let range = self.bounds(offset, required)?;
        if required > window {
            return Err(Error::ShapeMismatch(format!(
                "{} tensor of shape {:?} needs {} bytes but the window holds {}",
                datatype, shape, required, window
            )));
        }
        decode_raw(datatype, &self.mapped()?[range], shape)
    }
}

impl fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("byte_size", &self.byte_size)
            .field("attached", &self.is_attached())
            .finish()
    }
}
