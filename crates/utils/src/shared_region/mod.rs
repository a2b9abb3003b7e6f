//! Host-side view of the per-container shared region.
//!
//! An agent inside the container keeps per-process device usage in a file
//! backed region; the host maps the same file and reads it without a syscall
//! per query. Two incompatible wire formats exist. The legacy one has no
//! version field and is recognised purely by file size, newer ones carry a
//! major version in the header.
//!
//! Aggregates are never stored in the region: every device-level accessor
//! sums the matching field over all process slots on each call.
//!
//! Consistency: the agent writes without any lock the host can observe, and
//! the host writes limits the same way. A reader may see a limit broadcast
//! half applied, or a slot mid-update. Usage is polled, so this is accepted
//! rather than guarded against.

use std::path::Path;
use std::ptr;

use serde::Serialize;
use thiserror::Error;

mod layout;
mod memory;

pub use layout::HEADER_SIZE;
pub use layout::LEGACY_FILE_SIZE;
pub use layout::MAX_DEVICES;
pub use layout::MAX_PROCESS_SLOTS;
pub use layout::UUID_LEN;
pub use memmap2::MmapMut;
pub use memory::anonymous_copy;
pub use memory::MapError;
pub use memory::MappedFile;
pub use memory::RegionMemory;

use layout::device_memory;
use layout::device_util;
use layout::Layout;

/// Value of `initializedFlag` once the agent has set the region up.
pub const SHARED_REGION_MAGIC_FLAG: i32 = 19_920_718;

/// Size in bytes of a version 1 region.
pub const V1_REGION_SIZE: usize = layout::V1.size;

/// Size in bytes of the legacy region struct (the file is one byte longer).
pub const LEGACY_REGION_SIZE: usize = layout::LEGACY.size;

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("region of {size} bytes is smaller than the {min} byte header")]
    TooSmall { size: usize, min: usize },

    #[error("initialized flag {found} does not match {SHARED_REGION_MAGIC_FLAG}")]
    MagicMismatch { found: i32 },

    #[error("unknown region format: size {size}, version {major}.{minor}")]
    UnknownVersion { size: usize, major: i32, minor: i32 },

    #[error("region of {size} bytes is truncated, {version} needs {needed}")]
    Truncated {
        size: usize,
        needed: usize,
        version: WireVersion,
    },

    #[error(transparent)]
    Map(#[from] MapError),
}

/// Wire format of a region, chosen once when the region is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum WireVersion {
    #[display("legacy")]
    Legacy,
    #[display("v1.{minor}")]
    V1 { minor: i32 },
}

impl WireVersion {
    fn layout(self) -> &'static Layout {
        match self {
            WireVersion::Legacy => &layout::LEGACY,
            WireVersion::V1 { .. } => &layout::V1,
        }
    }
}

/// The fixed header shared by every format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub initialized_flag: i32,
    pub major_version: i32,
    pub minor_version: i32,
}

/// One in-use process slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSlot {
    pub index: usize,
    pub pid: i32,
    pub host_pid: i32,
    pub status: i32,
    /// Total memory per device, indices `0..device_num()`.
    pub used_memory: Vec<u64>,
}

/// Accessors every wire format provides.
///
/// Device indices must be below [`MAX_DEVICES`]; the tracker only asks for
/// indices below [`device_num`](UsageInfo::device_num).
pub trait UsageInfo {
    fn device_max(&self) -> usize {
        MAX_DEVICES
    }
    fn device_num(&self) -> usize;
    fn device_memory_context_size(&self, idx: usize) -> u64;
    fn device_memory_module_size(&self, idx: usize) -> u64;
    fn device_memory_buffer_size(&self, idx: usize) -> u64;
    fn device_memory_offset(&self, idx: usize) -> u64;
    fn device_memory_total(&self, idx: usize) -> u64;
    fn device_monitor_used(&self, idx: usize) -> u64;
    fn device_dec_util(&self, idx: usize) -> u64;
    fn device_enc_util(&self, idx: usize) -> u64;
    fn device_sm_util(&self, idx: usize) -> u64;
    fn is_valid_uuid(&self, idx: usize) -> bool;
    fn device_uuid(&self, idx: usize) -> String;
    fn device_memory_limit(&self, idx: usize) -> u64;
    fn set_device_memory_limit(&self, limit: u64);
    fn device_sm_limit(&self, idx: usize) -> u64;
    fn set_device_sm_limit(&self, limit: u64);
    fn last_kernel_time(&self) -> i64;
    fn priority(&self) -> i32;
    fn recent_kernel(&self) -> i32;
    fn set_recent_kernel(&self, value: i32);
    fn utilization_switch(&self) -> i32;
    fn set_utilization_switch(&self, value: i32);
    fn process_slots(&self) -> Vec<ProcessSlot>;
}

/// A validated region over some backing memory.
#[derive(Debug)]
pub struct SharedRegion<M> {
    memory: M,
    version: WireVersion,
}

impl SharedRegion<MappedFile> {
    /// Maps `path` and validates the region inside it.
    pub fn open(path: &Path) -> Result<Self, RegionError> {
        let mapped = MappedFile::open(path)?;
        Self::new(mapped)
    }
}

impl<M: RegionMemory> SharedRegion<M> {
    /// Validates the header and picks the wire format.
    ///
    /// On error the memory is dropped, which unmaps a [`MappedFile`].
    pub fn new(memory: M) -> Result<Self, RegionError> {
        let size = memory.len();
        if size < HEADER_SIZE {
            return Err(RegionError::TooSmall {
                size,
                min: HEADER_SIZE,
            });
        }

        let header = read_header(&memory);
        if header.initialized_flag != SHARED_REGION_MAGIC_FLAG {
            return Err(RegionError::MagicMismatch {
                found: header.initialized_flag,
            });
        }

        let version = if size == LEGACY_FILE_SIZE {
            WireVersion::Legacy
        } else if header.major_version == 1 {
            WireVersion::V1 {
                minor: header.minor_version,
            }
        } else {
            return Err(RegionError::UnknownVersion {
                size,
                major: header.major_version,
                minor: header.minor_version,
            });
        };

        let needed = version.layout().size;
        if size < needed {
            return Err(RegionError::Truncated {
                size,
                needed,
                version,
            });
        }

        Ok(Self { memory, version })
    }

    pub fn version(&self) -> WireVersion {
        self.version
    }

    pub fn header(&self) -> Header {
        read_header(&self.memory)
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    fn layout(&self) -> &'static Layout {
        self.version.layout()
    }

    fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.memory.len());
        // SAFETY: in bounds (checked above), 8-aligned because the base is
        // 8-aligned and every layout offset of a u64 field is a multiple of 8.
        unsafe { ptr::read_volatile(self.memory.as_ptr().add(offset).cast::<u64>()) }
    }

    fn write_u64(&self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.memory.len());
        // SAFETY: see read_u64.
        unsafe { ptr::write_volatile(self.memory.as_ptr().add(offset).cast::<u64>(), value) }
    }

    fn read_i32(&self, offset: usize) -> i32 {
        read_i32(&self.memory, offset)
    }

    fn write_i32(&self, offset: usize, value: i32) {
        assert!(offset + 4 <= self.memory.len());
        // SAFETY: in bounds, 4-aligned by layout.
        unsafe { ptr::write_volatile(self.memory.as_ptr().add(offset).cast::<i32>(), value) }
    }

    fn sum_device_memory(&self, idx: usize, field: usize) -> u64 {
        let layout = self.layout();
        check_device(idx);
        (0..MAX_PROCESS_SLOTS)
            .map(|slot| self.read_u64(layout.device_memory_offset(slot, idx, field)))
            .fold(0, u64::wrapping_add)
    }

    fn sum_device_util(&self, idx: usize, field: usize) -> u64 {
        let layout = self.layout();
        check_device(idx);
        (0..MAX_PROCESS_SLOTS)
            .map(|slot| self.read_u64(layout.device_util_offset(slot, idx, field)))
            .fold(0, u64::wrapping_add)
    }

    /// Writes `value` to `field` of every device below `device_num()`.
    fn broadcast(&self, base: usize, value: u64) {
        for idx in 0..self.device_num() {
            self.write_u64(base + idx * 8, value);
        }
    }
}

fn check_device(idx: usize) {
    assert!(
        idx < MAX_DEVICES,
        "device index {idx} out of range (max {MAX_DEVICES})"
    );
}

fn read_i32<M: RegionMemory>(memory: &M, offset: usize) -> i32 {
    assert!(offset + 4 <= memory.len());
    // SAFETY: in bounds, 4-aligned by layout.
    unsafe { ptr::read_volatile(memory.as_ptr().add(offset).cast::<i32>()) }
}

fn read_header<M: RegionMemory>(memory: &M) -> Header {
    Header {
        initialized_flag: read_i32(memory, 0),
        major_version: read_i32(memory, 4),
        minor_version: read_i32(memory, 8),
    }
}

impl<M: RegionMemory> UsageInfo for SharedRegion<M> {
    fn device_num(&self) -> usize {
        // The count is agent-written; never let it index past the arrays.
        (self.read_u64(self.layout().num) as usize).min(MAX_DEVICES)
    }

    fn device_memory_context_size(&self, idx: usize) -> u64 {
        self.sum_device_memory(idx, device_memory::CONTEXT_SIZE)
    }

    fn device_memory_module_size(&self, idx: usize) -> u64 {
        self.sum_device_memory(idx, device_memory::MODULE_SIZE)
    }

    fn device_memory_buffer_size(&self, idx: usize) -> u64 {
        self.sum_device_memory(idx, device_memory::BUFFER_SIZE)
    }

    fn device_memory_offset(&self, idx: usize) -> u64 {
        self.sum_device_memory(idx, device_memory::OFFSET)
    }

    fn device_memory_total(&self, idx: usize) -> u64 {
        self.sum_device_memory(idx, device_memory::TOTAL)
    }

    fn device_monitor_used(&self, idx: usize) -> u64 {
        let layout = self.layout();
        check_device(idx);
        (0..MAX_PROCESS_SLOTS)
            .map(|slot| self.read_u64(layout.monitor_used_offset(slot, idx)))
            .fold(0, u64::wrapping_add)
    }

    fn device_dec_util(&self, idx: usize) -> u64 {
        self.sum_device_util(idx, device_util::DEC_UTIL)
    }

    fn device_enc_util(&self, idx: usize) -> u64 {
        self.sum_device_util(idx, device_util::ENC_UTIL)
    }

    fn device_sm_util(&self, idx: usize) -> u64 {
        self.sum_device_util(idx, device_util::SM_UTIL)
    }

    fn is_valid_uuid(&self, idx: usize) -> bool {
        check_device(idx);
        let offset = self.layout().uuids + idx * UUID_LEN;
        // SAFETY: within the uuid array of a validated layout.
        unsafe { ptr::read_volatile(self.memory.as_ptr().add(offset)) != 0 }
    }

    fn device_uuid(&self, idx: usize) -> String {
        check_device(idx);
        let offset = self.layout().uuids + idx * UUID_LEN;
        let mut raw = [0u8; UUID_LEN];
        for (i, byte) in raw.iter_mut().enumerate() {
            // SAFETY: within the uuid array of a validated layout.
            *byte = unsafe { ptr::read_volatile(self.memory.as_ptr().add(offset + i)) };
        }
        let end = raw.iter().position(|b| *b == 0).unwrap_or(UUID_LEN);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    fn device_memory_limit(&self, idx: usize) -> u64 {
        check_device(idx);
        self.read_u64(self.layout().limit + idx * 8)
    }

    fn set_device_memory_limit(&self, limit: u64) {
        self.broadcast(self.layout().limit, limit);
    }

    fn device_sm_limit(&self, idx: usize) -> u64 {
        check_device(idx);
        self.read_u64(self.layout().sm_limit + idx * 8)
    }

    fn set_device_sm_limit(&self, limit: u64) {
        self.broadcast(self.layout().sm_limit, limit);
    }

    fn last_kernel_time(&self) -> i64 {
        match self.layout().last_kernel_time {
            Some(offset) => self.read_u64(offset) as i64,
            None => 0,
        }
    }

    fn priority(&self) -> i32 {
        self.read_i32(self.layout().priority)
    }

    fn recent_kernel(&self) -> i32 {
        self.read_i32(self.layout().recent_kernel)
    }

    fn set_recent_kernel(&self, value: i32) {
        self.write_i32(self.layout().recent_kernel, value);
    }

    fn utilization_switch(&self) -> i32 {
        self.read_i32(self.layout().utilization_switch)
    }

    fn set_utilization_switch(&self, value: i32) {
        self.write_i32(self.layout().utilization_switch, value);
    }

    fn process_slots(&self) -> Vec<ProcessSlot> {
        let layout = self.layout();
        let devices = self.device_num();
        (0..MAX_PROCESS_SLOTS)
            .filter_map(|index| {
                let base = layout.slot_offset(index);
                let pid = self.read_i32(base + layout.slot.pid);
                if pid == 0 {
                    return None;
                }
                let used_memory = (0..devices)
                    .map(|d| self.read_u64(layout.device_memory_offset(index, d, device_memory::TOTAL)))
                    .collect();
                Some(ProcessSlot {
                    index,
                    pid,
                    host_pid: self.read_i32(base + layout.slot.host_pid),
                    status: self.read_i32(base + layout.slot.status),
                    used_memory,
                })
            })
            .collect()
    }
}
