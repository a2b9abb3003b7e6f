//! Byte offsets of the two shared region wire formats.
//!
//! The in-container agent writes a C struct with natural alignment. Offsets
//! are derived here with the same rules and pinned by compile-time size
//! assertions, so a drift in either table fails the build instead of
//! silently misreading a live region.

/// Maximum number of devices tracked by one region.
pub const MAX_DEVICES: usize = 16;
/// Number of process slots in one region.
pub const MAX_PROCESS_SLOTS: usize = 1024;
/// Width of one device UUID entry, NUL padded.
pub const UUID_LEN: usize = 96;
/// `initializedFlag`, `majorVersion`, `minorVersion`, all `i32`.
pub const HEADER_SIZE: usize = 12;

const SEM_SIZE: usize = 32;

/// Offsets inside the per-device memory record.
pub(crate) mod device_memory {
    pub const CONTEXT_SIZE: usize = 0;
    pub const MODULE_SIZE: usize = 8;
    pub const BUFFER_SIZE: usize = 16;
    pub const OFFSET: usize = 24;
    pub const TOTAL: usize = 32;
}

/// Offsets inside the per-device utilization record.
pub(crate) mod device_util {
    pub const DEC_UTIL: usize = 0;
    pub const ENC_UTIL: usize = 8;
    pub const SM_UTIL: usize = 16;
}

const fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

/// Layout of one process slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotLayout {
    pub size: usize,
    pub pid: usize,
    pub host_pid: usize,
    pub used: usize,
    pub device_memory_size: usize,
    pub monitor_used: usize,
    pub device_util: usize,
    pub device_util_size: usize,
    pub status: usize,
}

impl SlotLayout {
    const fn new(device_memory_size: usize, device_util_size: usize, reserved: usize) -> Self {
        let used = 8;
        let monitor_used = used + MAX_DEVICES * device_memory_size;
        let device_util = monitor_used + MAX_DEVICES * 8;
        let status = device_util + MAX_DEVICES * device_util_size;
        Self {
            size: align_up(status + 4, 8) + reserved,
            pid: 0,
            host_pid: 4,
            used,
            device_memory_size,
            monitor_used,
            device_util,
            device_util_size,
            status,
        }
    }
}

/// Layout of a whole region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub size: usize,
    pub num: usize,
    pub uuids: usize,
    pub limit: usize,
    pub sm_limit: usize,
    pub procs: usize,
    pub slot: SlotLayout,
    pub procnum: usize,
    pub utilization_switch: usize,
    pub recent_kernel: usize,
    pub priority: usize,
    pub last_kernel_time: Option<usize>,
}

impl Layout {
    /// `leading_words` counts the `i32`/`u32` fields that precede the semaphore.
    const fn new(
        leading_words: usize,
        slot: SlotLayout,
        has_last_kernel_time: bool,
        reserved: usize,
    ) -> Self {
        let num = align_up(leading_words * 4 + SEM_SIZE, 8);
        let uuids = num + 8;
        let limit = uuids + MAX_DEVICES * UUID_LEN;
        let sm_limit = limit + MAX_DEVICES * 8;
        let procs = sm_limit + MAX_DEVICES * 8;
        let procnum = procs + MAX_PROCESS_SLOTS * slot.size;
        let tail = procnum + 16;
        let last_kernel_time = if has_last_kernel_time {
            Some(align_up(tail, 8))
        } else {
            None
        };
        let end = match last_kernel_time {
            Some(offset) => offset + 8,
            None => tail,
        };
        Self {
            size: align_up(end, 8) + reserved,
            num,
            uuids,
            limit,
            sm_limit,
            procs,
            slot,
            procnum,
            utilization_switch: procnum + 4,
            recent_kernel: procnum + 8,
            priority: procnum + 12,
            last_kernel_time,
        }
    }

    pub const fn slot_offset(&self, slot: usize) -> usize {
        self.procs + slot * self.slot.size
    }

    pub const fn device_memory_offset(&self, slot: usize, device: usize, field: usize) -> usize {
        self.slot_offset(slot) + self.slot.used + device * self.slot.device_memory_size + field
    }

    pub const fn device_util_offset(&self, slot: usize, device: usize, field: usize) -> usize {
        self.slot_offset(slot) + self.slot.device_util + device * self.slot.device_util_size + field
    }

    pub const fn monitor_used_offset(&self, slot: usize, device: usize) -> usize {
        self.slot_offset(slot) + self.slot.monitor_used + device * 8
    }
}

/// The unversioned format: flag, sm init flag and owner pid precede the
/// semaphore, records carry no reserved words.
pub(crate) const LEGACY: Layout = Layout::new(3, SlotLayout::new(40, 24, 0), false, 0);

/// Version 1: major/minor version follow the flag, every record grows
/// reserved words and the region gains `lastKernelTime`.
pub(crate) const V1: Layout = Layout::new(5, SlotLayout::new(64, 48, 24), true, 32);

/// Size of a legacy cache file on disk. The agent extends the file one byte
/// past the struct, so this is `LEGACY.size + 1`.
///
/// Legacy regions carry no version field and are recognised by this exact
/// size alone. Any change to the legacy struct silently breaks detection;
/// kept as is for compatibility with agents already deployed.
pub const LEGACY_FILE_SIZE: usize = 1_197_897;

const _: () = assert!(LEGACY.slot.size == 1168);
const _: () = assert!(LEGACY.size == 1_197_896);
const _: () = assert!(LEGACY_FILE_SIZE == LEGACY.size + 1);
const _: () = assert!(V1.slot.size == 1960);
const _: () = assert!(V1.size == 2_008_952);
const _: () = assert!(V1.num == 56 && LEGACY.num == 48);

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn legacy_offsets_follow_c_alignment() {
        assert_eq!(LEGACY.uuids, 56);
        assert_eq!(LEGACY.limit, 1592);
        assert_eq!(LEGACY.sm_limit, 1720);
        assert_eq!(LEGACY.procs, 1848);
        assert_eq!(LEGACY.slot.status, 1160);
        assert_eq!(LEGACY.procnum, 1_197_880);
        assert_eq!(LEGACY.priority, 1_197_892);
        assert_eq!(LEGACY.last_kernel_time, None);
    }

    #[test]
    fn v1_offsets_follow_c_alignment() {
        assert_eq!(V1.uuids, 64);
        assert_eq!(V1.limit, 1600);
        assert_eq!(V1.procs, 1856);
        assert_eq!(V1.slot.monitor_used, 1032);
        assert_eq!(V1.slot.device_util, 1160);
        assert_eq!(V1.slot.status, 1928);
        assert_eq!(V1.procnum, 2_008_896);
        assert_eq!(V1.last_kernel_time, Some(2_008_912));
    }

    #[test]
    fn every_u64_field_is_naturally_aligned() {
        for layout in [LEGACY, V1] {
            assert_eq!(layout.num % 8, 0);
            assert_eq!(layout.procs % 8, 0);
            assert_eq!(layout.slot.size % 8, 0);
            assert_eq!(
                layout.device_memory_offset(MAX_PROCESS_SLOTS - 1, MAX_DEVICES - 1, device_memory::TOTAL) % 8,
                0
            );
        }
    }
}
