use std::mem;
use std::ptr;
use std::slice;

use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::StoreError;
use crate::sync::Semaphore;

pub const NUM_PODS: usize = 256;
pub const POD_DEPTH: usize = 256;
pub const KEY_LEN: usize = 32;
pub const VALUE_LEN: usize = 256;

pub(crate) const SLOT_SIZE: usize = KEY_LEN + VALUE_LEN;

/// What to do with a key or value longer than its slot buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Clamp to the buffer size. The dropped tail is lost silently.
    Truncate,
    /// Refuse the operation with `KeyTooLong` / `ValueTooLong`.
    Reject,
}

impl Default for OverflowPolicy {
    fn default() -> OverflowPolicy {
        OverflowPolicy::Truncate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the segment link file.
    pub data_dir: String,
    /// Name of the store. Processes attaching under the same
    /// `data_dir`/`name` pair share one segment.
    pub name: String,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            data_dir: "/tmp".to_string(),
            name: "shmkv".to_string(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(data_dir: &str, name: &str) -> StoreConfig {
        StoreConfig {
            data_dir: data_dir.to_string(),
            name: name.to_string(),
            overflow: OverflowPolicy::default(),
        }
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> StoreConfig {
        self.overflow = policy;
        self
    }

    pub(crate) fn link_path(&self) -> String {
        format!("{}/{}", &self.data_dir, &self.name)
    }
}

/// Cross-process pod state, mapped at the start of each pod region. The
/// slot buffers follow immediately after it.
#[repr(C)]
pub(crate) struct PodHeader {
    write_cursor: u32,
    num_readers: u32,
    read_gate: libc::sem_t,
    write_gate: libc::sem_t,
}

/// Sizes and offsets of the mapped segment, computed once. Every access
/// into the mapping goes through this descriptor and `PodView`; nothing
/// else does offset arithmetic.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentLayout {
    header_size: usize,
    pod_size: usize,
}

impl SegmentLayout {
    pub fn new() -> SegmentLayout {
        let header_size = mem::size_of::<PodHeader>();
        let slots_size = POD_DEPTH * SLOT_SIZE;
        // Pods are laid out back to back, so the pod size must keep the
        // next header aligned.
        let pod_size = align_up(header_size + slots_size, mem::align_of::<PodHeader>());
        SegmentLayout {
            header_size,
            pod_size,
        }
    }

    pub fn pod_size(&self) -> usize {
        self.pod_size
    }

    pub fn total_size(&self) -> usize {
        NUM_PODS * self.pod_size
    }

    pub fn pod_offset(&self, pod: usize) -> usize {
        pod * self.pod_size
    }

    /// Offset of a slot's key buffer relative to its pod's start. The
    /// value buffer sits `KEY_LEN` bytes further.
    pub fn slot_offset(&self, slot: usize) -> usize {
        self.header_size + slot * SLOT_SIZE
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Maps the store segment named by `cfg`, creating it when no segment of
/// that name exists yet. Returns the mapping and whether this call
/// created it; only the creating caller may initialize pod state.
pub(crate) fn map_segment(
    cfg: &StoreConfig,
    layout: &SegmentLayout,
) -> Result<(Shmem, bool), StoreError> {
    match ShmemConf::new()
        .size(layout.total_size())
        .flink(cfg.link_path())
        .create()
    {
        Ok(shmem) => Ok((shmem, true)),
        Err(ShmemError::LinkExists) => {
            let shmem = ShmemConf::new().flink(cfg.link_path()).open()?;
            if shmem.len() < layout.total_size() {
                return Err(StoreError::SegmentTooSmall {
                    expected: layout.total_size(),
                    actual: shmem.len(),
                });
            }
            Ok((shmem, false))
        }
        Err(e) => Err(StoreError::SharedMemory(e)),
    }
}

/// Typed window over one pod's bytes in the mapping. Slot and cursor
/// accessors assume the caller holds the pod's lock.
pub(crate) struct PodView {
    base: *mut u8,
    layout: SegmentLayout,
}

impl PodView {
    /// `segment_base` must point at a mapping of at least
    /// `layout.total_size()` bytes that outlives the view.
    pub unsafe fn new(segment_base: *mut u8, layout: SegmentLayout, pod: usize) -> PodView {
        PodView {
            base: segment_base.add(layout.pod_offset(pod)),
            layout,
        }
    }

    fn header(&self) -> *mut PodHeader {
        self.base as *mut PodHeader
    }

    /// Zeroes the pod and initializes both gates. Runs exactly once per
    /// segment lifetime, on the creation path.
    pub fn initialize(&self) -> Result<(), StoreError> {
        unsafe {
            ptr::write_bytes(self.base, 0, self.layout.pod_size());
            Semaphore::init(ptr::addr_of_mut!((*self.header()).read_gate), 1)?;
            Semaphore::init(ptr::addr_of_mut!((*self.header()).write_gate), 1)?;
        }
        Ok(())
    }

    pub fn read_gate_ptr(&self) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.header()).read_gate) }
    }

    pub fn write_gate_ptr(&self) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.header()).write_gate) }
    }

    pub fn num_readers_ptr(&self) -> *mut u32 {
        unsafe { ptr::addr_of_mut!((*self.header()).num_readers) }
    }

    /// The next slot to be overwritten.
    pub fn write_cursor(&self) -> usize {
        unsafe { ptr::addr_of!((*self.header()).write_cursor).read() as usize }
    }

    pub fn set_write_cursor(&self, slot: usize) {
        unsafe { ptr::addr_of_mut!((*self.header()).write_cursor).write(slot as u32) }
    }

    pub fn key_at(&self, slot: usize) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.add(self.layout.slot_offset(slot)), KEY_LEN) }
    }

    pub fn value_at(&self, slot: usize) -> &[u8] {
        unsafe {
            slice::from_raw_parts(
                self.base.add(self.layout.slot_offset(slot) + KEY_LEN),
                VALUE_LEN,
            )
        }
    }

    /// Overwrites a slot in place. `key` is already padded to the buffer
    /// size and `value` already clamped to it; the value's tail is
    /// zeroed so stale bytes from the previous occupant cannot leak.
    pub fn store_slot(&self, slot: usize, key: &[u8; KEY_LEN], value: &[u8]) {
        debug_assert!(value.len() <= VALUE_LEN);
        unsafe {
            let dst = self.base.add(self.layout.slot_offset(slot));
            ptr::copy_nonoverlapping(key.as_ptr(), dst, KEY_LEN);
            ptr::write_bytes(dst.add(KEY_LEN), 0, VALUE_LEN);
            ptr::copy_nonoverlapping(value.as_ptr(), dst.add(KEY_LEN), value.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_size_keeps_headers_aligned() {
        let layout = SegmentLayout::new();
        assert_eq!(layout.pod_size() % mem::align_of::<PodHeader>(), 0);
        assert_eq!(layout.total_size(), NUM_PODS * layout.pod_size());
    }

    #[test]
    fn last_slot_fits_inside_the_pod() {
        let layout = SegmentLayout::new();
        assert!(layout.slot_offset(POD_DEPTH - 1) + SLOT_SIZE <= layout.pod_size());
    }

    #[test]
    fn pods_do_not_overlap() {
        let layout = SegmentLayout::new();
        assert_eq!(layout.pod_offset(1), layout.pod_offset(0) + layout.pod_size());
        assert!(layout.pod_offset(NUM_PODS - 1) + layout.pod_size() <= layout.total_size());
    }
}
