//! Unix virtual memory backend: mmap reservation, mprotect activation

use super::SlotRegion;
use strand_core::fiber::{BLOCK_SIZE, GUARD_SIZE};
use strand_core::{RtError, RtResult};

/// Hint for the region start (high address to stay clear of heap/libs)
const REGION_START_HINT: usize = 0x6400_0000_0000;

impl SlotRegion {
    /// Reserve `total_size` bytes of address space with no access rights
    pub(super) fn map_region(total_size: usize) -> RtResult<*mut u8> {
        let base = unsafe {
            libc::mmap(
                REGION_START_HINT as *mut libc::c_void,
                total_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RtError::Oom);
        }
        Ok(base as *mut u8)
    }

    /// Make a slot's control block and stack accessible
    ///
    /// The guard page between them keeps PROT_NONE from the initial
    /// reservation, so a stack overflow faults instead of corrupting the
    /// control block.
    pub(super) fn activate_slot(&self, slot_id: u32) -> RtResult<()> {
        let base = self.slot_base(slot_id);

        let ret = unsafe {
            libc::mprotect(
                base as *mut libc::c_void,
                BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(RtError::Oom);
        }

        let stack_base = unsafe { base.add(BLOCK_SIZE + GUARD_SIZE) };
        let stack_size = self.slot_size - BLOCK_SIZE - GUARD_SIZE;
        let ret = unsafe {
            libc::mprotect(
                stack_base as *mut libc::c_void,
                stack_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(RtError::Oom);
        }

        Ok(())
    }

    /// Tell the kernel a released slot's pages are no longer needed
    pub(super) fn deactivate_slot(&self, slot_id: u32) {
        let base = self.slot_base(slot_id);
        unsafe {
            // Keeps the mapping and protections; only the physical pages go.
            libc::madvise(
                base as *mut libc::c_void,
                self.slot_size,
                libc::MADV_DONTNEED,
            );
        }
    }
}

impl Drop for SlotRegion {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.total_size);
            }
        }
    }
}
