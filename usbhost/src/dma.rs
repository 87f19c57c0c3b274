//! DMA-visible memory and the bus address translation layer.
//!
//! Hardware descriptors and transfer buffers live in memory the host
//! controller reads and writes by bus address. Everything above this module
//! talks about that memory purely in terms of [`BusAddr`]; the only raw
//! pointer arithmetic in the crate is inside [`DmaArena`] (and the MMIO
//! register accessor in `ohci::regs`).

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;

use crate::error::{UsbError, UsbResult};

/// 32-bit bus (physical) address as seen by the host controller.
pub type BusAddr = u32;

/// Alignment of the arena base; keeps bus alignment and host alignment equal.
pub const ARENA_ALIGN: usize = 4096;

/// Memory shared with the host controller.
pub trait DmaMemory {
    /// Reserve `size` bytes aligned to `align`. `None` when exhausted.
    fn alloc(&mut self, size: usize, align: usize) -> Option<BusAddr>;
    /// Return a block obtained from [`DmaMemory::alloc`] with the same size and alignment.
    fn free(&mut self, addr: BusAddr, size: usize, align: usize);
    fn read_u32(&self, addr: BusAddr) -> u32;
    fn write_u32(&mut self, addr: BusAddr, value: u32);
    fn read_bytes(&self, addr: BusAddr, buf: &mut [u8]);
    fn write_bytes(&mut self, addr: BusAddr, data: &[u8]);

    /// Zero `len` bytes starting at `addr`.
    fn zero(&mut self, addr: BusAddr, len: usize) {
        let zeros = [0u8; 64];
        let mut done = 0;
        while done < len {
            let chunk = core::cmp::min(zeros.len(), len - done);
            self.write_bytes(addr + done as u32, &zeros[..chunk]);
            done += chunk;
        }
    }
}

/// A contiguous DMA region carved up with a first-fit heap.
///
/// The region is either owned (allocated from the global allocator, used on
/// hosted targets and in tests) or borrowed from a reserved, identity-known
/// physical window on the target board.
pub struct DmaArena {
    base: NonNull<u8>,
    size: usize,
    bus_base: BusAddr,
    heap: Heap,
    owned: bool,
}

impl DmaArena {
    /// Allocate an owned arena of `size` bytes that answers to bus addresses
    /// starting at `bus_base`.
    pub fn new(size: usize, bus_base: BusAddr) -> UsbResult<Self> {
        if bus_base as usize % ARENA_ALIGN != 0 || size < ARENA_ALIGN {
            return Err(UsbError::Invalid);
        }
        if (bus_base as u64) + (size as u64) > u32::MAX as u64 + 1 {
            return Err(UsbError::Invalid);
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN).map_err(|_| UsbError::Invalid)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(UsbError::NoMemory)?;
        // SAFETY: `base` points to `size` freshly allocated bytes owned by the arena.
        let heap = unsafe { Heap::new(base.as_ptr(), size) };
        Ok(Self {
            base,
            size,
            bus_base,
            heap,
            owned: true,
        })
    }

    /// Wrap a reserved DMA window.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes for the
    /// lifetime of the arena, must not be used by anything else, and must be
    /// reachable by the controller at `bus_base`.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize, bus_base: BusAddr) -> Self {
        Self {
            base,
            size,
            bus_base,
            heap: Heap::new(base.as_ptr(), size),
            owned: false,
        }
    }

    pub fn bus_base(&self) -> BusAddr {
        self.bus_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes currently handed out.
    pub fn used(&self) -> usize {
        self.heap.used()
    }

    fn offset(&self, addr: BusAddr, len: usize) -> Option<usize> {
        let off = addr.checked_sub(self.bus_base)? as usize;
        if off.checked_add(len)? <= self.size {
            Some(off)
        } else {
            None
        }
    }
}

impl DmaMemory for DmaArena {
    fn alloc(&mut self, size: usize, align: usize) -> Option<BusAddr> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        let ptr = self.heap.allocate_first_fit(layout).ok()?;
        let off = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        Some(self.bus_base + off as u32)
    }

    fn free(&mut self, addr: BusAddr, size: usize, align: usize) {
        let (Some(off), Ok(layout)) = (
            self.offset(addr, size),
            Layout::from_size_align(size.max(1), align),
        ) else {
            log::warn!("dma: free of foreign block {:#010x}+{}", addr, size);
            return;
        };
        // SAFETY: `off + size` is inside the arena and the block came from
        // `allocate_first_fit` with this layout.
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().add(off));
            self.heap.deallocate(ptr, layout);
        }
    }

    fn read_u32(&self, addr: BusAddr) -> u32 {
        match self.offset(addr, 4) {
            // SAFETY: bounds checked above; the arena base is 4 KiB aligned,
            // so a 4-aligned bus address is a 4-aligned host address.
            Some(off) if addr % 4 == 0 => unsafe {
                ptr::read_volatile(self.base.as_ptr().add(off) as *const u32)
            },
            _ => {
                log::warn!("dma: bad read at {:#010x}", addr);
                0
            }
        }
    }

    fn write_u32(&mut self, addr: BusAddr, value: u32) {
        match self.offset(addr, 4) {
            // SAFETY: as in `read_u32`.
            Some(off) if addr % 4 == 0 => unsafe {
                ptr::write_volatile(self.base.as_ptr().add(off) as *mut u32, value)
            },
            _ => log::warn!("dma: bad write at {:#010x}", addr),
        }
    }

    fn read_bytes(&self, addr: BusAddr, buf: &mut [u8]) {
        match self.offset(addr, buf.len()) {
            // SAFETY: bounds checked; `buf` cannot alias the arena.
            Some(off) => unsafe {
                ptr::copy_nonoverlapping(self.base.as_ptr().add(off), buf.as_mut_ptr(), buf.len())
            },
            None => log::warn!("dma: bad read at {:#010x}+{}", addr, buf.len()),
        }
    }

    fn write_bytes(&mut self, addr: BusAddr, data: &[u8]) {
        match self.offset(addr, data.len()) {
            // SAFETY: bounds checked; `data` cannot alias the arena.
            Some(off) => unsafe {
                ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(off), data.len())
            },
            None => log::warn!("dma: bad write at {:#010x}+{}", addr, data.len()),
        }
    }
}

impl Drop for DmaArena {
    fn drop(&mut self) {
        if self.owned {
            if let Ok(layout) = Layout::from_size_align(self.size, ARENA_ALIGN) {
                // SAFETY: allocated in `new` with this exact layout.
                unsafe { alloc::alloc::dealloc(self.base.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_aligned_and_in_range() {
        let mut arena = DmaArena::new(16 * 1024, 0x1000_0000).unwrap();
        let a = arena.alloc(256, 256).unwrap();
        let b = arena.alloc(16, 16).unwrap();
        assert_eq!(a % 256, 0);
        assert_eq!(b % 16, 0);
        assert!(a >= 0x1000_0000 && a < 0x1000_4000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_words_and_bytes() {
        let mut arena = DmaArena::new(8192, 0x2000).unwrap();
        let a = arena.alloc(32, 16).unwrap();
        arena.write_u32(a, 0xdead_beef);
        assert_eq!(arena.read_u32(a), 0xdead_beef);
        arena.write_bytes(a + 4, &[1, 2, 3, 4]);
        assert_eq!(arena.read_u32(a + 4), 0x0403_0201);
        arena.zero(a, 32);
        let mut buf = [0xffu8; 8];
        arena.read_bytes(a, &mut buf);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn test_free_returns_space() {
        let mut arena = DmaArena::new(8192, 0).unwrap();
        let used = arena.used();
        let a = arena.alloc(1024, 64).unwrap();
        assert!(arena.used() > used);
        arena.free(a, 1024, 64);
        assert_eq!(arena.used(), used);
    }

    #[test]
    fn test_out_of_range_reads_zero() {
        let arena = DmaArena::new(4096, 0x8000).unwrap();
        assert_eq!(arena.read_u32(0x10), 0);
        assert_eq!(arena.read_u32(0x9000), 0);
    }

    #[test]
    fn test_rejects_misaligned_bus_base() {
        assert!(DmaArena::new(8192, 0x10).is_err());
    }
}
