//! Descriptor pool: fixed-size, aligned, physically contiguous items.
//!
//! Backs every hardware descriptor the OHCI engine hands to the controller.
//! Items are identified by their bus address; the header array (one entry
//! per item, holding the free-list link and a typed extension) lives in
//! ordinary memory and is never seen by hardware.

use alloc::vec::Vec;

use crate::dma::{BusAddr, DmaMemory};
use crate::error::{UsbError, UsbResult};

/// Handle to a checked-out pool item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolItem {
    index: u16,
    addr: BusAddr,
}

impl PoolItem {
    /// Hardware-visible address; the item's identity.
    pub fn addr(&self) -> BusAddr {
        self.addr
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct ItemHeader<X> {
    next_free: Option<u16>,
    in_use: bool,
    ext: X,
}

/// Pool of `count` items of `stride` bytes each.
///
/// `X` is the per-item extension (software bookkeeping kept beside the
/// hardware descriptor); its size is the pool's extension size.
pub struct DescriptorPool<X = ()> {
    base: BusAddr,
    item_size: usize,
    stride: usize,
    align: usize,
    headers: Vec<ItemHeader<X>>,
    free_head: Option<u16>,
    checked_out: usize,
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl<X: Default> DescriptorPool<X> {
    /// Reserve `count` items of `item_size` bytes, each aligned to `align`.
    pub fn alloc<D: DmaMemory + ?Sized>(
        dma: &mut D,
        count: usize,
        item_size: usize,
        align: usize,
    ) -> UsbResult<Self> {
        if count == 0 || count > u16::MAX as usize || item_size == 0 {
            return Err(UsbError::Invalid);
        }
        if !align.is_power_of_two() || align < 4 {
            return Err(UsbError::Invalid);
        }
        let stride = round_up(item_size, align);
        let block = count.checked_mul(stride).ok_or(UsbError::Invalid)?;
        let base = dma.alloc(block, align).ok_or(UsbError::NoMemory)?;
        dma.zero(base, block);

        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            let next_free = if i + 1 < count { Some(i as u16 + 1) } else { None };
            headers.push(ItemHeader {
                next_free,
                in_use: false,
                ext: X::default(),
            });
        }

        log::debug!(
            "pool: {} items x {} bytes (ext {}) at {:#010x}",
            count,
            stride,
            core::mem::size_of::<X>(),
            base
        );

        Ok(Self {
            base,
            item_size,
            stride,
            align,
            headers,
            free_head: Some(0),
            checked_out: 0,
        })
    }

    /// Take a free item. `None` when the pool is exhausted.
    pub fn get_item(&mut self) -> Option<PoolItem> {
        let index = self.free_head?;
        let header = &mut self.headers[index as usize];
        self.free_head = header.next_free.take();
        header.in_use = true;
        header.ext = X::default();
        self.checked_out += 1;
        Some(PoolItem {
            index,
            addr: self.addr_of(index as usize),
        })
    }
}

impl<X> DescriptorPool<X> {
    /// Return an item to the free list.
    pub fn put_item(&mut self, item: PoolItem) {
        let idx = item.index as usize;
        let valid = idx < self.headers.len() && self.addr_of(idx) == item.addr;
        if !valid || !self.headers[idx].in_use {
            log::warn!("pool: put of item {:#010x} not checked out", item.addr);
            return;
        }
        let header = &mut self.headers[idx];
        header.in_use = false;
        header.next_free = self.free_head;
        self.free_head = Some(item.index);
        self.checked_out -= 1;
    }

    /// Map a hardware-reported bus address back to its checked-out item.
    pub fn item_from_phys(&self, addr: BusAddr) -> Option<PoolItem> {
        let off = addr.checked_sub(self.base)? as usize;
        if off % self.stride != 0 {
            return None;
        }
        let index = off / self.stride;
        let header = self.headers.get(index)?;
        if !header.in_use {
            return None;
        }
        Some(PoolItem {
            index: index as u16,
            addr,
        })
    }

    pub fn extension(&self, item: PoolItem) -> &X {
        &self.headers[item.index as usize].ext
    }

    pub fn extension_mut(&mut self, item: PoolItem) -> &mut X {
        &mut self.headers[item.index as usize].ext
    }

    /// Whether `addr` lies inside the pool's block.
    pub fn contains(&self, addr: BusAddr) -> bool {
        addr >= self.base && ((addr - self.base) as usize) < self.block_size()
    }

    pub fn capacity(&self) -> usize {
        self.headers.len()
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out
    }

    pub fn available(&self) -> usize {
        self.headers.len() - self.checked_out
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn base(&self) -> BusAddr {
        self.base
    }

    /// Release the block back to DMA memory.
    pub fn free<D: DmaMemory + ?Sized>(self, dma: &mut D) {
        if self.checked_out != 0 {
            log::warn!(
                "pool: freeing pool at {:#010x} with {} items still checked out",
                self.base,
                self.checked_out
            );
        }
        dma.free(self.base, self.block_size(), self.align);
    }

    fn block_size(&self) -> usize {
        self.headers.len() * self.stride
    }

    fn addr_of(&self, index: usize) -> BusAddr {
        self.base + (index * self.stride) as BusAddr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaArena;
    use proptest::prelude::*;

    fn arena() -> DmaArena {
        DmaArena::new(256 * 1024, 0x0010_0000).unwrap()
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut dma = arena();
        let mut pool: DescriptorPool = DescriptorPool::alloc(&mut dma, 4, 16, 16).unwrap();
        let items: Vec<_> = (0..4).map(|_| pool.get_item().unwrap()).collect();
        assert!(pool.get_item().is_none());
        assert_eq!(pool.checked_out(), 4);
        for item in items {
            pool.put_item(item);
        }
        assert_eq!(pool.available(), 4);
        pool.free(&mut dma);
    }

    #[test]
    fn test_item_from_phys() {
        let mut dma = arena();
        let mut pool: DescriptorPool<u32> = DescriptorPool::alloc(&mut dma, 8, 16, 32).unwrap();
        assert_eq!(pool.stride(), 32);
        let a = pool.get_item().unwrap();
        let b = pool.get_item().unwrap();
        *pool.extension_mut(b) = 7;
        assert_eq!(pool.item_from_phys(b.addr()), Some(b));
        assert_eq!(*pool.extension(pool.item_from_phys(b.addr()).unwrap()), 7);
        assert!(pool.item_from_phys(a.addr() + 4).is_none());
        assert!(pool.item_from_phys(pool.base() + 5 * 32).is_none());
        assert!(pool.item_from_phys(pool.base() + 64 * 32).is_none());
        pool.put_item(a);
        assert!(pool.item_from_phys(a.addr()).is_none());
    }

    #[test]
    fn test_double_put_is_ignored() {
        let mut dma = arena();
        let mut pool: DescriptorPool = DescriptorPool::alloc(&mut dma, 2, 16, 16).unwrap();
        let a = pool.get_item().unwrap();
        pool.put_item(a);
        pool.put_item(a);
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_extension_reset_on_get() {
        let mut dma = arena();
        let mut pool: DescriptorPool<u8> = DescriptorPool::alloc(&mut dma, 1, 16, 16).unwrap();
        let a = pool.get_item().unwrap();
        *pool.extension_mut(a) = 9;
        pool.put_item(a);
        let a = pool.get_item().unwrap();
        assert_eq!(*pool.extension(a), 0);
    }

    #[test]
    fn test_free_with_outstanding_items_does_not_panic() {
        let mut dma = arena();
        let used = dma.used();
        let mut pool: DescriptorPool = DescriptorPool::alloc(&mut dma, 4, 16, 16).unwrap();
        let _held = pool.get_item().unwrap();
        pool.free(&mut dma);
        assert_eq!(dma.used(), used);
    }

    #[test]
    fn test_exhausted_dma_reports_no_memory() {
        let mut dma = DmaArena::new(4096, 0).unwrap();
        let pool: UsbResult<DescriptorPool> = DescriptorPool::alloc(&mut dma, 1024, 16, 16);
        assert_eq!(pool.err(), Some(UsbError::NoMemory));
    }

    proptest! {
        #[test]
        fn prop_get_put_cycles(
            count in 1usize..64,
            item_size in 1usize..80,
            align_shift in 2u32..7,
            rounds in 1usize..4,
        ) {
            let align = 1usize << align_shift;
            let mut dma = arena();
            let mut pool: DescriptorPool = DescriptorPool::alloc(&mut dma, count, item_size, align).unwrap();
            let base = pool.base();
            let end = base + (count * pool.stride()) as u32;
            for _ in 0..rounds {
                let mut items = Vec::new();
                for _ in 0..count {
                    let item = pool.get_item();
                    prop_assert!(item.is_some());
                    let item = item.unwrap();
                    prop_assert_eq!(item.addr() as usize % align, 0);
                    prop_assert!(item.addr() >= base && item.addr() < end);
                    items.push(item);
                }
                prop_assert!(pool.get_item().is_none());
                let mut addrs: Vec<_> = items.iter().map(|i| i.addr()).collect();
                addrs.sort_unstable();
                addrs.dedup();
                prop_assert_eq!(addrs.len(), count);
                for item in items {
                    pool.put_item(item);
                }
                prop_assert_eq!(pool.checked_out(), 0);
            }
            pool.free(&mut dma);
        }
    }
}
