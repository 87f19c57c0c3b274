//! Endpoint Descriptors: 16 bytes, 16-byte aligned.
//!
//! The control word and head pointer are also written by the controller, so
//! flag changes are read-modify-write through the helpers below and never
//! blind stores. List splicing only rewrites next pointers, which is safe
//! while the controller is walking the list.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::dma::{BusAddr, DmaMemory};
use crate::pool::{DescriptorPool, PoolItem};

use super::td;

pub const ED_SIZE: usize = 16;
pub const ED_ALIGN: usize = 16;

const ED_CONTROL: u32 = 0x0;
const ED_TAIL: u32 = 0x4;
const ED_HEAD: u32 = 0x8;
const ED_NEXT: u32 = 0xC;

const ED_FA_MASK: u32 = 0x7F; // Function address (7 bits)
const ED_EN_SHIFT: u32 = 7;
const ED_EN_MASK: u32 = 0xF << 7; // Endpoint number (4 bits)
const ED_D_MASK: u32 = 3 << 11;
const ED_D_TD: u32 = 0 << 11; // Get direction from TD
const ED_D_OUT: u32 = 1 << 11;
const ED_D_IN: u32 = 2 << 11;
const ED_S: u32 = 1 << 13; // Speed: 1=low, 0=full
const ED_K: u32 = 1 << 14; // Skip
const ED_F: u32 = 1 << 15; // Format: 1=ISO, 0=general
const ED_MPS_SHIFT: u32 = 16;
const ED_MPS_MASK: u32 = 0x7FF << 16;

/// Halted, in HeadP
pub const ED_HEAD_HALT: u32 = 1 << 0;
/// Toggle carry, in HeadP
pub const ED_HEAD_CARRY: u32 = 1 << 1;
const ED_PTR_MASK: u32 = !0xF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdDirection {
    /// Taken from each TD (control endpoints)
    FromTd,
    Out,
    In,
}

#[derive(Debug, Clone, Copy)]
pub struct EdParams {
    pub function_address: u8,
    pub endpoint_number: u8,
    pub direction: EdDirection,
    pub low_speed: bool,
    pub skip: bool,
    pub iso: bool,
    pub max_packet_size: u16,
}

impl EdParams {
    /// Placeholder node that never carries data (list heads, interrupt tree).
    pub fn dummy() -> Self {
        Self {
            function_address: 0,
            endpoint_number: 0,
            direction: EdDirection::FromTd,
            low_speed: false,
            skip: true,
            iso: false,
            max_packet_size: 0,
        }
    }
}

/// Encode the control word and clear head/tail/next.
pub fn init_ed<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr, params: &EdParams) {
    let dir = match params.direction {
        EdDirection::FromTd => ED_D_TD,
        EdDirection::Out => ED_D_OUT,
        EdDirection::In => ED_D_IN,
    };
    let mut control = (params.function_address as u32 & ED_FA_MASK)
        | (((params.endpoint_number as u32) << ED_EN_SHIFT) & ED_EN_MASK)
        | dir
        | (((params.max_packet_size as u32) << ED_MPS_SHIFT) & ED_MPS_MASK);
    if params.low_speed {
        control |= ED_S;
    }
    if params.skip {
        control |= ED_K;
    }
    if params.iso {
        control |= ED_F;
    }
    mem.write_u32(ed + ED_CONTROL, control);
    mem.write_u32(ed + ED_TAIL, 0);
    mem.write_u32(ed + ED_HEAD, 0);
    mem.write_u32(ed + ED_NEXT, 0);
}

fn modify<D: DmaMemory + ?Sized>(mem: &mut D, addr: BusAddr, clear: u32, set: u32) {
    let v = mem.read_u32(addr);
    mem.write_u32(addr, (v & !clear) | set);
}

pub fn set_skip<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr) {
    modify(mem, ed + ED_CONTROL, 0, ED_K);
}

pub fn clear_skip<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr) {
    modify(mem, ed + ED_CONTROL, ED_K, 0);
}

pub fn is_skipped<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> bool {
    mem.read_u32(ed + ED_CONTROL) & ED_K != 0
}

pub fn set_max_packet_size<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr, mps: u16) {
    modify(
        mem,
        ed + ED_CONTROL,
        ED_MPS_MASK,
        ((mps as u32) << ED_MPS_SHIFT) & ED_MPS_MASK,
    );
}

pub fn max_packet_size<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> u16 {
    ((mem.read_u32(ed + ED_CONTROL) & ED_MPS_MASK) >> ED_MPS_SHIFT) as u16
}

pub fn function_address<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> u8 {
    (mem.read_u32(ed + ED_CONTROL) & ED_FA_MASK) as u8
}

pub fn is_halted<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> bool {
    mem.read_u32(ed + ED_HEAD) & ED_HEAD_HALT != 0
}

pub fn clear_halt<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr) {
    modify(mem, ed + ED_HEAD, ED_HEAD_HALT, 0);
}

pub fn toggle_carry<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> bool {
    mem.read_u32(ed + ED_HEAD) & ED_HEAD_CARRY != 0
}

pub fn set_toggle_carry<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr, carry: bool) {
    if carry {
        modify(mem, ed + ED_HEAD, 0, ED_HEAD_CARRY);
    } else {
        modify(mem, ed + ED_HEAD, ED_HEAD_CARRY, 0);
    }
}

pub fn head_td<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> BusAddr {
    mem.read_u32(ed + ED_HEAD) & ED_PTR_MASK
}

/// Point HeadP at `td`, keeping the halt and carry bits.
pub fn set_head_td<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr, td: BusAddr) {
    let flags = mem.read_u32(ed + ED_HEAD) & (ED_HEAD_HALT | ED_HEAD_CARRY);
    mem.write_u32(ed + ED_HEAD, (td & ED_PTR_MASK) | flags);
}

pub fn tail_td<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> BusAddr {
    mem.read_u32(ed + ED_TAIL) & ED_PTR_MASK
}

pub fn set_tail_td<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr, td: BusAddr) {
    mem.write_u32(ed + ED_TAIL, td & ED_PTR_MASK);
}

pub fn next_ed<D: DmaMemory + ?Sized>(mem: &D, ed: BusAddr) -> BusAddr {
    mem.read_u32(ed + ED_NEXT) & ED_PTR_MASK
}

pub fn set_next_ed<D: DmaMemory + ?Sized>(mem: &mut D, ed: BusAddr, next: BusAddr) {
    mem.write_u32(ed + ED_NEXT, next & ED_PTR_MASK);
}

/// Splice `ed` in right after `prev`.
///
/// `ed` gets its successor first, so the controller sees either the old list
/// or the complete new one.
pub fn link_ed<D: DmaMemory + ?Sized>(mem: &mut D, prev: BusAddr, ed: BusAddr) {
    let next = next_ed(mem, prev);
    set_next_ed(mem, ed, next);
    set_next_ed(mem, prev, ed);
}

/// Remove `ed` (the successor of `prev`) from the hardware list.
///
/// `ed` keeps its own next pointer, so a controller currently sitting on it
/// still finds its way back into the list. The descriptor must not be reused
/// until a frame has passed.
pub fn unlink_ed<D: DmaMemory + ?Sized>(mem: &mut D, prev: BusAddr, ed: BusAddr) {
    if next_ed(mem, prev) != ed {
        log::warn!("ohci: unlink of ED {:#010x} not after {:#010x}", ed, prev);
        return;
    }
    let next = next_ed(mem, ed);
    set_next_ed(mem, prev, next);
}

/// An ED together with the TDs queued on it.
///
/// The last TD is always the placeholder the hardware chain ends on
/// (HeadP == TailP means "nothing to do").
pub struct EndpointQueue {
    ed: PoolItem,
    tds: VecDeque<PoolItem>,
}

impl EndpointQueue {
    pub fn new(ed: PoolItem) -> Self {
        Self {
            ed,
            tds: VecDeque::new(),
        }
    }

    pub fn ed(&self) -> PoolItem {
        self.ed
    }

    pub fn td_count(&self) -> usize {
        self.tds.len()
    }

    /// The placeholder at the end of the chain.
    pub fn tail(&self) -> Option<PoolItem> {
        self.tds.back().copied()
    }

    /// TDs in chain order, placeholder included.
    pub fn tds(&self) -> impl Iterator<Item = &PoolItem> + '_ {
        self.tds.iter()
    }

    /// Append `td` to the chain and make it the new tail.
    pub fn insert_td<D: DmaMemory + ?Sized>(&mut self, mem: &mut D, td: PoolItem) {
        let ed = self.ed.addr();
        match self.tds.back() {
            Some(tail) => {
                td::set_next(mem, tail.addr(), td.addr());
                set_tail_td(mem, ed, td.addr());
            }
            None => {
                set_head_td(mem, ed, td.addr());
                set_tail_td(mem, ed, td.addr());
            }
        }
        self.tds.push_back(td);
    }

    /// Drop `td` from the logical list. The hardware chain is not touched.
    pub fn remove_td(&mut self, td: PoolItem) -> bool {
        match self.tds.iter().position(|t| *t == td) {
            Some(pos) => {
                self.tds.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Stop the endpoint's list processing and return every queued TD except
    /// the placeholder to `pool`.
    ///
    /// HeadP is set to TailP with the halt and toggle-carry bits preserved.
    /// TDs the controller already retired may still sit on its internal done
    /// list; they are not returned to `pool` but handed back to the caller,
    /// who must hold them until they show up on the done queue.
    pub fn delete_all_pending_td<D, X>(&mut self, mem: &mut D, pool: &mut DescriptorPool<X>) -> Vec<PoolItem>
    where
        D: DmaMemory + ?Sized,
    {
        let mut retired = Vec::new();
        let Some(placeholder) = self.tds.back().copied() else {
            return retired;
        };
        let ed = self.ed.addr();
        set_head_td(mem, ed, placeholder.addr());
        set_tail_td(mem, ed, placeholder.addr());
        while self.tds.len() > 1 {
            let Some(td) = self.tds.pop_front() else {
                break;
            };
            if td::condition_code(&*mem, td.addr()) == td::TD_CC_NOTACCESSED {
                pool.put_item(td);
            } else {
                retired.push(td);
            }
        }
        retired
    }

    /// Hand back every TD, placeholder included, and the ED itself.
    /// Returns the retired TDs [`EndpointQueue::delete_all_pending_td`] kept.
    pub fn free<D, X>(mut self, mem: &mut D, td_pool: &mut DescriptorPool<X>, ed_pool: &mut DescriptorPool) -> Vec<PoolItem>
    where
        D: DmaMemory + ?Sized,
    {
        let retired = self.delete_all_pending_td(mem, td_pool);
        if let Some(td) = self.tds.pop_front() {
            td_pool.put_item(td);
        }
        ed_pool.put_item(self.ed);
        retired
    }
}
