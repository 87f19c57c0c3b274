//! General Transfer Descriptors: 16 bytes, 16-byte aligned.

use crate::dma::{BusAddr, DmaMemory};
use crate::error::UrbStatus;
use crate::hcd::EpHandle;
use crate::urb::UrbId;

pub const TD_SIZE: usize = 16;
pub const TD_ALIGN: usize = 16;
/// Largest buffer one TD is given; keeps every TD within one page crossing
pub const TD_MAX_BUFFER: usize = 4096;

const TD_CONTROL: u32 = 0x0;
const TD_CBP: u32 = 0x4;
const TD_NEXT: u32 = 0x8;
const TD_BE: u32 = 0xC;

pub const TD_CC_NOERROR: u32 = 0;
pub const TD_CC_CRC: u32 = 1;
pub const TD_CC_BITSTUFFING: u32 = 2;
pub const TD_CC_DATATOGGLEMISMATCH: u32 = 3;
pub const TD_CC_STALL: u32 = 4;
pub const TD_CC_DEVICENOTRESPONDING: u32 = 5;
pub const TD_CC_PIDCHECKFAILURE: u32 = 6;
pub const TD_CC_UNEXPECTEDPID: u32 = 7;
pub const TD_CC_DATAOVERRUN: u32 = 8;
pub const TD_CC_DATAUNDERRUN: u32 = 9;
pub const TD_CC_BUFFEROVERRUN: u32 = 12;
pub const TD_CC_BUFFERUNDERRUN: u32 = 13;
pub const TD_CC_NOTACCESSED: u32 = 14;

/// Buffer rounding: a short last packet is not an error
const TD_R: u32 = 1 << 18;
const TD_DP_SETUP: u32 = 0 << 19;
const TD_DP_OUT: u32 = 1 << 19;
const TD_DP_IN: u32 = 2 << 19;
const TD_DI_SHIFT: u32 = 21;
/// No interrupt for this TD
const TD_DI_NONE: u32 = 7 << 21;
const TD_T_ED: u32 = 0 << 24;
const TD_T_DATA0: u32 = 2 << 24;
const TD_T_DATA1: u32 = 3 << 24;
const TD_CC_SHIFT: u32 = 28;
const TD_CC_MASK: u32 = 0xF << 28;
const TD_PTR_MASK: u32 = !0xF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Setup,
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Data0,
    Data1,
    /// Use the ED's toggle carry
    FromEd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Setup,
    Data,
    Status,
}

/// Software side of a TD, kept in the pool extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct TdExt {
    pub ep: Option<EpHandle>,
    pub urb: Option<UrbId>,
    pub stage: Stage,
    /// Bytes this TD was asked to move
    pub length: usize,
    /// Last TD of its request
    pub last: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TdFill {
    pub pid: Pid,
    pub toggle: Toggle,
    /// Allow a short final packet (IN data)
    pub rounding: bool,
    /// Raise an interrupt when this TD retires
    pub interrupt: bool,
    pub buffer: BusAddr,
    pub length: usize,
}

/// Write control, CBP and BE. NextTD is left alone; it belongs to the chain.
pub fn fill<D: DmaMemory + ?Sized>(mem: &mut D, td: BusAddr, f: &TdFill) {
    let mut control = match f.pid {
        Pid::Setup => TD_DP_SETUP,
        Pid::Out => TD_DP_OUT,
        Pid::In => TD_DP_IN,
    };
    control |= match f.toggle {
        Toggle::Data0 => TD_T_DATA0,
        Toggle::Data1 => TD_T_DATA1,
        Toggle::FromEd => TD_T_ED,
    };
    if f.rounding {
        control |= TD_R;
    }
    control |= if f.interrupt { 0 << TD_DI_SHIFT } else { TD_DI_NONE };
    control |= TD_CC_NOTACCESSED << TD_CC_SHIFT;

    let (cbp, be) = if f.length > 0 {
        (f.buffer, f.buffer + f.length as u32 - 1)
    } else {
        (0, 0)
    };
    mem.write_u32(td + TD_CONTROL, control);
    mem.write_u32(td + TD_CBP, cbp);
    mem.write_u32(td + TD_BE, be);
}

/// Zero the whole descriptor (fresh placeholder).
pub fn clear<D: DmaMemory + ?Sized>(mem: &mut D, td: BusAddr) {
    mem.write_u32(td + TD_CONTROL, TD_CC_NOTACCESSED << TD_CC_SHIFT);
    mem.write_u32(td + TD_CBP, 0);
    mem.write_u32(td + TD_NEXT, 0);
    mem.write_u32(td + TD_BE, 0);
}

pub fn condition_code<D: DmaMemory + ?Sized>(mem: &D, td: BusAddr) -> u32 {
    (mem.read_u32(td + TD_CONTROL) & TD_CC_MASK) >> TD_CC_SHIFT
}

pub fn next<D: DmaMemory + ?Sized>(mem: &D, td: BusAddr) -> BusAddr {
    mem.read_u32(td + TD_NEXT) & TD_PTR_MASK
}

pub fn set_next<D: DmaMemory + ?Sized>(mem: &mut D, td: BusAddr, next: BusAddr) {
    mem.write_u32(td + TD_NEXT, next & TD_PTR_MASK);
}

pub fn buffer<D: DmaMemory + ?Sized>(mem: &D, td: BusAddr) -> (BusAddr, BusAddr) {
    (mem.read_u32(td + TD_CBP), mem.read_u32(td + TD_BE))
}

/// Bytes moved by a retired TD that was asked to move `length`.
///
/// CBP reads zero once the whole buffer was transferred; otherwise it points
/// at the first byte not transferred.
pub fn transferred<D: DmaMemory + ?Sized>(mem: &D, td: BusAddr, length: usize) -> usize {
    let (cbp, be) = buffer(mem, td);
    if cbp == 0 || length == 0 {
        return length;
    }
    let remaining = (be.wrapping_sub(cbp) as usize).wrapping_add(1);
    length.saturating_sub(remaining)
}

/// Map a condition code to a request status.
///
/// Data underrun is a short packet and counts as success.
pub fn status_from_cc(cc: u32) -> UrbStatus {
    match cc {
        TD_CC_NOERROR | TD_CC_DATAUNDERRUN => UrbStatus::Success,
        TD_CC_CRC => UrbStatus::Crc,
        TD_CC_BITSTUFFING => UrbStatus::BitStuffing,
        TD_CC_DATATOGGLEMISMATCH => UrbStatus::DataToggle,
        TD_CC_STALL => UrbStatus::Stall,
        TD_CC_DEVICENOTRESPONDING => UrbStatus::NotResponding,
        TD_CC_PIDCHECKFAILURE => UrbStatus::PidCheck,
        TD_CC_UNEXPECTEDPID => UrbStatus::UnexpectedPid,
        TD_CC_DATAOVERRUN => UrbStatus::DataOverrun,
        TD_CC_BUFFEROVERRUN => UrbStatus::BufferOverrun,
        TD_CC_BUFFERUNDERRUN => UrbStatus::BufferUnderrun,
        _ => UrbStatus::Error,
    }
}
