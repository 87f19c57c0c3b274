//! OHCI (Open Host Controller Interface) driver for USB 1.1.
//!
//! Key pieces:
//! - Host Controller Communications Area (HCCA): interrupt table + done head
//! - Endpoint Descriptors (ED) on the control, bulk and periodic lists
//! - Transfer Descriptors (TD) queued on each ED, ending on a placeholder
//! - Interrupt bandwidth tree for periodic endpoints
//!
//! Hardware descriptors come from two [`DescriptorPool`]s carved out of the
//! controller's DMA memory. Transfer data is staged in DMA bounce buffers.
//! Anything the controller might still be looking at (an unlinked ED, TDs
//! of an aborted endpoint) is only reclaimed on the next `frame_tick`.

pub mod bandwidth;
pub mod ed;
pub mod regs;
pub mod td;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::PowerSwitching;
use crate::descriptor::{Direction, EndpointType, UsbSpeed};
use crate::dma::{BusAddr, DmaMemory};
use crate::error::{UrbStatus, UsbError, UsbResult};
use crate::hcd::{
    Completed, EndpointParams, EpHandle, HcState, HostControllerDriver, HubChange, HubStatus,
    PortChange, PortStatus, PowerTarget,
};
use crate::pool::{DescriptorPool, PoolItem};
use crate::urb::{Urb, UrbFunction, UrbId};

use bandwidth::{BandwidthTree, Placement};
use ed::{EdDirection, EdParams, EndpointQueue, ED_ALIGN, ED_SIZE};
use regs::*;
use td::{Pid, Stage, TdExt, TdFill, Toggle, TD_ALIGN, TD_MAX_BUFFER, TD_SIZE};

pub use regs::{MmioRegisters, OhciRegisters};

const HCCA_SIZE: usize = 256;
const HCCA_ALIGN: usize = 256;
/// HccaFrameNumber (16 bits, written by HC)
pub const HCCA_FRAME_NUMBER: u32 = 0x80;
/// HccaDoneHead (written by HC)
pub const HCCA_DONE_HEAD: u32 = 0x84;

const BOUNCE_ALIGN: usize = 16;
const SETUP_SIZE: usize = 8;

/// Operational state with all lists enabled, control/bulk ratio 4:1
const RUN_CONTROL: u32 = CTRL_HCFS_OPERATIONAL | CTRL_CLE | CTRL_BLE | CTRL_PLE | CTRL_CBSR_MASK;

/// Sizing and policy for one controller
#[derive(Debug, Clone, Copy)]
pub struct OhciConfig {
    /// User endpoints (the list heads and interrupt tree come on top)
    pub max_endpoints: usize,
    pub max_tds: usize,
    pub power_switching: PowerSwitching,
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 32,
            max_tds: 128,
            power_switching: PowerSwitching::PerPort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Control,
    Bulk,
    Interrupt(Placement),
}

struct Endpoint {
    queue: EndpointQueue,
    params: EndpointParams,
    list: ListKind,
    pending: usize,
}

/// One request on its way through the hardware
struct Transfer {
    ep: EpHandle,
    /// Bounce block (address, size)
    bounce: Option<(BusAddr, usize)>,
    data_addr: BusAddr,
    length: usize,
    dir_in: bool,
    actual: usize,
}

const STATUS_BITS: [(u32, PortStatus); 7] = [
    (RH_PS_CCS, PortStatus::CONNECTION),
    (RH_PS_PES, PortStatus::ENABLE),
    (RH_PS_PSS, PortStatus::SUSPEND),
    (RH_PS_POCI, PortStatus::OVER_CURRENT),
    (RH_PS_PRS, PortStatus::RESET),
    (RH_PS_PPS, PortStatus::POWER),
    (RH_PS_LSDA, PortStatus::LOW_SPEED),
];

const CHANGE_BITS: [(u32, PortChange); 5] = [
    (RH_PS_CSC, PortChange::CONNECTION),
    (RH_PS_PESC, PortChange::ENABLE),
    (RH_PS_PSSC, PortChange::SUSPEND),
    (RH_PS_OCIC, PortChange::OVER_CURRENT),
    (RH_PS_PRSC, PortChange::RESET),
];

/// OHCI controller
pub struct Ohci<R: OhciRegisters, D: DmaMemory> {
    regs: R,
    dma: D,
    config: OhciConfig,
    hcca: BusAddr,
    ed_pool: DescriptorPool,
    td_pool: DescriptorPool<TdExt>,
    tree: BandwidthTree,
    control_head: PoolItem,
    bulk_head: PoolItem,
    /// EDs in hardware list order after each head
    control_list: Vec<EpHandle>,
    bulk_list: Vec<EpHandle>,
    interrupt_lists: BTreeMap<usize, Vec<EpHandle>>,
    endpoints: BTreeMap<EpHandle, Endpoint>,
    next_ep: u32,
    transfers: BTreeMap<UrbId, Transfer>,
    /// Skipped, waiting one frame before their TDs are reclaimed
    aborting: Vec<EpHandle>,
    /// Unlinked, waiting one frame before going back to the pool
    retiring: Vec<(EpHandle, Endpoint)>,
    /// TDs reclaimed after the controller retired them; they stay checked
    /// out until the done queue hands them back
    awaiting_done: Vec<PoolItem>,
    completions: Vec<Completed>,
    num_ports: u8,
    removed: bool,
}

impl<R: OhciRegisters, D: DmaMemory> Ohci<R, D> {
    /// Allocate the HCCA, descriptor pools, interrupt tree and list heads.
    /// The controller is not touched until [`HostControllerDriver::start`].
    pub fn new(regs: R, mut dma: D, config: OhciConfig) -> UsbResult<Self> {
        let hcca = dma.alloc(HCCA_SIZE, HCCA_ALIGN).ok_or(UsbError::NoMemory)?;
        dma.zero(hcca, HCCA_SIZE);

        let ed_count = bandwidth::NODE_COUNT + 2 + config.max_endpoints;
        let mut ed_pool = DescriptorPool::alloc(&mut dma, ed_count, ED_SIZE, ED_ALIGN)?;
        let td_pool = DescriptorPool::alloc(&mut dma, config.max_tds, TD_SIZE, TD_ALIGN)?;

        let mut tree = BandwidthTree::new();
        tree.build(&mut dma, &mut ed_pool, hcca)?;

        let control_head = ed_pool.get_item().ok_or(UsbError::NoMemory)?;
        let bulk_head = ed_pool.get_item().ok_or(UsbError::NoMemory)?;
        ed::init_ed(&mut dma, control_head.addr(), &EdParams::dummy());
        ed::init_ed(&mut dma, bulk_head.addr(), &EdParams::dummy());

        let num_ports = (regs.read(HC_RH_DESCRIPTOR_A) & RH_A_NDP_MASK).min(15) as u8;

        Ok(Self {
            regs,
            dma,
            config,
            hcca,
            ed_pool,
            td_pool,
            tree,
            control_head,
            bulk_head,
            control_list: Vec::new(),
            bulk_list: Vec::new(),
            interrupt_lists: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            next_ep: 1,
            transfers: BTreeMap::new(),
            aborting: Vec::new(),
            retiring: Vec::new(),
            awaiting_done: Vec::new(),
            completions: Vec::new(),
            num_ports,
            removed: false,
        })
    }

    pub fn hcca(&self) -> BusAddr {
        self.hcca
    }

    pub fn dma(&self) -> &D {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut D {
        &mut self.dma
    }

    /// Bus address of an endpoint's ED.
    pub fn endpoint_ed(&self, ep: EpHandle) -> Option<BusAddr> {
        self.endpoints.get(&ep).map(|e| e.queue.ed().addr())
    }

    /// TDs queued on an endpoint, placeholder included.
    pub fn td_count(&self, ep: EpHandle) -> Option<usize> {
        self.endpoints.get(&ep).map(|e| e.queue.td_count())
    }

    /// (EDs, TDs) currently checked out of the pools.
    pub fn descriptor_usage(&self) -> (usize, usize) {
        (self.ed_pool.checked_out(), self.td_pool.checked_out())
    }

    pub fn bandwidth(&self) -> &BandwidthTree {
        &self.tree
    }

    fn check_port(&self, port: u8) -> UsbResult<()> {
        if port == 0 || port > self.num_ports {
            return Err(UsbError::Invalid);
        }
        Ok(())
    }

    /// Program RhDescriptorA/B for the configured power switching mode.
    fn program_power_mode(&mut self) {
        let mut a = self.regs.read(HC_RH_DESCRIPTOR_A) & !(RH_A_PSM | RH_A_NPS);
        let mut b = self.regs.read(HC_RH_DESCRIPTOR_B) & 0xFFFF;
        match self.config.power_switching {
            PowerSwitching::AlwaysOn => a |= RH_A_NPS,
            PowerSwitching::Ganged => {}
            PowerSwitching::PerPort => {
                a |= RH_A_PSM;
                let ports = ((1u32 << self.num_ports) - 1) << 1;
                b |= ports << RH_B_PPCM_SHIFT;
            }
        }
        self.regs.write(HC_RH_DESCRIPTOR_A, a);
        self.regs.write(HC_RH_DESCRIPTOR_B, b);
    }

    /// Hardware list predecessor of `handle` and its position in the list.
    fn list_position(&self, handle: EpHandle, list: ListKind) -> Option<(usize, BusAddr)> {
        let (eds, head) = match list {
            ListKind::Control => (&self.control_list, self.control_head.addr()),
            ListKind::Bulk => (&self.bulk_list, self.bulk_head.addr()),
            ListKind::Interrupt(p) => (
                self.interrupt_lists.get(&p.node)?,
                self.tree.node_ed(p.node)?.addr(),
            ),
        };
        let pos = eds.iter().position(|h| *h == handle)?;
        let prev = if pos == 0 {
            head
        } else {
            self.endpoints.get(&eds[pos - 1])?.queue.ed().addr()
        };
        Some((pos, prev))
    }

    fn list_mut(&mut self, list: ListKind) -> &mut Vec<EpHandle> {
        match list {
            ListKind::Control => &mut self.control_list,
            ListKind::Bulk => &mut self.bulk_list,
            ListKind::Interrupt(p) => self.interrupt_lists.entry(p.node).or_default(),
        }
    }

    /// Walk the done queue the controller wrote back and retire each TD in
    /// completion order.
    fn process_done_queue(&mut self) {
        let mut addr = self.dma.read_u32(self.hcca + HCCA_DONE_HEAD) & !0xF;
        self.dma.write_u32(self.hcca + HCCA_DONE_HEAD, 0);

        // hardware links the done queue newest first
        let mut done: Vec<PoolItem> = Vec::new();
        let mut steps = 0;
        while addr != 0 {
            steps += 1;
            if steps > 2 * self.td_pool.capacity() {
                log::error!("ohci: done queue loops");
                break;
            }
            match self.td_pool.item_from_phys(addr) {
                Some(item) if done.contains(&item) => {
                    log::error!("ohci: done queue loops at {:#010x}", addr);
                    break;
                }
                Some(item) => done.push(item),
                // the entries behind it still belong to us
                None => log::warn!("ohci: done queue names unknown TD {:#010x}", addr),
            }
            addr = td::next(&self.dma, addr);
        }
        for item in done.into_iter().rev() {
            self.retire_td(item);
        }
    }

    fn retire_td(&mut self, item: PoolItem) {
        if let Some(pos) = self.awaiting_done.iter().position(|t| *t == item) {
            self.awaiting_done.swap_remove(pos);
            self.td_pool.put_item(item);
            log::debug!("ohci: reclaimed TD {:#010x} reached the done queue", item.addr());
            return;
        }
        let ext = *self.td_pool.extension(item);
        let cc = td::condition_code(&self.dma, item.addr());
        let moved = td::transferred(&self.dma, item.addr(), ext.length);

        let (Some(handle), Some(urb)) = (ext.ep, ext.urb) else {
            log::warn!("ohci: retired TD {:#010x} carries no request", item.addr());
            self.td_pool.put_item(item);
            return;
        };
        if let Some(endpoint) = find_endpoint(&mut self.endpoints, &mut self.retiring, handle) {
            endpoint.queue.remove_td(item);
        }
        self.td_pool.put_item(item);

        let Some(xfer) = self.transfers.get_mut(&urb) else {
            return;
        };
        if ext.stage == Stage::Data {
            xfer.actual += moved;
        }

        if cc != td::TD_CC_NOERROR {
            let status = td::status_from_cc(cc);
            if !status.is_success() {
                log::debug!("ohci: request {:?} failed with condition code {}", urb, cc);
            }
            self.drop_request_tds(handle, urb);
            self.complete(urb, status);
        } else if ext.last {
            self.complete(urb, UrbStatus::Success);
        }
    }

    /// After a TD error the ED is halted with the rest of the request still
    /// queued. Drop those TDs, point HeadP at whatever follows and clear the
    /// halt. The toggle carry is preserved.
    fn drop_request_tds(&mut self, handle: EpHandle, urb: UrbId) {
        let Some(endpoint) = find_endpoint(&mut self.endpoints, &mut self.retiring, handle) else {
            return;
        };
        let doomed: Vec<PoolItem> = endpoint
            .queue
            .tds()
            .filter(|t| self.td_pool.extension(**t).urb == Some(urb))
            .copied()
            .collect();
        for item in doomed {
            endpoint.queue.remove_td(item);
            if td::condition_code(&self.dma, item.addr()) == td::TD_CC_NOTACCESSED {
                self.td_pool.put_item(item);
            } else {
                self.awaiting_done.push(item);
            }
        }
        let ed = endpoint.queue.ed().addr();
        if let Some(first) = endpoint.queue.tds().next() {
            ed::set_head_td(&mut self.dma, ed, first.addr());
        }
        ed::clear_halt(&mut self.dma, ed);
    }

    fn complete(&mut self, urb: UrbId, status: UrbStatus) {
        let Some(xfer) = self.transfers.remove(&urb) else {
            return;
        };
        let mut data = Vec::new();
        let actual = xfer.actual.min(xfer.length);
        if xfer.dir_in && actual > 0 {
            data = vec![0; actual];
            self.dma.read_bytes(xfer.data_addr, &mut data);
        }
        if let Some((addr, size)) = xfer.bounce {
            self.dma.free(addr, size, BOUNCE_ALIGN);
        }
        if let Some(endpoint) = find_endpoint(&mut self.endpoints, &mut self.retiring, xfer.ep) {
            endpoint.pending = endpoint.pending.saturating_sub(1);
        }
        self.completions.push(Completed {
            urb,
            status,
            actual_length: actual,
            data,
        });
    }

    fn cancel_all_on(&mut self, handle: EpHandle) {
        let urbs: Vec<UrbId> = self
            .transfers
            .iter()
            .filter(|(_, x)| x.ep == handle)
            .map(|(id, _)| *id)
            .collect();
        for urb in urbs {
            self.complete(urb, UrbStatus::Cancelled);
        }
    }

    fn finish_aborts(&mut self) {
        for handle in core::mem::take(&mut self.aborting) {
            if let Some(endpoint) = self.endpoints.get_mut(&handle) {
                let retired = endpoint
                    .queue
                    .delete_all_pending_td(&mut self.dma, &mut self.td_pool);
                self.awaiting_done.extend(retired);
                let ed = endpoint.queue.ed().addr();
                ed::clear_halt(&mut self.dma, ed);
                ed::clear_skip(&mut self.dma, ed);
            }
            self.cancel_all_on(handle);
        }
    }

    fn finish_retires(&mut self) {
        for (handle, endpoint) in core::mem::take(&mut self.retiring) {
            let Endpoint {
                queue, params, list, ..
            } = endpoint;
            let retired = queue.free(&mut self.dma, &mut self.td_pool, &mut self.ed_pool);
            self.awaiting_done.extend(retired);
            if let ListKind::Interrupt(p) = list {
                self.tree.remove_ep(p, params.max_packet_size as u32);
            }
            self.cancel_all_on(handle);
            log::debug!("ohci: endpoint {:?} freed", handle);
        }
    }

    /// Stop everything; the controller will not run another frame.
    fn shutdown(&mut self) {
        self.removed = true;
        self.regs.write(HC_INTERRUPT_DISABLE, INT_MIE);
        self.regs.write(HC_CONTROL, CTRL_HCFS_RESET);
        for endpoint in self.endpoints.values_mut() {
            let retired = endpoint
                .queue
                .delete_all_pending_td(&mut self.dma, &mut self.td_pool);
            self.awaiting_done.extend(retired);
        }
        self.aborting.clear();
        self.finish_retires();
        // a reset controller has dropped its done list
        for item in core::mem::take(&mut self.awaiting_done) {
            self.td_pool.put_item(item);
        }
        let urbs: Vec<UrbId> = self.transfers.keys().copied().collect();
        for urb in urbs {
            self.complete(urb, UrbStatus::Cancelled);
        }
    }

    fn stages(urb: &Urb, length: usize, data_addr: BusAddr, setup_addr: BusAddr) -> Vec<(TdFill, Stage)> {
        let dir_in = urb.direction() == Direction::In;
        let data_pid = if dir_in { Pid::In } else { Pid::Out };
        let mut stages = Vec::new();
        let is_control = matches!(urb.function, UrbFunction::Control(_));

        if is_control {
            stages.push((
                TdFill {
                    pid: Pid::Setup,
                    toggle: Toggle::Data0,
                    rounding: false,
                    interrupt: false,
                    buffer: setup_addr,
                    length: SETUP_SIZE,
                },
                Stage::Setup,
            ));
        }

        let mut offset = 0;
        while offset < length || (offset == 0 && !is_control) {
            let chunk = core::cmp::min(TD_MAX_BUFFER, length - offset);
            let toggle = if is_control && offset == 0 {
                Toggle::Data1
            } else {
                Toggle::FromEd
            };
            stages.push((
                TdFill {
                    pid: data_pid,
                    toggle,
                    rounding: dir_in,
                    interrupt: false,
                    buffer: data_addr + offset as u32,
                    length: chunk,
                },
                Stage::Data,
            ));
            offset += chunk;
            if chunk == 0 {
                break;
            }
        }

        if is_control {
            // status stage runs opposite to the data stage, always DATA1
            let pid = if dir_in && length > 0 { Pid::Out } else { Pid::In };
            stages.push((
                TdFill {
                    pid,
                    toggle: Toggle::Data1,
                    rounding: false,
                    interrupt: false,
                    buffer: 0,
                    length: 0,
                },
                Stage::Status,
            ));
        }

        if let Some((last, _)) = stages.last_mut() {
            last.interrupt = true;
        }
        stages
    }
}

/// Endpoint by handle, live or waiting to be freed.
fn find_endpoint<'a>(
    endpoints: &'a mut BTreeMap<EpHandle, Endpoint>,
    retiring: &'a mut [(EpHandle, Endpoint)],
    handle: EpHandle,
) -> Option<&'a mut Endpoint> {
    match endpoints.get_mut(&handle) {
        Some(endpoint) => Some(endpoint),
        None => retiring
            .iter_mut()
            .find(|(h, _)| *h == handle)
            .map(|(_, e)| e),
    }
}

impl<R: OhciRegisters, D: DmaMemory> HostControllerDriver for Ohci<R, D> {
    fn name(&self) -> &str {
        "ohci"
    }

    fn start(&mut self) -> UsbResult<()> {
        let rev = self.regs.read(HC_REVISION) & 0xFF;
        log::info!("ohci: revision {}.{}", (rev >> 4) & 0xF, rev & 0xF);
        // Check for valid OHCI version (1.0 or 1.1)
        if rev != 0x10 && rev != 0x11 {
            log::warn!("ohci: unsupported revision {:#x}", rev);
            return Err(UsbError::NotSupported);
        }

        // If not in reset state, keep the frame interval firmware set up
        let control = self.regs.read(HC_CONTROL);
        let saved = if control & CTRL_HCFS_MASK != CTRL_HCFS_RESET {
            self.regs.read(HC_FM_INTERVAL) & FM_FI_MASK
        } else {
            0
        };
        let fi = if saved == 0 { FM_FI_DEFAULT } else { saved };

        self.regs.write(HC_COMMAND_STATUS, CMD_HCR);
        let mut reset_done = false;
        for _ in 0..100 {
            if self.regs.read(HC_COMMAND_STATUS) & CMD_HCR == 0 {
                reset_done = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !reset_done {
            log::error!("ohci: controller reset did not complete");
            return Err(UsbError::Hardware);
        }

        // Restore frame interval; FSMPS is the largest data packet per frame
        let fsmps = (6 * (fi - 210)) / 7;
        self.regs.write(HC_FM_INTERVAL, fi | (fsmps << 16) | FM_FIT);
        // Periodic start at 90% of frame interval
        self.regs.write(HC_PERIODIC_START, (fi * 9) / 10);

        self.regs.write(HC_HCCA, self.hcca);
        self.regs.write(HC_CONTROL_HEAD_ED, self.control_head.addr());
        self.regs.write(HC_BULK_HEAD_ED, self.bulk_head.addr());

        let all = INT_SO | INT_WDH | INT_SF | INT_RD | INT_UE | INT_FNO | INT_RHSC | INT_OC;
        self.regs.write(HC_INTERRUPT_STATUS, all);
        self.regs.write(HC_INTERRUPT_DISABLE, all | INT_MIE);
        self.regs.write(HC_INTERRUPT_ENABLE, INT_WDH | INT_RHSC | INT_UE | INT_SO | INT_MIE);

        self.regs.write(HC_CONTROL, RUN_CONTROL);

        self.num_ports = (self.regs.read(HC_RH_DESCRIPTOR_A) & RH_A_NDP_MASK).min(15) as u8;
        self.program_power_mode();
        self.removed = false;

        log::info!(
            "ohci: controller running, {} downstream ports, {:?} power",
            self.num_ports,
            self.config.power_switching
        );
        Ok(())
    }

    fn add_endpoint(&mut self, params: &EndpointParams) -> UsbResult<EpHandle> {
        if self.removed {
            return Err(UsbError::ControllerRemoved);
        }
        if params.kind == EndpointType::Isochronous {
            return Err(UsbError::NotSupported);
        }
        let ed_item = self.ed_pool.get_item().ok_or(UsbError::NoMemory)?;
        let Some(placeholder) = self.td_pool.get_item() else {
            self.ed_pool.put_item(ed_item);
            return Err(UsbError::NoMemory);
        };

        let direction = match params.kind {
            EndpointType::Control => EdDirection::FromTd,
            _ if params.is_in() => EdDirection::In,
            _ => EdDirection::Out,
        };
        let ed_addr = ed_item.addr();
        ed::init_ed(
            &mut self.dma,
            ed_addr,
            &EdParams {
                function_address: params.device_address,
                endpoint_number: params.number(),
                direction,
                low_speed: params.speed == UsbSpeed::Low,
                skip: true,
                iso: false,
                max_packet_size: params.max_packet_size,
            },
        );
        td::clear(&mut self.dma, placeholder.addr());
        let mut queue = EndpointQueue::new(ed_item);
        queue.insert_td(&mut self.dma, placeholder);

        let handle = EpHandle(self.next_ep);
        self.next_ep = self.next_ep.wrapping_add(1);

        let list = match params.kind {
            EndpointType::Control => ListKind::Control,
            EndpointType::Bulk => ListKind::Bulk,
            _ => ListKind::Interrupt(
                self.tree
                    .insert_ep(params.interval, params.max_packet_size as u32),
            ),
        };
        let prev = match list {
            ListKind::Control => self
                .control_list
                .last()
                .and_then(|h| self.endpoints.get(h))
                .map_or(self.control_head.addr(), |e| e.queue.ed().addr()),
            ListKind::Bulk => self
                .bulk_list
                .last()
                .and_then(|h| self.endpoints.get(h))
                .map_or(self.bulk_head.addr(), |e| e.queue.ed().addr()),
            ListKind::Interrupt(p) => match self.tree.node_ed(p.node) {
                Some(node) => node.addr(),
                None => {
                    self.tree.remove_ep(p, params.max_packet_size as u32);
                    // nothing was queued yet, so nothing was retired
                    let _ = queue.free(&mut self.dma, &mut self.td_pool, &mut self.ed_pool);
                    return Err(UsbError::Invalid);
                }
            },
        };
        ed::link_ed(&mut self.dma, prev, ed_addr);
        match list {
            // new interrupt EDs go right after their tree node
            ListKind::Interrupt(p) => self.interrupt_lists.entry(p.node).or_default().insert(0, handle),
            _ => self.list_mut(list).push(handle),
        }
        ed::clear_skip(&mut self.dma, ed_addr);

        self.endpoints.insert(
            handle,
            Endpoint {
                queue,
                params: *params,
                list,
                pending: 0,
            },
        );
        log::debug!(
            "ohci: endpoint {:?} addr {} ep {:#04x} {:?} mps {}",
            handle,
            params.device_address,
            params.endpoint,
            params.kind,
            params.max_packet_size
        );
        Ok(handle)
    }

    fn release_endpoint(&mut self, ep: EpHandle) {
        let Some(list) = self.endpoints.get(&ep).map(|e| e.list) else {
            log::warn!("ohci: release of unknown endpoint {:?}", ep);
            return;
        };
        let position = self.list_position(ep, list);
        let Some(endpoint) = self.endpoints.remove(&ep) else {
            return;
        };
        if endpoint.pending > 0 {
            log::warn!(
                "ohci: releasing endpoint {:?} with {} requests outstanding",
                ep,
                endpoint.pending
            );
        }
        let ed_addr = endpoint.queue.ed().addr();
        ed::set_skip(&mut self.dma, ed_addr);
        match position {
            Some((pos, prev)) => {
                ed::unlink_ed(&mut self.dma, prev, ed_addr);
                self.list_mut(list).remove(pos);
            }
            None => log::warn!("ohci: endpoint {:?} missing from its list", ep),
        }
        self.aborting.retain(|h| *h != ep);
        self.retiring.push((ep, endpoint));
    }

    fn submit_request(&mut self, ep: EpHandle, id: UrbId, urb: &Urb) -> UsbResult<()> {
        if self.removed {
            return Err(UsbError::ControllerRemoved);
        }
        let Some(endpoint) = self.endpoints.get(&ep) else {
            return Err(UsbError::NotFound);
        };
        let is_control_ep = endpoint.params.kind == EndpointType::Control;
        let length = match urb.function {
            UrbFunction::Control(setup) if is_control_ep => {
                core::cmp::min(setup.length as usize, urb.buffer.len())
            }
            UrbFunction::Bulk | UrbFunction::Interrupt if !is_control_ep => urb.buffer.len(),
            UrbFunction::Isochronous { .. } => return Err(UsbError::NotSupported),
            _ => return Err(UsbError::Invalid),
        };
        let is_control = is_control_ep;

        let chunks = if length == 0 {
            usize::from(!is_control)
        } else {
            length.div_ceil(TD_MAX_BUFFER)
        };
        let needed = chunks + if is_control { 2 } else { 0 };
        if self.td_pool.available() < needed {
            log::debug!("ohci: out of TDs ({} needed)", needed);
            return Err(UsbError::NoMemory);
        }

        let dir_in = urb.direction() == Direction::In;
        let header = if is_control { SETUP_SIZE } else { 0 };
        let size = header + length;
        let bounce = if size > 0 {
            let addr = self.dma.alloc(size, BOUNCE_ALIGN).ok_or(UsbError::NoMemory)?;
            Some((addr, size))
        } else {
            None
        };
        let base = bounce.map_or(0, |(addr, _)| addr);
        let data_addr = base + header as u32;
        if let UrbFunction::Control(setup) = urb.function {
            let mut setup = setup;
            setup.length = length as u16;
            self.dma.write_bytes(base, &setup.to_bytes());
        }
        if !dir_in && length > 0 {
            self.dma.write_bytes(data_addr, &urb.buffer[..length]);
        }

        let stages = Self::stages(urb, length, data_addr, base);
        let count = stages.len();
        let Some(endpoint) = self.endpoints.get_mut(&ep) else {
            return Err(UsbError::NotFound);
        };
        for (i, (fill, stage)) in stages.iter().enumerate() {
            let Some(current) = endpoint.queue.tail() else {
                break;
            };
            let Some(next) = self.td_pool.get_item() else {
                break;
            };
            td::fill(&mut self.dma, current.addr(), fill);
            *self.td_pool.extension_mut(current) = TdExt {
                ep: Some(ep),
                urb: Some(id),
                stage: *stage,
                length: fill.length,
                last: i + 1 == count,
            };
            td::clear(&mut self.dma, next.addr());
            endpoint.queue.insert_td(&mut self.dma, next);
        }
        endpoint.pending += 1;

        self.transfers.insert(
            id,
            Transfer {
                ep,
                bounce,
                data_addr,
                length,
                dir_in,
                actual: 0,
            },
        );
        let filled = if is_control { CMD_CLF } else { CMD_BLF };
        match endpoint.list {
            ListKind::Interrupt(_) => {}
            _ => self.regs.write(HC_COMMAND_STATUS, filled),
        }
        Ok(())
    }

    fn abort_endpoint(&mut self, ep: EpHandle) {
        let Some(endpoint) = self.endpoints.get(&ep) else {
            log::warn!("ohci: abort of unknown endpoint {:?}", ep);
            return;
        };
        ed::set_skip(&mut self.dma, endpoint.queue.ed().addr());
        if !self.aborting.contains(&ep) {
            self.aborting.push(ep);
        }
    }

    fn reset_endpoint(&mut self, ep: EpHandle) -> UsbResult<()> {
        let endpoint = self.endpoints.get(&ep).ok_or(UsbError::NotFound)?;
        if endpoint.pending > 0 {
            log::warn!("ohci: reset of endpoint {:?} with requests queued", ep);
        }
        let ed_addr = endpoint.queue.ed().addr();
        ed::clear_halt(&mut self.dma, ed_addr);
        ed::set_toggle_carry(&mut self.dma, ed_addr, false);
        Ok(())
    }

    fn set_state(&mut self, state: HcState) -> UsbResult<()> {
        if self.removed {
            return Err(UsbError::ControllerRemoved);
        }
        match state {
            HcState::Working => self.regs.write(HC_CONTROL, RUN_CONTROL),
            HcState::Suspended => {
                let control = self.regs.read(HC_CONTROL) & !CTRL_HCFS_MASK;
                self.regs.write(HC_CONTROL, control | CTRL_HCFS_SUSPEND);
            }
            HcState::Removed => {
                self.shutdown();
                log::info!("ohci: controller stopped");
            }
        }
        Ok(())
    }

    fn reset_port(&mut self, port: u8) -> UsbResult<()> {
        self.check_port(port)?;
        self.regs.write(port_reg(port), RH_PS_SPR);
        Ok(())
    }

    fn set_port_power(&mut self, target: PowerTarget, on: bool) -> UsbResult<()> {
        match (self.config.power_switching, target) {
            (PowerSwitching::AlwaysOn, _) => {}
            (PowerSwitching::Ganged, _) => {
                self.regs
                    .write(HC_RH_STATUS, if on { RH_HS_LPSC } else { RH_HS_LPS });
            }
            (PowerSwitching::PerPort, PowerTarget::All) => {
                for port in 1..=self.num_ports {
                    self.regs
                        .write(port_reg(port), if on { RH_PS_SPP } else { RH_PS_CPP });
                }
            }
            (PowerSwitching::PerPort, PowerTarget::Port(port)) => {
                self.check_port(port)?;
                self.regs
                    .write(port_reg(port), if on { RH_PS_SPP } else { RH_PS_CPP });
            }
        }
        Ok(())
    }

    fn port_status(&self, port: u8) -> UsbResult<(PortStatus, PortChange)> {
        self.check_port(port)?;
        let v = self.regs.read(port_reg(port));
        let mut status = PortStatus::empty();
        for (bit, flag) in STATUS_BITS {
            if v & bit != 0 {
                status |= flag;
            }
        }
        let mut change = PortChange::empty();
        for (bit, flag) in CHANGE_BITS {
            if v & bit != 0 {
                change |= flag;
            }
        }
        Ok((status, change))
    }

    fn clear_port_change(&mut self, port: u8, change: PortChange) -> UsbResult<()> {
        self.check_port(port)?;
        let bits = CHANGE_BITS
            .iter()
            .filter(|(_, flag)| change.contains(*flag))
            .fold(0, |acc, (bit, _)| acc | bit);
        if bits != 0 {
            self.regs.write(port_reg(port), bits);
        }
        Ok(())
    }

    fn disable_port(&mut self, port: u8) -> UsbResult<()> {
        self.check_port(port)?;
        self.regs.write(port_reg(port), RH_PS_CPE);
        Ok(())
    }

    fn hub_status(&self) -> (HubStatus, HubChange) {
        let v = self.regs.read(HC_RH_STATUS);
        let mut status = HubStatus::empty();
        let mut change = HubChange::empty();
        if v & RH_HS_LPS != 0 {
            status |= HubStatus::LOCAL_POWER;
        }
        if v & RH_HS_OCI != 0 {
            status |= HubStatus::OVER_CURRENT;
        }
        if v & RH_HS_LPSC != 0 {
            change |= HubChange::LOCAL_POWER;
        }
        if v & RH_HS_OCIC != 0 {
            change |= HubChange::OVER_CURRENT;
        }
        (status, change)
    }

    fn clear_hub_change(&mut self, change: HubChange) {
        // LPSC writes would switch global power on; only OCIC is write-1-to-clear
        if change.contains(HubChange::OVER_CURRENT) {
            self.regs.write(HC_RH_STATUS, RH_HS_OCIC);
        }
    }

    fn port_count(&self) -> u8 {
        self.num_ports
    }

    fn power_good_time_ms(&self) -> u32 {
        (self.regs.read(HC_RH_DESCRIPTOR_A) >> RH_A_POTPGT_SHIFT) * 2
    }

    fn service_interrupt(&mut self) -> bool {
        if self.removed {
            return false;
        }
        let status = self.regs.read(HC_INTERRUPT_STATUS);
        let mut root_hub = false;

        if status & INT_WDH != 0 {
            self.process_done_queue();
            self.regs.write(HC_INTERRUPT_STATUS, INT_WDH);
        }
        if status & INT_RHSC != 0 {
            root_hub = true;
            self.regs.write(HC_INTERRUPT_STATUS, INT_RHSC);
        }
        if status & INT_SO != 0 {
            log::warn!("ohci: scheduling overrun");
            self.regs.write(HC_INTERRUPT_STATUS, INT_SO);
        }
        if status & INT_UE != 0 {
            log::error!("ohci: unrecoverable error!");
            self.regs.write(HC_INTERRUPT_STATUS, INT_UE);
        }
        root_hub
    }

    fn needs_frame_tick(&self) -> bool {
        !self.aborting.is_empty() || !self.retiring.is_empty()
    }

    fn frame_tick(&mut self) {
        if self.removed {
            return;
        }
        // anything retired during the last frame goes first
        if self.regs.read(HC_INTERRUPT_STATUS) & INT_WDH != 0 {
            self.process_done_queue();
            self.regs.write(HC_INTERRUPT_STATUS, INT_WDH);
        }
        self.finish_aborts();
        self.finish_retires();
    }

    fn take_completions(&mut self, out: &mut Vec<Completed>) {
        out.append(&mut self.completions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorType, SetupPacket};
    use crate::dma::DmaArena;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    const PORTS: u8 = 4;

    /// Register file that behaves like the parts of an OHCI the driver uses.
    #[derive(Clone)]
    struct SimRegs(Rc<RefCell<[u32; 64]>>);

    impl SimRegs {
        fn new() -> Self {
            let mut r = [0u32; 64];
            r[(HC_REVISION / 4) as usize] = 0x10;
            r[(HC_RH_DESCRIPTOR_A / 4) as usize] = PORTS as u32 | (10 << RH_A_POTPGT_SHIFT);
            Self(Rc::new(RefCell::new(r)))
        }

        fn get(&self, offset: u32) -> u32 {
            self.0.borrow()[(offset / 4) as usize]
        }

        fn set(&self, offset: u32, value: u32) {
            self.0.borrow_mut()[(offset / 4) as usize] = value;
        }

        fn raise(&self, bits: u32) {
            let v = self.get(HC_INTERRUPT_STATUS);
            self.set(HC_INTERRUPT_STATUS, v | bits);
        }
    }

    impl OhciRegisters for SimRegs {
        fn read(&self, offset: u32) -> u32 {
            self.get(offset)
        }

        fn write(&mut self, offset: u32, value: u32) {
            let old = self.get(offset);
            let new = match offset {
                HC_COMMAND_STATUS => old | (value & !CMD_HCR),
                HC_INTERRUPT_STATUS => old & !value,
                HC_INTERRUPT_ENABLE => old | value,
                HC_INTERRUPT_DISABLE => {
                    let enabled = self.get(HC_INTERRUPT_ENABLE);
                    self.set(HC_INTERRUPT_ENABLE, enabled & !value);
                    value
                }
                o if o >= HC_RH_PORT_STATUS => {
                    let mut v = old & !(value & 0x001F_0000);
                    if value & RH_PS_SPR != 0 {
                        v |= RH_PS_PRS;
                    }
                    if value & RH_PS_CPE != 0 {
                        v &= !RH_PS_PES;
                    }
                    if value & RH_PS_SPP != 0 {
                        v |= RH_PS_PPS;
                    }
                    if value & RH_PS_CPP != 0 {
                        v &= !RH_PS_PPS;
                    }
                    v
                }
                _ => value,
            };
            self.set(offset, new);
        }
    }

    type TestOhci = Ohci<SimRegs, DmaArena>;

    fn controller(config: OhciConfig) -> (TestOhci, SimRegs) {
        let regs = SimRegs::new();
        let dma = DmaArena::new(256 * 1024, 0x0020_0000).unwrap();
        let mut ohci = Ohci::new(regs.clone(), dma, config).unwrap();
        ohci.start().unwrap();
        (ohci, regs)
    }

    /// Play the controller: retire `n` TDs from the head of `ep`'s chain.
    /// `cc` picks each TD's condition code; IN data TDs are filled from `data`.
    fn run_tds(ohci: &mut TestOhci, regs: &SimRegs, ep: EpHandle, n: usize, cc: &dyn Fn(usize) -> u32, data: &[u8]) {
        let hcca = ohci.hcca();
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        let mem = ohci.dma_mut();
        let mut done = mem.read_u32(hcca + HCCA_DONE_HEAD);
        let mut fed = 0;
        for i in 0..n {
            let td_addr = ed::head_td(&*mem, ed_addr);
            let next = td::next(&*mem, td_addr);
            let code = cc(i);
            let control = mem.read_u32(td_addr);
            let (cbp, be) = td::buffer(&*mem, td_addr);
            if control & (3 << 19) == (2 << 19) && cbp != 0 && code == td::TD_CC_NOERROR {
                let len = (be - cbp + 1) as usize;
                let take = core::cmp::min(len, data.len() - fed);
                mem.write_bytes(cbp, &data[fed..fed + take]);
                fed += take;
                mem.write_u32(td_addr + 4, if take == len { 0 } else { cbp + take as u32 });
            } else if code == td::TD_CC_NOERROR {
                mem.write_u32(td_addr + 4, 0);
            }
            mem.write_u32(td_addr, (control & 0x0FFF_FFFF) | (code << 28));
            td::set_next(mem, td_addr, done);
            done = td_addr;
            ed::set_head_td(mem, ed_addr, next);
            if code != td::TD_CC_NOERROR {
                let head = mem.read_u32(ed_addr + 8);
                mem.write_u32(ed_addr + 8, head | ed::ED_HEAD_HALT);
                break;
            }
        }
        mem.write_u32(hcca + HCCA_DONE_HEAD, done);
        regs.raise(INT_WDH);
    }

    fn completions(ohci: &mut TestOhci) -> Vec<Completed> {
        let mut out = Vec::new();
        ohci.take_completions(&mut out);
        out
    }

    #[test]
    fn test_start_programs_controller() {
        let (ohci, regs) = controller(OhciConfig::default());
        assert_eq!(regs.get(HC_CONTROL), RUN_CONTROL);
        assert_eq!(regs.get(HC_HCCA), ohci.hcca());
        assert_eq!(regs.get(HC_PERIODIC_START), (FM_FI_DEFAULT * 9) / 10);
        assert_eq!(regs.get(HC_FM_INTERVAL) & FM_FI_MASK, FM_FI_DEFAULT);
        let enabled = regs.get(HC_INTERRUPT_ENABLE);
        assert_eq!(enabled & (INT_WDH | INT_RHSC | INT_UE | INT_MIE), INT_WDH | INT_RHSC | INT_UE | INT_MIE);
        let a = regs.get(HC_RH_DESCRIPTOR_A);
        assert!(a & RH_A_PSM != 0);
        assert!(a & RH_A_NPS == 0);
        assert_eq!(regs.get(HC_RH_DESCRIPTOR_B) >> 16, 0b11110);
        assert_eq!(ohci.port_count(), PORTS);
        assert_eq!(ohci.power_good_time_ms(), 20);
        // interrupt table points into the tree
        let leaf = ohci.dma().read_u32(ohci.hcca());
        assert_eq!(leaf, ohci.bandwidth().node_ed(31).unwrap().addr());
    }

    #[test]
    fn test_rejects_unknown_revision() {
        let regs = SimRegs::new();
        regs.set(HC_REVISION, 0x20);
        let dma = DmaArena::new(256 * 1024, 0x0020_0000).unwrap();
        let mut ohci = Ohci::new(regs, dma, OhciConfig::default()).unwrap();
        assert_eq!(ohci.start(), Err(UsbError::NotSupported));
    }

    #[test]
    fn test_control_in_round_trip() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams::control(0, 8, UsbSpeed::Full))
            .unwrap();
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        assert_eq!(ed::next_ed(ohci.dma(), ohci.control_head.addr()), ed_addr);
        assert!(!ed::is_skipped(ohci.dma(), ed_addr));

        let urb = Urb::control_in(SetupPacket::get_descriptor(DescriptorType::Device, 0, 18));
        ohci.submit_request(ep, UrbId(1), &urb).unwrap();
        // setup, data, status and the placeholder
        assert_eq!(ohci.td_count(ep), Some(4));
        assert!(regs.get(HC_COMMAND_STATUS) & CMD_CLF != 0);

        // setup packet sits in the bounce buffer the first TD points at
        let first = ed::head_td(ohci.dma(), ed_addr);
        let (cbp, be) = td::buffer(ohci.dma(), first);
        assert_eq!(be - cbp + 1, 8);
        let mut setup = [0u8; 8];
        ohci.dma().read_bytes(cbp, &mut setup);
        assert_eq!(setup, urb_setup_bytes(&urb));

        let descriptor: Vec<u8> = (0..18).collect();
        run_tds(&mut ohci, &regs, ep, 3, &|_| td::TD_CC_NOERROR, &descriptor);
        assert!(!ohci.service_interrupt());
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].urb, UrbId(1));
        assert_eq!(done[0].status, UrbStatus::Success);
        assert_eq!(done[0].actual_length, 18);
        assert_eq!(done[0].data, descriptor);
        assert_eq!(ohci.td_count(ep), Some(1));
        assert_eq!(ohci.descriptor_usage().1, 1);
    }

    fn urb_setup_bytes(urb: &Urb) -> [u8; 8] {
        match urb.function {
            UrbFunction::Control(setup) => setup.to_bytes(),
            _ => [0; 8],
        }
    }

    #[test]
    fn test_short_in_transfer() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams {
                device_address: 2,
                endpoint: 0x81,
                kind: EndpointType::Bulk,
                max_packet_size: 64,
                speed: UsbSpeed::Full,
                interval: 0,
            })
            .unwrap();
        ohci.submit_request(ep, UrbId(3), &Urb::bulk_in(1, 512)).unwrap();
        run_tds(&mut ohci, &regs, ep, 1, &|_| td::TD_CC_NOERROR, &[7; 13]);
        ohci.service_interrupt();
        let done = completions(&mut ohci);
        assert_eq!(done[0].status, UrbStatus::Success);
        assert_eq!(done[0].actual_length, 13);
        assert_eq!(done[0].data, vec![7; 13]);
        assert!(regs.get(HC_COMMAND_STATUS) & CMD_BLF != 0);
    }

    #[test]
    fn test_stall_drops_rest_of_request() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams::control(1, 64, UsbSpeed::Full))
            .unwrap();
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        let urb = Urb::control_in(SetupPacket::get_descriptor(DescriptorType::Configuration, 0, 9));
        ohci.submit_request(ep, UrbId(1), &urb).unwrap();
        ohci.submit_request(ep, UrbId(2), &urb).unwrap();
        assert_eq!(ohci.td_count(ep), Some(7));
        ed::set_toggle_carry(ohci.dma_mut(), ed_addr, true);

        // SETUP ok, data stage stalls
        run_tds(&mut ohci, &regs, ep, 2, &|i| if i == 1 { td::TD_CC_STALL } else { td::TD_CC_NOERROR }, &[]);
        ohci.service_interrupt();
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].urb, UrbId(1));
        assert_eq!(done[0].status, UrbStatus::Stall);

        // second request is still queued and the ED runs again
        assert_eq!(ohci.td_count(ep), Some(4));
        assert!(!ed::is_halted(ohci.dma(), ed_addr));
        assert!(ed::toggle_carry(ohci.dma(), ed_addr));
        let head = ed::head_td(ohci.dma(), ed_addr);
        assert_eq!(ohci.td_pool.extension(ohci.td_pool.item_from_phys(head).unwrap()).urb, Some(UrbId(2)));
    }

    #[test]
    fn test_abort_cancels_after_a_frame() {
        let (mut ohci, _regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams {
                device_address: 2,
                endpoint: 0x82,
                kind: EndpointType::Bulk,
                max_packet_size: 64,
                speed: UsbSpeed::Full,
                interval: 0,
            })
            .unwrap();
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        ohci.submit_request(ep, UrbId(5), &Urb::bulk_in(2, 64)).unwrap();
        ohci.submit_request(ep, UrbId(6), &Urb::bulk_in(2, 9000)).unwrap();
        assert_eq!(ohci.td_count(ep), Some(5));

        ohci.abort_endpoint(ep);
        assert!(ed::is_skipped(ohci.dma(), ed_addr));
        assert!(ohci.needs_frame_tick());
        assert!(completions(&mut ohci).is_empty());

        ohci.frame_tick();
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.status == UrbStatus::Cancelled));
        assert_eq!(ohci.td_count(ep), Some(1));
        assert_eq!(ed::head_td(ohci.dma(), ed_addr), ed::tail_td(ohci.dma(), ed_addr));
        assert!(!ed::is_skipped(ohci.dma(), ed_addr));
        assert!(!ohci.needs_frame_tick());
    }

    /// Play the controller retiring the head TD of `ep` without error and
    /// without linking it anywhere. Returns its address.
    fn retire_head(ohci: &mut TestOhci, ep: EpHandle) -> BusAddr {
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        let mem = ohci.dma_mut();
        let td_addr = ed::head_td(&*mem, ed_addr);
        let next = td::next(&*mem, td_addr);
        let control = mem.read_u32(td_addr);
        mem.write_u32(td_addr, (control & 0x0FFF_FFFF) | (td::TD_CC_NOERROR << 28));
        mem.write_u32(td_addr + 4, 0);
        td::set_next(mem, td_addr, 0);
        ed::set_head_td(mem, ed_addr, next);
        td_addr
    }

    #[test]
    fn test_abort_holds_tds_the_controller_retired() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams::control(1, 8, UsbSpeed::Full))
            .unwrap();
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        let urb = Urb::control_in(SetupPacket::get_descriptor(DescriptorType::Device, 0, 18));
        ohci.submit_request(ep, UrbId(1), &urb).unwrap();

        // SETUP went through but the device never answers the data stage;
        // the SETUP TD waits on the controller's done list (DI=7)
        let setup = retire_head(&mut ohci, ep);
        ohci.abort_endpoint(ep);
        ohci.frame_tick();
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, UrbStatus::Cancelled);
        assert_eq!(ohci.td_count(ep), Some(1));
        assert!(ohci.td_pool.item_from_phys(setup).is_some());
        assert_eq!(ohci.descriptor_usage().1, 2);

        // the next request must not be built on the held TD
        ohci.submit_request(ep, UrbId(2), &urb).unwrap();
        let mut addr = ed::head_td(ohci.dma(), ed_addr);
        for _ in 0..4 {
            assert_ne!(addr, setup);
            addr = td::next(ohci.dma(), addr);
        }

        // its status TD flushes the done list, old SETUP at the bottom
        let hcca = ohci.hcca();
        ohci.dma_mut().write_u32(hcca + HCCA_DONE_HEAD, setup);
        let descriptor: Vec<u8> = (0..18).collect();
        run_tds(&mut ohci, &regs, ep, 3, &|_| td::TD_CC_NOERROR, &descriptor);
        ohci.service_interrupt();
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].urb, UrbId(2));
        assert_eq!(done[0].status, UrbStatus::Success);
        assert_eq!(done[0].data, descriptor);

        let tail = ed::tail_td(ohci.dma(), ed_addr);
        assert_eq!(ed::head_td(ohci.dma(), ed_addr), tail);
        assert!(ohci.td_pool.item_from_phys(tail).is_some());
        assert!(ohci.td_pool.item_from_phys(setup).is_none());
        assert_eq!(ohci.td_count(ep), Some(1));
        assert_eq!(ohci.descriptor_usage().1, 1);
    }

    #[test]
    fn test_release_holds_tds_the_controller_retired() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        let (eds_before, _) = ohci.descriptor_usage();
        let ep = ohci
            .add_endpoint(&EndpointParams::control(1, 8, UsbSpeed::Full))
            .unwrap();
        let urb = Urb::control_in(SetupPacket::get_descriptor(DescriptorType::Device, 0, 18));
        ohci.submit_request(ep, UrbId(1), &urb).unwrap();
        let setup = retire_head(&mut ohci, ep);

        ohci.release_endpoint(ep);
        ohci.frame_tick();
        assert_eq!(completions(&mut ohci).len(), 1);
        assert_eq!(ohci.descriptor_usage(), (eds_before, 1));

        let hcca = ohci.hcca();
        ohci.dma_mut().write_u32(hcca + HCCA_DONE_HEAD, setup);
        regs.raise(INT_WDH);
        ohci.service_interrupt();
        assert!(completions(&mut ohci).is_empty());
        assert_eq!(ohci.descriptor_usage(), (eds_before, 0));
    }

    #[test]
    fn test_done_queue_walks_past_unknown_entry() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        let bulk = |endpoint| EndpointParams {
            device_address: 2,
            endpoint,
            kind: EndpointType::Bulk,
            max_packet_size: 64,
            speed: UsbSpeed::Full,
            interval: 0,
        };
        let a = ohci.add_endpoint(&bulk(0x01)).unwrap();
        let b = ohci.add_endpoint(&bulk(0x02)).unwrap();
        ohci.submit_request(a, UrbId(1), &Urb::bulk_out(1, vec![1; 8])).unwrap();
        ohci.submit_request(b, UrbId(2), &Urb::bulk_out(2, vec![2; 8])).unwrap();

        // newest first: A, a word that is no TD of ours, then B
        let older = retire_head(&mut ohci, b);
        let newer = retire_head(&mut ohci, a);
        let mem = ohci.dma_mut();
        let stray = mem.alloc(TD_SIZE, TD_ALIGN).unwrap();
        mem.zero(stray, TD_SIZE);
        td::set_next(mem, stray, older);
        td::set_next(mem, newer, stray);
        let hcca = ohci.hcca();
        ohci.dma_mut().write_u32(hcca + HCCA_DONE_HEAD, newer);
        regs.raise(INT_WDH);
        ohci.service_interrupt();

        let done = completions(&mut ohci);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].urb, UrbId(2));
        assert_eq!(done[1].urb, UrbId(1));
        assert!(done.iter().all(|c| c.status == UrbStatus::Success));
        assert_eq!(ohci.td_count(a), Some(1));
        assert_eq!(ohci.td_count(b), Some(1));
        assert_eq!(ohci.dma().read_u32(hcca + HCCA_DONE_HEAD), 0);
    }

    #[test]
    fn test_release_interrupt_endpoint_is_deferred() {
        let (mut ohci, _regs) = controller(OhciConfig::default());
        let (eds_before, _) = ohci.descriptor_usage();
        let ep = ohci
            .add_endpoint(&EndpointParams {
                device_address: 3,
                endpoint: 0x81,
                kind: EndpointType::Interrupt,
                max_packet_size: 8,
                speed: UsbSpeed::Low,
                interval: 10,
            })
            .unwrap();
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        let node = ohci.bandwidth().node_ed(7).unwrap().addr();
        assert_eq!(ed::next_ed(ohci.dma(), node), ed_addr);
        assert_eq!(ohci.bandwidth().frame_load(0), 8);

        ohci.submit_request(ep, UrbId(9), &Urb::interrupt_in(1, 8)).unwrap();
        ohci.release_endpoint(ep);
        assert_ne!(ed::next_ed(ohci.dma(), node), ed_addr);
        assert_eq!(ohci.descriptor_usage().0, eds_before + 1);
        assert!(ohci.needs_frame_tick());

        ohci.frame_tick();
        assert_eq!(ohci.descriptor_usage(), (eds_before, 0));
        assert_eq!(ohci.bandwidth().frame_load(0), 0);
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, UrbStatus::Cancelled);
    }

    #[test]
    fn test_bulk_out_is_split_per_page() {
        let (mut ohci, _regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams {
                device_address: 2,
                endpoint: 0x01,
                kind: EndpointType::Bulk,
                max_packet_size: 64,
                speed: UsbSpeed::Full,
                interval: 0,
            })
            .unwrap();
        ohci.submit_request(ep, UrbId(1), &Urb::bulk_out(1, vec![0xAA; 5000])).unwrap();
        assert_eq!(ohci.td_count(ep), Some(3));
        let ed_addr = ohci.endpoint_ed(ep).unwrap();
        let first = ed::head_td(ohci.dma(), ed_addr);
        let (cbp, be) = td::buffer(ohci.dma(), first);
        assert_eq!((be - cbp + 1) as usize, TD_MAX_BUFFER);
        let mut byte = [0u8; 1];
        ohci.dma().read_bytes(be, &mut byte);
        assert_eq!(byte[0], 0xAA);
    }

    #[test]
    fn test_td_exhaustion_queues_nothing() {
        let (mut ohci, _regs) = controller(OhciConfig {
            max_tds: 3,
            ..OhciConfig::default()
        });
        let ep = ohci
            .add_endpoint(&EndpointParams::control(0, 8, UsbSpeed::Full))
            .unwrap();
        let urb = Urb::control_in(SetupPacket::get_descriptor(DescriptorType::Device, 0, 18));
        assert_eq!(ohci.submit_request(ep, UrbId(1), &urb), Err(UsbError::NoMemory));
        assert_eq!(ohci.td_count(ep), Some(1));
    }

    #[test]
    fn test_isochronous_not_supported() {
        let (mut ohci, _regs) = controller(OhciConfig::default());
        let params = EndpointParams {
            device_address: 2,
            endpoint: 0x83,
            kind: EndpointType::Isochronous,
            max_packet_size: 192,
            speed: UsbSpeed::Full,
            interval: 1,
        };
        assert_eq!(ohci.add_endpoint(&params), Err(UsbError::NotSupported));
    }

    #[test]
    fn test_port_reset_and_change_bits() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        regs.set(port_reg(3), RH_PS_CCS | RH_PS_CSC | RH_PS_PPS);
        let (status, change) = ohci.port_status(3).unwrap();
        assert!(status.contains(PortStatus::CONNECTION | PortStatus::POWER));
        assert!(!status.contains(PortStatus::ENABLE));
        assert_eq!(change, PortChange::CONNECTION);

        ohci.clear_port_change(3, PortChange::CONNECTION).unwrap();
        ohci.reset_port(3).unwrap();
        assert!(ohci.port_status(3).unwrap().0.contains(PortStatus::RESET));

        // reset completes
        regs.set(port_reg(3), RH_PS_CCS | RH_PS_PPS | RH_PS_PES | RH_PS_PRSC);
        let (status, change) = ohci.port_status(3).unwrap();
        assert!(status.contains(PortStatus::ENABLE));
        assert_eq!(status.speed(), UsbSpeed::Full);
        assert_eq!(change, PortChange::RESET);
        ohci.clear_port_change(3, PortChange::RESET).unwrap();
        assert!(ohci.port_status(3).unwrap().1.is_empty());

        ohci.disable_port(3).unwrap();
        assert!(!ohci.port_status(3).unwrap().0.contains(PortStatus::ENABLE));
        assert_eq!(ohci.reset_port(0), Err(UsbError::Invalid));
        assert_eq!(ohci.reset_port(PORTS + 1), Err(UsbError::Invalid));
    }

    #[test]
    fn test_root_hub_change_interrupt() {
        let (mut ohci, regs) = controller(OhciConfig::default());
        regs.raise(INT_RHSC);
        assert!(ohci.service_interrupt());
        assert_eq!(regs.get(HC_INTERRUPT_STATUS) & INT_RHSC, 0);
        assert!(!ohci.service_interrupt());
    }

    #[test]
    fn test_ganged_power() {
        let (mut ohci, regs) = controller(OhciConfig {
            power_switching: PowerSwitching::Ganged,
            ..OhciConfig::default()
        });
        ohci.set_port_power(PowerTarget::All, true).unwrap();
        assert_eq!(regs.get(HC_RH_STATUS), RH_HS_LPSC);
        assert_eq!(regs.get(HC_RH_DESCRIPTOR_A) & (RH_A_PSM | RH_A_NPS), 0);
    }

    #[test]
    fn test_removed_cancels_in_flight() {
        let (mut ohci, _regs) = controller(OhciConfig::default());
        let ep = ohci
            .add_endpoint(&EndpointParams::control(0, 8, UsbSpeed::Full))
            .unwrap();
        let urb = Urb::control_out(SetupPacket::set_address(1), Vec::new());
        ohci.submit_request(ep, UrbId(1), &urb).unwrap();
        ohci.set_state(HcState::Removed).unwrap();
        let done = completions(&mut ohci);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, UrbStatus::Cancelled);
        assert_eq!(ohci.submit_request(ep, UrbId(2), &urb), Err(UsbError::ControllerRemoved));
    }
}
