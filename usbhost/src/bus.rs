//! Bus driver core
//!
//! One [`UsbHost`] owns every registered host controller, the devices found
//! on them and the interfaces those devices expose. Objects live in
//! registries keyed by small ids; nothing holds a pointer into another
//! object, so removal is a registry operation followed by a deferred reap
//! once the object's [`RefCount`] and pending requests drain.
//!
//! All work happens in [`UsbHost::poll`]: the interrupt service routine only
//! raises the controller in the shared [`InterruptSignal`].

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{HostConfig, PowerSwitching};
use crate::descriptor::{Configuration, DeviceDescriptor, InterfaceInfo, UsbSpeed};
use crate::enumerate::DeviceState;
use crate::error::{UrbStatus, UsbError, UsbResult};
use crate::hcd::{Completed, EndpointParams, EpHandle, HcState, HostControllerDriver, PowerTarget};
use crate::notify::Notifier;
use crate::refcount::{Hold, RefCount};
use crate::roothub::{PortState, ResetToken, RootHub};
use crate::substate::{SubRef, SubState};
use crate::timer::{TimerId, Timers};
use crate::urb::{Urb, UrbFunction, UrbId};

/// Host controller id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HcId(pub(crate) u32);

/// Device id; never reused while the host lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub(crate) u32);

/// Completion of a class driver request. Runs on the bus task, after the
/// request left every registry, so it may submit again.
pub type Completion = Box<dyn FnOnce(&mut UsbHost, Urb)>;

/// Events delivered by the host timer wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    Sub(SubRef),
    PnpDispatch,
    FrameTick(HcId),
    RootHubScan(HcId),
}

/// Who gets a request's completion
pub(crate) enum Owner {
    Client(Completion),
    Sub(SubRef),
}

pub(crate) struct PendingRequest {
    pub(crate) hc: HcId,
    pub(crate) ep: EpHandle,
    pub(crate) device: Option<DeviceId>,
    pub(crate) urb: Urb,
    pub(crate) owner: Owner,
    hold: Option<Hold>,
}

/// Interrupt mailbox shared with the interrupt service routine.
///
/// `raise` is the only thing the ISR does; the bus task picks the raised
/// controllers up on its next `poll`.
#[derive(Clone, Default)]
pub struct InterruptSignal(Arc<spin::Mutex<BTreeSet<HcId>>>);

impl InterruptSignal {
    pub fn raise(&self, hc: HcId) {
        self.0.lock().insert(hc);
    }

    pub fn is_raised(&self) -> bool {
        !self.0.lock().is_empty()
    }

    fn take(&self) -> BTreeSet<HcId> {
        core::mem::take(&mut *self.0.lock())
    }
}

/// Device addresses 1..=127 of one bus
#[derive(Debug, Default)]
pub(crate) struct AddressPool(u128);

impl AddressPool {
    pub(crate) fn alloc(&mut self) -> Option<u8> {
        let address = (1..=127u8).find(|&a| self.0 & (1u128 << a) == 0)?;
        self.0 |= 1u128 << address;
        Some(address)
    }

    pub(crate) fn free(&mut self, address: u8) {
        let bit = 1u128 << (address & 0x7F);
        if address == 0 || address > 127 || self.0 & bit == 0 {
            log::warn!("usb: free of unallocated address {}", address);
            return;
        }
        self.0 &= !bit;
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.0.count_ones()
    }
}

/// USB statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbStats {
    /// Total devices ever configured
    pub total_enumerated: u64,
    /// Current configured device count
    pub current_devices: u64,
    /// Ports given up on plus devices that failed configuration
    pub failed_enumerations: u64,
    pub control_transfers: u64,
    pub bulk_transfers: u64,
    pub interrupt_transfers: u64,
    pub transfer_errors: u64,
}

impl UsbStats {
    fn record_transfer(&mut self, function: UrbFunction, status: UrbStatus) {
        match function {
            UrbFunction::Control(_) => self.control_transfers += 1,
            UrbFunction::Bulk => self.bulk_transfers += 1,
            UrbFunction::Interrupt => self.interrupt_transfers += 1,
            _ => return,
        }
        if status.is_transport_error() {
            self.transfer_errors += 1;
        }
    }
}

pub struct HostController {
    pub id: HcId,
    pub(crate) driver: Box<dyn HostControllerDriver>,
    pub(crate) state: HcState,
    pub(crate) devices: Vec<DeviceId>,
    /// Address-0 control pipes for low, full and high speed
    pub(crate) default_eps: [EpHandle; 3],
    pub(crate) addresses: AddressPool,
    pub(crate) root_hub: RootHub,
    /// Port currently holding the reset token
    pub(crate) active_port_reset: ResetToken,
    pub(crate) refs: RefCount,
    frame_timer: TimerId,
    pub(crate) scan_timer: TimerId,
}

impl HostController {
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    pub fn state(&self) -> HcState {
        self.state
    }

    pub fn root_hub(&self) -> &RootHub {
        &self.root_hub
    }

    pub fn reset_token(&self) -> ResetToken {
        self.active_port_reset
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub(crate) fn default_endpoint(&self, speed: UsbSpeed) -> EpHandle {
        match speed {
            UsbSpeed::Low => self.default_eps[0],
            UsbSpeed::Full => self.default_eps[1],
            UsbSpeed::High => self.default_eps[2],
        }
    }
}

pub struct UsbDevice {
    pub id: DeviceId,
    pub hc: HcId,
    pub address: u8,
    pub speed: UsbSpeed,
    /// Root hub port the device is attached to
    pub port: u8,
    pub state: DeviceState,
    pub descriptor: Option<DeviceDescriptor>,
    pub configuration: Option<Configuration>,
    pub interfaces: Vec<InterfaceId>,
    pub(crate) ep0: Option<EpHandle>,
    pub(crate) ep0_mps: u16,
    pub(crate) sub: SubState,
    pub(crate) refs: RefCount,
    /// Requests submitted and not yet completed
    pub(crate) pending: usize,
}

impl UsbDevice {
    /// Outstanding references, including the creation reference.
    pub fn ref_count(&self) -> usize {
        self.refs.count()
    }

    pub fn ep0_max_packet_size(&self) -> u16 {
        self.ep0_mps
    }
}

pub struct Interface {
    pub id: InterfaceId,
    pub device: DeviceId,
    pub info: InterfaceInfo,
    /// Open pipes by endpoint address
    pub(crate) pipes: BTreeMap<u8, EpHandle>,
}

impl Interface {
    pub fn number(&self) -> u8 {
        self.info.descriptor.interface_number
    }

    pub fn has_pipe(&self, endpoint: u8) -> bool {
        self.pipes.contains_key(&endpoint)
    }
}

pub struct UsbHost {
    pub(crate) config: HostConfig,
    pub(crate) controllers: BTreeMap<HcId, HostController>,
    pub(crate) devices: BTreeMap<DeviceId, UsbDevice>,
    pub(crate) interfaces: BTreeMap<InterfaceId, Interface>,
    pub(crate) requests: BTreeMap<UrbId, PendingRequest>,
    pub(crate) timers: Timers<TimerEvent>,
    pub(crate) notifier: Notifier,
    pub(crate) stats: UsbStats,
    /// Endpoint-function requests finishing once their controller is idle
    deferred: Vec<(HcId, UrbId, UrbStatus)>,
    signal: InterruptSignal,
    pub(crate) now: u64,
    next_hc: u32,
    next_device: u32,
    pub(crate) next_interface: u32,
    next_urb: u32,
}

impl UsbHost {
    pub fn new(config: HostConfig) -> Self {
        let mut timers = Timers::new();
        let pnp_timer = timers.alloc(TimerEvent::PnpDispatch);
        Self {
            config,
            controllers: BTreeMap::new(),
            devices: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            requests: BTreeMap::new(),
            timers,
            notifier: Notifier::new(pnp_timer),
            stats: UsbStats::default(),
            deferred: Vec::new(),
            signal: InterruptSignal::default(),
            now: 0,
            next_hc: 1,
            next_device: 1,
            next_interface: 1,
            next_urb: 1,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Mailbox for the interrupt service routine.
    pub fn signal(&self) -> InterruptSignal {
        self.signal.clone()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Start a controller and take ownership of its root hub.
    ///
    /// Ports are powered according to the power switching policy and the
    /// first root hub scan runs once the ports' power-good time elapsed.
    pub fn add_host_controller(&mut self, mut driver: Box<dyn HostControllerDriver>) -> UsbResult<HcId> {
        driver.start()?;

        let mut default_eps = [EpHandle(0); 3];
        let speeds = [(UsbSpeed::Low, 8), (UsbSpeed::Full, 64), (UsbSpeed::High, 64)];
        for (i, &(speed, mps)) in speeds.iter().enumerate() {
            match driver.add_endpoint(&EndpointParams::control(0, mps, speed)) {
                Ok(ep) => default_eps[i] = ep,
                Err(e) => {
                    for &ep in &default_eps[..i] {
                        driver.release_endpoint(ep);
                    }
                    if let Err(e) = driver.set_state(HcState::Removed) {
                        log::warn!("usb: {}: stop after failed start: {}", driver.name(), e);
                    }
                    return Err(e);
                }
            }
        }

        let id = HcId(self.next_hc);
        self.next_hc += 1;

        let ports = driver.port_count();
        let power = match self.config.power_switching {
            PowerSwitching::AlwaysOn => Ok(()),
            PowerSwitching::Ganged => driver.set_port_power(PowerTarget::All, true),
            PowerSwitching::PerPort => {
                (1..=ports).try_for_each(|p| driver.set_port_power(PowerTarget::Port(p), true))
            }
        };
        if let Err(e) = power {
            log::warn!("usb: {}: port power: {}", driver.name(), e);
        }

        let port_timers: Vec<TimerId> = (1..=ports)
            .map(|p| self.timers.alloc(TimerEvent::Sub(SubRef::Port(id, p))))
            .collect();
        let frame_timer = self.timers.alloc(TimerEvent::FrameTick(id));
        let scan_timer = self.timers.alloc(TimerEvent::RootHubScan(id));
        self.timers.start(scan_timer, self.now, driver.power_good_time_ms());

        log::info!(
            "usb: controller {:?} ({}) added, {} root hub ports, {:?} power",
            id,
            driver.name(),
            ports,
            self.config.power_switching
        );

        self.controllers.insert(
            id,
            HostController {
                id,
                driver,
                state: HcState::Working,
                devices: Vec::new(),
                default_eps,
                addresses: AddressPool::default(),
                root_hub: RootHub::new(&port_timers),
                active_port_reset: ResetToken::default(),
                refs: RefCount::new(),
                frame_timer,
                scan_timer,
            },
        );
        Ok(id)
    }

    /// Tear a controller down.
    ///
    /// Every device on it is removed, pending requests complete with
    /// `DeviceRemoved` and the controller is reaped once the last hold on
    /// it is gone.
    pub fn remove_host_controller(&mut self, hc: HcId) -> UsbResult<()> {
        let ctrl = self.controllers.get(&hc).ok_or(UsbError::NotFound)?;
        if ctrl.state == HcState::Removed {
            return Err(UsbError::ControllerRemoved);
        }
        let devices = ctrl.devices.clone();
        let ports = ctrl.root_hub.len() as u8;

        for device in devices {
            self.remove_device(device);
        }
        for port in 1..=ports {
            self.sub_cancel(SubRef::Port(hc, port));
        }

        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return Ok(());
        };
        for ep in ctrl.default_eps {
            ctrl.driver.release_endpoint(ep);
        }
        if let Err(e) = ctrl.driver.set_state(HcState::Removed) {
            log::warn!("usb: {}: stop failed: {}", ctrl.driver.name(), e);
        }
        ctrl.state = HcState::Removed;
        ctrl.active_port_reset.clear();
        for port in ctrl.root_hub.ports_mut() {
            port.state = PortState::Removed;
            port.device = None;
        }
        self.timers.cancel(ctrl.scan_timer);
        self.timers.cancel(ctrl.frame_timer);
        log::info!("usb: controller {:?} removed", hc);
        Ok(())
    }

    /// Queue a request on an interface's pipe.
    ///
    /// Control requests go to the device's default pipe. `ResetEndpoint`
    /// and `AbortEndpoint` act at once and complete through `completion`
    /// like any other request.
    pub fn submit_request(
        &mut self,
        interface: InterfaceId,
        urb: Urb,
        completion: Completion,
    ) -> UsbResult<UrbId> {
        if let UrbFunction::Isochronous { .. } = urb.function {
            return Err(UsbError::NotSupported);
        }
        let endpoint = match urb.function {
            UrbFunction::Control(_) => 0,
            _ => urb.endpoint,
        };
        let (hc, device, ep, hold) = self.pipe(interface, endpoint)?;

        match urb.function {
            UrbFunction::ResetEndpoint | UrbFunction::AbortEndpoint => {
                let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
                if urb.function == UrbFunction::ResetEndpoint {
                    ctrl.driver.reset_endpoint(ep)?;
                } else {
                    ctrl.driver.abort_endpoint(ep);
                }
                let id = self.next_urb_id();
                self.track(id, hc, ep, Some(device), urb, Owner::Client(completion), Some(hold));
                self.deferred.push((hc, id, UrbStatus::Success));
                self.arm_frame_tick(hc);
                Ok(id)
            }
            _ => self.dispatch(hc, ep, Some(device), urb, Owner::Client(completion), Some(hold)),
        }
    }

    /// Cancel everything queued on a pipe; the requests complete `Cancelled`.
    pub fn abort_endpoint(&mut self, interface: InterfaceId, endpoint: u8) -> UsbResult<()> {
        let (hc, _, ep, _hold) = self.pipe(interface, endpoint)?;
        let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
        ctrl.driver.abort_endpoint(ep);
        self.arm_frame_tick(hc);
        Ok(())
    }

    /// Clear a pipe's halt and data toggle.
    pub fn reset_endpoint(&mut self, interface: InterfaceId, endpoint: u8) -> UsbResult<()> {
        let (hc, _, ep, _hold) = self.pipe(interface, endpoint)?;
        let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
        ctrl.driver.reset_endpoint(ep)
    }

    /// Run the bus task.
    ///
    /// Services raised interrupts, delivers completions and fires every
    /// timer due at `now`, until nothing is left to do. Returns the next
    /// time `poll` has work.
    pub fn poll(&mut self, now: u64) -> Option<u64> {
        if now > self.now {
            self.now = now;
        }
        for hc in self.signal.take() {
            self.service_interrupt(hc);
        }
        loop {
            let mut progress = self.drain_completions();
            progress |= self.run_deferred();
            if let Some((_, event)) = self.timers.pop_expired(self.now) {
                self.run_timer(event);
                progress = true;
            }
            if !progress {
                break;
            }
        }
        let ids: Vec<HcId> = self.controllers.keys().copied().collect();
        for hc in ids {
            self.arm_frame_tick(hc);
        }
        self.reap();
        self.timers.next_deadline()
    }

    pub fn controller(&self, hc: HcId) -> Option<&HostController> {
        self.controllers.get(&hc)
    }

    pub fn controller_ref_count(&self, hc: HcId) -> Option<usize> {
        self.controllers.get(&hc).map(|c| c.refs.count())
    }

    pub fn device(&self, id: DeviceId) -> Option<&UsbDevice> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &UsbDevice> {
        self.devices.values()
    }

    pub fn interface(&self, id: InterfaceId) -> Option<&Interface> {
        self.interfaces.get(&id)
    }

    /// Interfaces of devices still attached.
    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.values().filter(move |i| self.interface_is_live(i.id))
    }

    pub(crate) fn interface_is_live(&self, id: InterfaceId) -> bool {
        self.interfaces
            .get(&id)
            .and_then(|i| self.devices.get(&i.device))
            .map_or(false, |d| d.state != DeviceState::Removed)
    }

    pub fn stats(&self) -> &UsbStats {
        &self.stats
    }

    /// Requests submitted and not yet completed, across all controllers.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn next_urb_id(&mut self) -> UrbId {
        let id = UrbId(self.next_urb);
        self.next_urb = self.next_urb.wrapping_add(1).max(1);
        id
    }

    /// Resolve an interface endpoint to its controller pipe, taking a hold
    /// on the device.
    fn pipe(&self, interface: InterfaceId, endpoint: u8) -> UsbResult<(HcId, DeviceId, EpHandle, Hold)> {
        let Some(iface) = self.interfaces.get(&interface) else {
            // ids are never reused: a known id that is gone was reaped
            return Err(if interface.0 != 0 && interface.0 < self.next_interface {
                UsbError::DeviceRemoved
            } else {
                UsbError::NotFound
            });
        };
        let dev = self.devices.get(&iface.device).ok_or(UsbError::DeviceRemoved)?;
        if dev.state == DeviceState::Removed {
            return Err(UsbError::DeviceRemoved);
        }
        match self.controllers.get(&dev.hc) {
            Some(ctrl) if ctrl.state == HcState::Removed => return Err(UsbError::ControllerRemoved),
            Some(_) => {}
            None => return Err(UsbError::NotFound),
        }
        let ep = if endpoint & 0x0F == 0 {
            dev.ep0.ok_or(UsbError::Invalid)?
        } else {
            *iface.pipes.get(&endpoint).ok_or(UsbError::NotFound)?
        };
        Ok((dev.hc, dev.id, ep, dev.refs.hold()))
    }

    /// Hand a request to the controller driver and track it until it
    /// completes.
    pub(crate) fn dispatch(
        &mut self,
        hc: HcId,
        ep: EpHandle,
        device: Option<DeviceId>,
        urb: Urb,
        owner: Owner,
        hold: Option<Hold>,
    ) -> UsbResult<UrbId> {
        let id = UrbId(self.next_urb);
        let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
        if ctrl.state == HcState::Removed {
            return Err(UsbError::ControllerRemoved);
        }
        ctrl.driver.submit_request(ep, id, &urb)?;
        self.next_urb_id();
        self.track(id, hc, ep, device, urb, owner, hold);
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn track(
        &mut self,
        id: UrbId,
        hc: HcId,
        ep: EpHandle,
        device: Option<DeviceId>,
        urb: Urb,
        owner: Owner,
        hold: Option<Hold>,
    ) {
        if let Some(dev) = device.and_then(|d| self.devices.get_mut(&d)) {
            dev.pending += 1;
        }
        self.requests.insert(
            id,
            PendingRequest {
                hc,
                ep,
                device,
                urb,
                owner,
                hold,
            },
        );
    }

    /// Ask the controller to abort the endpoint a tracked request sits on.
    pub(crate) fn abort_request(&mut self, id: UrbId) {
        let Some(req) = self.requests.get(&id) else {
            return;
        };
        let (hc, ep) = (req.hc, req.ep);
        if let Some(ctrl) = self.controllers.get_mut(&hc) {
            if ctrl.state != HcState::Removed {
                ctrl.driver.abort_endpoint(ep);
            }
        }
        self.arm_frame_tick(hc);
    }

    fn finish_request(&mut self, done: Completed) {
        let Some(req) = self.requests.remove(&done.urb) else {
            log::warn!("usb: completion for unknown request {:?}", done.urb);
            return;
        };
        let PendingRequest {
            hc,
            device,
            mut urb,
            owner,
            hold,
            ..
        } = req;

        let mut device_gone = false;
        if let Some(dev) = device.and_then(|d| self.devices.get_mut(&d)) {
            dev.pending = dev.pending.saturating_sub(1);
            device_gone = dev.state == DeviceState::Removed;
        }
        let hc_gone = self
            .controllers
            .get(&hc)
            .map_or(true, |c| c.state == HcState::Removed);

        let status = match done.status {
            UrbStatus::Cancelled if device_gone || hc_gone => UrbStatus::DeviceRemoved,
            status => status,
        };
        let n = done.data.len().min(urb.buffer.len());
        urb.buffer[..n].copy_from_slice(&done.data[..n]);
        urb.actual_length = done.actual_length;
        urb.status = Some(status);
        self.stats.record_transfer(urb.function, status);

        match owner {
            Owner::Client(completion) => completion(self, urb),
            Owner::Sub(sub) => self.sub_request_done(sub, done.urb, urb),
        }
        drop(hold);
    }

    fn service_interrupt(&mut self, hc: HcId) {
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        if ctrl.state == HcState::Removed {
            return;
        }
        if ctrl.driver.service_interrupt() {
            self.root_hub_scan(hc);
        }
    }

    fn drain_completions(&mut self) -> bool {
        let mut done = Vec::new();
        let mut progress = false;
        let ids: Vec<HcId> = self.controllers.keys().copied().collect();
        for hc in ids {
            if let Some(ctrl) = self.controllers.get_mut(&hc) {
                ctrl.driver.take_completions(&mut done);
            }
            for completed in done.drain(..) {
                progress = true;
                self.finish_request(completed);
            }
        }
        progress
    }

    /// Endpoint resets and aborts complete after the controller finished
    /// the frame-deferred part of the work.
    fn run_deferred(&mut self) -> bool {
        if self.deferred.is_empty() {
            return false;
        }
        let controllers = &self.controllers;
        let (ready, waiting): (Vec<_>, Vec<_>) = self.deferred.drain(..).partition(|(hc, _, _)| {
            controllers
                .get(hc)
                .map_or(true, |c| c.state == HcState::Removed || !c.driver.needs_frame_tick())
        });
        self.deferred = waiting;
        let progress = !ready.is_empty();
        for (_, urb, status) in ready {
            self.finish_request(Completed {
                urb,
                status,
                actual_length: 0,
                data: Vec::new(),
            });
        }
        progress
    }

    fn run_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Sub(sub) => self.sub_timer_fired(sub),
            TimerEvent::PnpDispatch => self.dispatch_pnp(),
            TimerEvent::FrameTick(hc) => {
                if let Some(ctrl) = self.controllers.get_mut(&hc) {
                    if ctrl.state != HcState::Removed {
                        ctrl.driver.frame_tick();
                    }
                }
            }
            TimerEvent::RootHubScan(hc) => self.root_hub_scan(hc),
        }
    }

    /// Keep a frame tick scheduled while the driver has deferred work.
    pub(crate) fn arm_frame_tick(&mut self, hc: HcId) {
        let Some(ctrl) = self.controllers.get(&hc) else {
            return;
        };
        if ctrl.state == HcState::Removed || !ctrl.driver.needs_frame_tick() {
            return;
        }
        if !self.timers.is_running(ctrl.frame_timer) {
            self.timers.start(ctrl.frame_timer, self.now, self.config.frame_ms.max(1));
        }
    }

    pub(crate) fn schedule_scan(&mut self, hc: HcId, delay_ms: u32) {
        if let Some(ctrl) = self.controllers.get(&hc) {
            if ctrl.state == HcState::Working {
                self.timers.start(ctrl.scan_timer, self.now, delay_ms);
            }
        }
    }

    pub(crate) fn sub_mut(&mut self, sub: SubRef) -> Option<&mut SubState> {
        match sub {
            SubRef::Port(hc, port) => self
                .controllers
                .get_mut(&hc)
                .and_then(|c| c.root_hub.port_mut(port))
                .map(|p| &mut p.sub),
            SubRef::Device(id) => self.devices.get_mut(&id).map(|d| &mut d.sub),
        }
    }

    /// Register a freshly addressed device on `hc`.
    pub(crate) fn create_device(&mut self, hc: HcId, port: u8, address: u8, speed: UsbSpeed) -> Option<DeviceId> {
        let ctrl = self.controllers.get_mut(&hc)?;
        let id = DeviceId(self.next_device);
        self.next_device += 1;
        ctrl.devices.push(id);
        let timer = self.timers.alloc(TimerEvent::Sub(SubRef::Device(id)));
        self.devices.insert(
            id,
            UsbDevice {
                id,
                hc,
                address,
                speed,
                port,
                state: DeviceState::Addressing,
                descriptor: None,
                configuration: None,
                interfaces: Vec::new(),
                ep0: None,
                ep0_mps: 8,
                sub: SubState::new(timer),
                refs: RefCount::new(),
                pending: 0,
            },
        );
        Some(id)
    }

    /// Detach a device: its interfaces go away (with PnP `Remove`
    /// notifications), its pipes are released so in-flight requests end as
    /// `DeviceRemoved`, and its address returns to the pool.
    pub(crate) fn remove_device(&mut self, id: DeviceId) {
        let Some(dev) = self.devices.get_mut(&id) else {
            return;
        };
        if dev.state == DeviceState::Removed {
            return;
        }
        let was_configured = dev.state == DeviceState::Configured;
        dev.state = DeviceState::Removed;
        let (hc, address, port) = (dev.hc, dev.address, dev.port);
        let interfaces = dev.interfaces.clone();
        let mut pipes: Vec<EpHandle> = dev.ep0.take().into_iter().collect();

        // interfaces stay registered until the reap so late submits see
        // DeviceRemoved
        for iid in interfaces {
            self.queue_pnp_remove(iid);
            if let Some(iface) = self.interfaces.get_mut(&iid) {
                pipes.extend(core::mem::take(&mut iface.pipes).into_values());
            }
        }

        if let Some(ctrl) = self.controllers.get_mut(&hc) {
            for ep in pipes {
                ctrl.driver.release_endpoint(ep);
            }
            ctrl.addresses.free(address);
            ctrl.devices.retain(|&d| d != id);
            if let Some(p) = ctrl.root_hub.port_mut(port) {
                if p.device == Some(id) {
                    p.device = None;
                }
            }
        }
        self.arm_frame_tick(hc);
        self.sub_cancel(SubRef::Device(id));
        if was_configured {
            self.stats.current_devices = self.stats.current_devices.saturating_sub(1);
        }
        log::info!("usb: device {:?} at address {} removed", id, address);
    }

    /// Drop removed objects nobody references any more.
    fn reap(&mut self) {
        let dead: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| {
                d.state == DeviceState::Removed && d.pending == 0 && d.sub.is_idle() && d.refs.is_idle()
            })
            .map(|d| d.id)
            .collect();
        for id in dead {
            if let Some(dev) = self.devices.remove(&id) {
                for iid in &dev.interfaces {
                    self.interfaces.remove(iid);
                }
                self.timers.free(dev.sub.timer());
                log::debug!("usb: device {:?} reaped", id);
            }
        }

        let dead: Vec<HcId> = self
            .controllers
            .values()
            .filter(|c| c.state == HcState::Removed && c.refs.is_idle())
            .map(|c| c.id)
            .filter(|hc| {
                !self.devices.values().any(|d| d.hc == *hc) && !self.requests.values().any(|r| r.hc == *hc)
            })
            .collect();
        for hc in dead {
            if let Some(ctrl) = self.controllers.remove(&hc) {
                for port in ctrl.root_hub.ports() {
                    self.timers.free(port.sub.timer());
                }
                self.timers.free(ctrl.frame_timer);
                self.timers.free(ctrl.scan_timer);
                self.deferred.retain(|(h, _, _)| *h != hc);
                log::debug!("usb: controller {:?} reaped", hc);
            }
        }
    }
}
