//! Client notifications: interface arrival/removal (PnP) and enumeration
//! errors.
//!
//! PnP events are never delivered from inside the call that caused them.
//! They are queued per registration and handed out from a short timer on
//! the bus task, so a callback may submit requests or (un)register freely.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::bus::{DeviceId, HcId, InterfaceId, UsbHost};
use crate::enumerate::DeviceState;
use crate::error::{UrbStatus, UsbError, UsbResult};
use crate::timer::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PnpHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnumErrorHandle(u32);

/// Identification of one interface, as matched by [`PnpFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceIds {
    pub vendor: u16,
    pub product: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub number: u8,
}

/// Which interfaces a PnP client wants; `None` fields match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PnpFilter {
    pub vendor: Option<u16>,
    pub product: Option<u16>,
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
    pub interface_number: Option<u8>,
}

impl PnpFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn class(class: u8) -> Self {
        Self {
            class: Some(class),
            ..Self::default()
        }
    }

    pub fn device(vendor: u16, product: u16) -> Self {
        Self {
            vendor: Some(vendor),
            product: Some(product),
            ..Self::default()
        }
    }

    pub fn matches(&self, ids: &InterfaceIds) -> bool {
        fn check<T: PartialEq>(want: Option<T>, have: T) -> bool {
            want.map_or(true, |w| w == have)
        }
        check(self.vendor, ids.vendor)
            && check(self.product, ids.product)
            && check(self.class, ids.class)
            && check(self.subclass, ids.subclass)
            && check(self.protocol, ids.protocol)
            && check(self.interface_number, ids.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PnpEventKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpEvent {
    pub kind: PnpEventKind,
    pub device: DeviceId,
    pub interface: InterfaceId,
    pub ids: InterfaceIds,
}

pub type PnpCallback = Box<dyn FnMut(&mut UsbHost, &PnpEvent)>;

/// Enumeration step an error report refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumPhase {
    PortReset,
    SetAddress,
    MaxPacketSize,
    DeviceDescriptor,
    ConfigDescriptor,
    SetConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumErrorReport {
    pub hc: HcId,
    pub port: u8,
    pub phase: EnumPhase,
    pub status: UrbStatus,
    /// Another attempt follows
    pub retry: bool,
    /// No further attempt on this port/device
    pub stop: bool,
    /// The device went away
    pub disconnect: bool,
}

pub type EnumErrorCallback = Box<dyn FnMut(&EnumErrorReport)>;

struct PnpRegistration {
    filter: PnpFilter,
    /// Taken out while the callback runs
    callback: Option<PnpCallback>,
}

pub(crate) struct Notifier {
    pnp: BTreeMap<PnpHandle, PnpRegistration>,
    queue: VecDeque<(PnpHandle, PnpEvent)>,
    enum_errors: BTreeMap<EnumErrorHandle, EnumErrorCallback>,
    next_handle: u32,
    timer: TimerId,
}

impl Notifier {
    pub(crate) fn new(timer: TimerId) -> Self {
        Self {
            pnp: BTreeMap::new(),
            queue: VecDeque::new(),
            enum_errors: BTreeMap::new(),
            next_handle: 1,
            timer,
        }
    }

    fn next_handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl UsbHost {
    /// Register for interface arrival and removal.
    ///
    /// Interfaces already present and matching `filter` produce one `Add`
    /// each, delivered later from the bus task like every other event.
    pub fn register_pnp(&mut self, filter: PnpFilter, callback: PnpCallback) -> PnpHandle {
        let handle = PnpHandle(self.notifier.next_handle());
        self.notifier.pnp.insert(
            handle,
            PnpRegistration {
                filter,
                callback: Some(callback),
            },
        );
        let existing: Vec<InterfaceId> = self.interfaces.keys().copied().collect();
        for id in existing {
            if let Some(event) = self.pnp_event(PnpEventKind::Add, id) {
                if filter.matches(&event.ids) {
                    self.notifier.queue.push_back((handle, event));
                }
            }
        }
        self.arm_pnp();
        log::debug!("notify: pnp client {:?} registered for {:?}", handle, filter);
        handle
    }

    /// Queued events for the handle are dropped.
    pub fn unregister_pnp(&mut self, handle: PnpHandle) -> UsbResult<()> {
        self.notifier.pnp.remove(&handle).ok_or(UsbError::NotFound)?;
        self.notifier.queue.retain(|(h, _)| *h != handle);
        Ok(())
    }

    /// Enumeration errors are reported synchronously, from the failing step.
    pub fn register_enum_error(&mut self, callback: EnumErrorCallback) -> EnumErrorHandle {
        let handle = EnumErrorHandle(self.notifier.next_handle());
        self.notifier.enum_errors.insert(handle, callback);
        handle
    }

    pub fn unregister_enum_error(&mut self, handle: EnumErrorHandle) -> UsbResult<()> {
        self.notifier
            .enum_errors
            .remove(&handle)
            .map(|_| ())
            .ok_or(UsbError::NotFound)
    }

    /// PnP events waiting for delivery.
    pub fn pending_pnp_events(&self) -> usize {
        self.notifier.queued()
    }

    fn pnp_event(&self, kind: PnpEventKind, interface: InterfaceId) -> Option<PnpEvent> {
        let iface = self.interfaces.get(&interface)?;
        let device = self.devices.get(&iface.device)?;
        if kind == PnpEventKind::Add && device.state == DeviceState::Removed {
            return None;
        }
        let (vendor, product) = device.descriptor.map_or((0, 0), |d| (d.vendor_id, d.product_id));
        let d = &iface.info.descriptor;
        Some(PnpEvent {
            kind,
            device: iface.device,
            interface,
            ids: InterfaceIds {
                vendor,
                product,
                class: d.interface_class,
                subclass: d.interface_subclass,
                protocol: d.interface_protocol,
                number: d.interface_number,
            },
        })
    }

    fn queue_pnp(&mut self, kind: PnpEventKind, interface: InterfaceId) {
        let Some(event) = self.pnp_event(kind, interface) else {
            return;
        };
        let matching: Vec<PnpHandle> = self
            .notifier
            .pnp
            .iter()
            .filter(|(_, r)| r.filter.matches(&event.ids))
            .map(|(h, _)| *h)
            .collect();
        for handle in matching {
            self.notifier.queue.push_back((handle, event));
        }
        self.arm_pnp();
    }

    pub(crate) fn queue_pnp_add(&mut self, interface: InterfaceId) {
        self.queue_pnp(PnpEventKind::Add, interface);
    }

    /// Must run while the interface is still registered.
    pub(crate) fn queue_pnp_remove(&mut self, interface: InterfaceId) {
        let Some(event) = self.pnp_event(PnpEventKind::Remove, interface) else {
            return;
        };
        // a client whose Add is still queued never hears of the interface
        let mut unseen = Vec::new();
        self.notifier.queue.retain(|(h, e)| {
            let withdrawn = e.interface == interface && e.kind == PnpEventKind::Add;
            if withdrawn {
                unseen.push(*h);
            }
            !withdrawn
        });
        let matching: Vec<PnpHandle> = self
            .notifier
            .pnp
            .iter()
            .filter(|(h, r)| r.filter.matches(&event.ids) && !unseen.contains(h))
            .map(|(h, _)| *h)
            .collect();
        for handle in matching {
            self.notifier.queue.push_back((handle, event));
        }
        self.arm_pnp();
    }

    fn arm_pnp(&mut self) {
        let timer = self.notifier.timer;
        if !self.notifier.queue.is_empty() && !self.timers.is_running(timer) {
            self.timers.start(timer, self.now, self.config.pnp_dispatch_delay_ms);
        }
    }

    /// Deliver the events queued when the timer fired.
    pub(crate) fn dispatch_pnp(&mut self) {
        let batch: Vec<(PnpHandle, PnpEvent)> = self.notifier.queue.drain(..).collect();
        for (handle, event) in batch {
            if event.kind == PnpEventKind::Add && !self.interface_is_live(event.interface) {
                continue;
            }
            let Some(mut callback) = self
                .notifier
                .pnp
                .get_mut(&handle)
                .and_then(|r| r.callback.take())
            else {
                continue;
            };
            callback(self, &event);
            if let Some(registration) = self.notifier.pnp.get_mut(&handle) {
                registration.callback = Some(callback);
            }
        }
        self.arm_pnp();
    }

    pub(crate) fn report_enum_error(&mut self, report: &EnumErrorReport) {
        log::debug!("notify: enumeration error {:?}", report);
        for callback in self.notifier.enum_errors.values_mut() {
            callback(report);
        }
    }
}
