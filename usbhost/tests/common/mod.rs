//! Scripted host controller for bus-level tests.
//!
//! Ports are plain status/change words the test flips. One optional device
//! answers control requests on the port it is plugged into once that port
//! is enabled; everything else stays queued until aborted or released.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use usbhost::hcd::{HubChange, HubStatus, PortChange, PortStatus, PowerTarget};
use usbhost::{
    Completed, EndpointParams, EpHandle, HcId, HcState, HostConfig, HostControllerDriver, Urb,
    UrbFunction, UrbId, UrbStatus, UsbError, UsbHost, UsbResult,
};

pub struct MockDevice {
    pub port: u8,
    pub address: u8,
    pub device_descriptor: Vec<u8>,
    pub config_descriptor: Vec<u8>,
    pub configuration: Option<u8>,
}

pub struct MockState {
    pub ports: Vec<(PortStatus, PortChange)>,
    pub power_good_ms: u32,
    pub endpoints: BTreeMap<u32, EndpointParams>,
    pub released: Vec<EndpointParams>,
    /// Every accepted submission, in order
    pub submitted: Vec<(EndpointParams, Urb)>,
    pub queued: Vec<(EpHandle, UrbId)>,
    pub completions: Vec<Completed>,
    pub device: Option<MockDevice>,
    pub resets: Vec<u8>,
    pub power: Vec<(PowerTarget, bool)>,
    /// A reset leaves the port enabled
    pub reset_enables: bool,
    /// The device answers control requests
    pub answer_control: bool,
    pub root_hub_changed: bool,
    pub state: Option<HcState>,
    next_ep: u32,
}

impl MockState {
    fn new(ports: u8) -> Self {
        Self {
            ports: vec![(PortStatus::POWER, PortChange::empty()); ports as usize],
            power_good_ms: 20,
            endpoints: BTreeMap::new(),
            released: Vec::new(),
            submitted: Vec::new(),
            queued: Vec::new(),
            completions: Vec::new(),
            device: None,
            resets: Vec::new(),
            power: Vec::new(),
            reset_enables: true,
            answer_control: true,
            root_hub_changed: false,
            state: None,
            next_ep: 1,
        }
    }

    fn cancel(&mut self, pick: impl Fn(EpHandle) -> bool) {
        let (cancelled, kept): (Vec<_>, Vec<_>) = self.queued.drain(..).partition(|(ep, _)| pick(*ep));
        self.queued = kept;
        for (_, urb) in cancelled {
            self.completions.push(Completed {
                urb,
                status: UrbStatus::Cancelled,
                actual_length: 0,
                data: Vec::new(),
            });
        }
    }

    fn answer(&mut self, params: &EndpointParams, urb: &Urb) -> Option<(UrbStatus, Vec<u8>)> {
        let UrbFunction::Control(setup) = urb.function else {
            return None;
        };
        if !self.answer_control {
            return None;
        }
        let port_enabled = |port: u8, ports: &[(PortStatus, PortChange)]| {
            ports
                .get(port as usize - 1)
                .map_or(false, |(s, _)| s.contains(PortStatus::ENABLE))
        };
        let ports = self.ports.clone();
        let dev = match self.device.as_mut() {
            Some(dev) if dev.address == params.device_address && port_enabled(dev.port, &ports) => dev,
            _ => return Some((UrbStatus::NotResponding, Vec::new())),
        };
        let len = setup.length as usize;
        Some(match setup.request {
            0x05 => {
                dev.address = setup.value as u8;
                (UrbStatus::Success, Vec::new())
            }
            0x06 => match setup.value >> 8 {
                1 => (UrbStatus::Success, dev.device_descriptor[..len.min(dev.device_descriptor.len())].to_vec()),
                2 => (UrbStatus::Success, dev.config_descriptor[..len.min(dev.config_descriptor.len())].to_vec()),
                _ => (UrbStatus::Stall, Vec::new()),
            },
            0x09 => {
                dev.configuration = Some(setup.value as u8);
                (UrbStatus::Success, Vec::new())
            }
            _ => (UrbStatus::Stall, Vec::new()),
        })
    }
}

pub type Shared = Rc<RefCell<MockState>>;

pub struct MockHcd(pub Shared);

impl HostControllerDriver for MockHcd {
    fn name(&self) -> &str {
        "mock"
    }

    fn start(&mut self) -> UsbResult<()> {
        self.0.borrow_mut().state = Some(HcState::Working);
        Ok(())
    }

    fn add_endpoint(&mut self, params: &EndpointParams) -> UsbResult<EpHandle> {
        let mut s = self.0.borrow_mut();
        let ep = EpHandle(s.next_ep);
        s.next_ep += 1;
        s.endpoints.insert(ep.0, *params);
        Ok(ep)
    }

    fn release_endpoint(&mut self, ep: EpHandle) {
        let mut s = self.0.borrow_mut();
        if let Some(params) = s.endpoints.remove(&ep.0) {
            s.released.push(params);
        }
        s.cancel(|e| e == ep);
    }

    fn submit_request(&mut self, ep: EpHandle, id: UrbId, urb: &Urb) -> UsbResult<()> {
        let mut s = self.0.borrow_mut();
        if s.state == Some(HcState::Removed) {
            return Err(UsbError::ControllerRemoved);
        }
        let params = *s.endpoints.get(&ep.0).ok_or(UsbError::NotFound)?;
        s.submitted.push((params, urb.clone()));
        match s.answer(&params, urb) {
            Some((status, data)) => s.completions.push(Completed {
                urb: id,
                status,
                actual_length: data.len(),
                data,
            }),
            None => s.queued.push((ep, id)),
        }
        Ok(())
    }

    fn abort_endpoint(&mut self, ep: EpHandle) {
        self.0.borrow_mut().cancel(|e| e == ep);
    }

    fn reset_endpoint(&mut self, ep: EpHandle) -> UsbResult<()> {
        if self.0.borrow().endpoints.contains_key(&ep.0) {
            Ok(())
        } else {
            Err(UsbError::NotFound)
        }
    }

    fn set_state(&mut self, state: HcState) -> UsbResult<()> {
        let mut s = self.0.borrow_mut();
        if state == HcState::Removed {
            s.cancel(|_| true);
        }
        s.state = Some(state);
        Ok(())
    }

    fn reset_port(&mut self, port: u8) -> UsbResult<()> {
        let mut s = self.0.borrow_mut();
        s.resets.push(port);
        let enables = s.reset_enables;
        let (status, change) = s.ports.get_mut(port as usize - 1).ok_or(UsbError::Invalid)?;
        if enables && status.contains(PortStatus::CONNECTION) {
            status.insert(PortStatus::ENABLE);
            change.insert(PortChange::RESET);
        }
        Ok(())
    }

    fn set_port_power(&mut self, target: PowerTarget, on: bool) -> UsbResult<()> {
        self.0.borrow_mut().power.push((target, on));
        Ok(())
    }

    fn port_status(&self, port: u8) -> UsbResult<(PortStatus, PortChange)> {
        self.0
            .borrow()
            .ports
            .get((port as usize).wrapping_sub(1))
            .copied()
            .ok_or(UsbError::Invalid)
    }

    fn clear_port_change(&mut self, port: u8, change: PortChange) -> UsbResult<()> {
        let mut s = self.0.borrow_mut();
        let (_, c) = s.ports.get_mut(port as usize - 1).ok_or(UsbError::Invalid)?;
        c.remove(change);
        Ok(())
    }

    fn disable_port(&mut self, port: u8) -> UsbResult<()> {
        let mut s = self.0.borrow_mut();
        let (status, _) = s.ports.get_mut(port as usize - 1).ok_or(UsbError::Invalid)?;
        status.remove(PortStatus::ENABLE);
        Ok(())
    }

    fn hub_status(&self) -> (HubStatus, HubChange) {
        (HubStatus::empty(), HubChange::empty())
    }

    fn clear_hub_change(&mut self, _change: HubChange) {}

    fn port_count(&self) -> u8 {
        self.0.borrow().ports.len() as u8
    }

    fn power_good_time_ms(&self) -> u32 {
        self.0.borrow().power_good_ms
    }

    fn service_interrupt(&mut self) -> bool {
        core::mem::take(&mut self.0.borrow_mut().root_hub_changed)
    }

    fn needs_frame_tick(&self) -> bool {
        false
    }

    fn frame_tick(&mut self) {}

    fn take_completions(&mut self, out: &mut Vec<Completed>) {
        out.append(&mut self.0.borrow_mut().completions);
    }
}

/// Full-speed mouse: EP0 of 64 bytes, one HID interface with an interrupt
/// IN endpoint.
pub fn mouse(port: u8) -> MockDevice {
    MockDevice {
        port,
        address: 0,
        device_descriptor: vec![
            18, 1, 0x10, 0x01, 0, 0, 0, 64, 0x6D, 0x04, 0x77, 0xC0, 0x00, 0x01, 1, 2, 0, 1,
        ],
        config_descriptor: vec![
            9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
            9, 4, 0, 0, 1, 3, 1, 2, 0, // interface 0: HID boot mouse
            9, 0x21, 0x11, 0x01, 0, 1, 0x22, 52, 0, // HID
            7, 5, 0x81, 3, 8, 0, 10, // interrupt IN 1
        ],
        configuration: None,
    }
}

pub fn setup(ports: u8) -> (UsbHost, HcId, Shared) {
    setup_with(ports, HostConfig::default())
}

pub fn setup_with(ports: u8, config: HostConfig) -> (UsbHost, HcId, Shared) {
    let state = Rc::new(RefCell::new(MockState::new(ports)));
    let mut host = UsbHost::new(config);
    let hc = host
        .add_host_controller(Box::new(MockHcd(state.clone())))
        .expect("mock controller starts");
    (host, hc, state)
}

pub fn connect(state: &Shared, port: u8) {
    let mut s = state.borrow_mut();
    let (status, change) = &mut s.ports[port as usize - 1];
    status.insert(PortStatus::CONNECTION);
    change.insert(PortChange::CONNECTION);
    s.root_hub_changed = true;
}

pub fn disconnect(state: &Shared, port: u8) {
    let mut s = state.borrow_mut();
    let (status, change) = &mut s.ports[port as usize - 1];
    status.remove(PortStatus::CONNECTION | PortStatus::ENABLE);
    change.insert(PortChange::CONNECTION);
    s.root_hub_changed = true;
}

/// Poll once per millisecond up to and including `until`.
pub fn run_until(host: &mut UsbHost, until: u64) {
    let mut t = host.now();
    loop {
        host.poll(t);
        if t >= until {
            break;
        }
        t += 1;
    }
}

/// Flip the port and raise the controller interrupt.
pub fn plug(host: &UsbHost, hc: HcId, state: &Shared, port: u8) {
    connect(state, port);
    host.signal().raise(hc);
}

pub fn unplug(host: &UsbHost, hc: HcId, state: &Shared, port: u8) {
    disconnect(state, port);
    host.signal().raise(hc);
}

/// Connect a mouse on `port` and run until it is configured.
pub fn enumerate_mouse(host: &mut UsbHost, hc: HcId, state: &Shared, port: u8) {
    state.borrow_mut().device = Some(mouse(port));
    plug(host, hc, state, port);
    let until = host.now().max(20) + 200;
    run_until(host, until);
}
