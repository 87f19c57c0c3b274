//! Root hub port management and the port half of enumeration.
//!
//! Each port runs its own state machine through its [`SubState`]:
//!
//! ```text
//! Removed --connect--> Connected --token--> Enumerating(step) --> Enabled
//!                                                  |
//!                                                  +--(retries exhausted)--> Error
//! ```
//!
//! Only one port per controller may be between reset and address
//! assignment, since every new device answers at address 0. That
//! exclusivity is the controller's reset token (`active_port_reset`).
//!
//! Enumeration steps:
//!
//! ```text
//! Start ----------------> WaitRestart --reset--> WaitReset --> Res --> WaitSettle
//! Restart --(delay)-----/                                                  |
//!                                    WaitAddress <-- WaitSetAddress <-- SET_ADDRESS
//! ```
//!
//! Every continuation re-reads the port and treats a missing connection as
//! a disconnect.

use alloc::vec::Vec;

use crate::bus::{DeviceId, HcId, UsbHost};
use crate::descriptor::{SetupPacket, UsbSpeed};
use crate::error::{UrbStatus, UsbError, UsbResult};
use crate::hcd::{EndpointParams, HcState, HubChange, PortChange, PortStatus};
use crate::notify::{EnumErrorReport, EnumPhase};
use crate::substate::{SubOutcome, SubRef, SubResult, SubState};
use crate::timer::TimerId;
use crate::urb::Urb;

/// The controller's single port reset token.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResetToken(Option<u8>);

impl ResetToken {
    pub fn holder(&self) -> Option<u8> {
        self.0
    }

    pub fn is_held(&self) -> bool {
        self.0.is_some()
    }

    /// Claim the token for `port`. Claiming a held token is a logic error;
    /// it is logged and refused, and the holder keeps it.
    pub fn take(&mut self, port: u8) -> bool {
        match self.0 {
            None => {
                self.0 = Some(port);
                log::debug!("roothub: port {} takes the reset token", port);
                true
            }
            Some(holder) => {
                log::warn!("roothub: port {} claims the reset token held by port {}", port, holder);
                false
            }
        }
    }

    /// Give the token back if `port` holds it.
    pub fn release(&mut self, port: u8) -> bool {
        if self.0 == Some(port) {
            self.0 = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        self.0 = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumStep {
    /// First attempt, no delay
    Start,
    /// Retry after a failure, waits the restart delay first
    Restart,
    WaitRestart,
    WaitReset,
    /// Reset finished, speed known
    Res,
    WaitSettle,
    WaitSetAddress,
    WaitAddress,
}

impl EnumStep {
    fn phase(self) -> EnumPhase {
        match self {
            EnumStep::WaitSetAddress | EnumStep::WaitAddress => EnumPhase::SetAddress,
            _ => EnumPhase::PortReset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Removed,
    Connected,
    Enumerating(EnumStep),
    Enabled,
    /// Gave up after repeated failures; left alone until restarted
    Error,
}

#[derive(Debug)]
pub struct HubPort {
    pub number: u8,
    pub state: PortState,
    /// Status and change bits as of the last scan or continuation
    pub status: PortStatus,
    pub change: PortChange,
    /// Status captured right before the port reset
    pub shadow: PortStatus,
    pub device: Option<DeviceId>,
    /// Failed enumeration attempts since the last success
    pub retries: u8,
    pub speed: UsbSpeed,
    pub(crate) sub: SubState,
}

#[derive(Debug)]
pub struct RootHub {
    ports: Vec<HubPort>,
}

impl RootHub {
    /// One port per timer, numbered from 1.
    pub(crate) fn new(timers: &[TimerId]) -> Self {
        let ports = timers
            .iter()
            .enumerate()
            .map(|(i, &timer)| HubPort {
                number: i as u8 + 1,
                state: PortState::Removed,
                status: PortStatus::empty(),
                change: PortChange::empty(),
                shadow: PortStatus::empty(),
                device: None,
                retries: 0,
                speed: UsbSpeed::Full,
                sub: SubState::new(timer),
            })
            .collect();
        Self { ports }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn port(&self, number: u8) -> Option<&HubPort> {
        self.ports.get((number as usize).checked_sub(1)?)
    }

    pub(crate) fn port_mut(&mut self, number: u8) -> Option<&mut HubPort> {
        self.ports.get_mut((number as usize).checked_sub(1)?)
    }

    pub fn ports(&self) -> impl Iterator<Item = &HubPort> {
        self.ports.iter()
    }

    pub(crate) fn ports_mut(&mut self) -> impl Iterator<Item = &mut HubPort> {
        self.ports.iter_mut()
    }
}

impl UsbHost {
    pub fn port_state(&self, hc: HcId, port: u8) -> Option<PortState> {
        Some(self.controllers.get(&hc)?.root_hub.port(port)?.state)
    }

    pub fn port(&self, hc: HcId, port: u8) -> Option<&HubPort> {
        self.controllers.get(&hc)?.root_hub.port(port)
    }

    /// Take a port out of `Error` so the next scan enumerates it again.
    pub fn restart_port(&mut self, hc: HcId, port: u8) -> UsbResult<()> {
        let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
        if ctrl.state != HcState::Working {
            return Err(UsbError::ControllerRemoved);
        }
        let p = ctrl.root_hub.port_mut(port).ok_or(UsbError::NotFound)?;
        if p.state != PortState::Error {
            return Err(UsbError::Invalid);
        }
        p.state = PortState::Connected;
        p.retries = 0;
        log::info!("roothub: port {} restarted", port);
        self.schedule_scan(hc, 0);
        Ok(())
    }

    /// Walk every port, acknowledge changes and start the next enumeration.
    pub(crate) fn root_hub_scan(&mut self, hc: HcId) {
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        if ctrl.state != HcState::Working {
            return;
        }
        let (hub_status, hub_change) = ctrl.driver.hub_status();
        if !hub_change.is_empty() {
            if hub_change.contains(HubChange::OVER_CURRENT) {
                log::warn!("roothub: hub over-current change, status {:?}", hub_status);
            }
            ctrl.driver.clear_hub_change(hub_change);
        }
        let count = ctrl.root_hub.len() as u8;
        for port in 1..=count {
            self.scan_port(hc, port);
        }
        self.start_next_enumeration(hc);
    }

    fn scan_port(&mut self, hc: HcId, number: u8) {
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        let (status, change) = match ctrl.driver.port_status(number) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("roothub: port {} status: {}", number, e);
                return;
            }
        };
        // reset completion belongs to the enumeration machine
        let ack = change - PortChange::RESET;
        if !ack.is_empty() {
            if let Err(e) = ctrl.driver.clear_port_change(number, ack) {
                log::warn!("roothub: port {} clear change: {}", number, e);
            }
        }
        if change.contains(PortChange::OVER_CURRENT) {
            log::warn!("roothub: port {} over-current", number);
        }
        let Some(port) = ctrl.root_hub.port_mut(number) else {
            return;
        };
        port.status = status;
        port.change = change;
        let connected = status.contains(PortStatus::CONNECTION);

        match port.state {
            PortState::Error | PortState::Enumerating(_) => {}
            PortState::Removed => {
                if connected {
                    log::info!("roothub: port {} connect", number);
                    port.state = PortState::Connected;
                }
            }
            PortState::Connected => {
                if !connected {
                    port.state = PortState::Removed;
                }
            }
            PortState::Enabled => {
                let replugged = change.contains(PortChange::CONNECTION);
                if connected && !replugged && status.contains(PortStatus::ENABLE) {
                    return;
                }
                log::info!(
                    "roothub: port {} {}",
                    number,
                    if connected { "re-connect" } else { "disconnect" }
                );
                port.state = if connected {
                    PortState::Connected
                } else {
                    PortState::Removed
                };
                port.retries = 0;
                let device = port.device.take();
                if !connected {
                    if let Err(e) = ctrl.driver.disable_port(number) {
                        log::warn!("roothub: port {} disable: {}", number, e);
                    }
                }
                if let Some(device) = device {
                    self.remove_device(device);
                }
            }
        }
    }

    fn start_next_enumeration(&mut self, hc: HcId) {
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        if ctrl.state != HcState::Working {
            return;
        }
        if let Some(holder) = ctrl.active_port_reset.holder() {
            log::debug!("roothub: scan deferred, port {} holds the reset token", holder);
            return;
        }
        let Some(number) = ctrl
            .root_hub
            .ports()
            .find(|p| p.state == PortState::Connected && p.sub.is_idle())
            .map(|p| p.number)
        else {
            return;
        };
        if !ctrl.active_port_reset.take(number) {
            return;
        }
        if let Some(port) = ctrl.root_hub.port_mut(number) {
            port.state = PortState::Enumerating(EnumStep::Start);
        }
        self.port_enter(hc, number, EnumStep::Start);
    }

    fn set_step(&mut self, hc: HcId, number: u8, step: EnumStep) {
        if let Some(port) = self
            .controllers
            .get_mut(&hc)
            .and_then(|c| c.root_hub.port_mut(number))
        {
            port.state = PortState::Enumerating(step);
        }
    }

    /// Enter `step` and start its operation.
    fn port_enter(&mut self, hc: HcId, number: u8, step: EnumStep) {
        self.set_step(hc, number, step);
        let result = match step {
            EnumStep::Start => self.port_wait(hc, number, EnumStep::WaitRestart, 0),
            EnumStep::Restart => {
                let delay = self.config.restart_delay_ms;
                self.port_wait(hc, number, EnumStep::WaitRestart, delay)
            }
            EnumStep::WaitReset => self.port_reset(hc, number),
            EnumStep::Res => {
                let delay = self.config.reset_settle_ms;
                self.port_wait(hc, number, EnumStep::WaitSettle, delay)
            }
            EnumStep::WaitSetAddress => self.port_set_address(hc, number),
            EnumStep::WaitAddress => {
                let delay = self.config.address_settle_ms;
                self.port_wait(hc, number, EnumStep::WaitAddress, delay)
            }
            EnumStep::WaitRestart | EnumStep::WaitSettle => Err(UsbError::Invalid),
        };
        if let Err(e) = result {
            log::warn!("roothub: port {} {:?}: {}", number, step, e);
            self.port_failed(hc, number, step.phase(), UrbStatus::from(e));
        }
    }

    fn port_wait(&mut self, hc: HcId, number: u8, next: EnumStep, ms: u32) -> UsbResult<()> {
        self.set_step(hc, number, next);
        let hold = self.controllers.get(&hc).map(|c| c.refs.hold());
        self.sub_wait(SubRef::Port(hc, number), ms, hold)
    }

    fn port_reset(&mut self, hc: HcId, number: u8) -> UsbResult<()> {
        let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
        let port = ctrl.root_hub.port_mut(number).ok_or(UsbError::NotFound)?;
        port.shadow = port.status;
        ctrl.driver.reset_port(number)?;
        log::debug!("roothub: port {} reset", number);
        let hold = ctrl.refs.hold();
        let timeout = self.config.reset_timeout_ms;
        self.sub_wait(SubRef::Port(hc, number), timeout, Some(hold))
    }

    fn port_set_address(&mut self, hc: HcId, number: u8) -> UsbResult<()> {
        let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::NotFound)?;
        let speed = ctrl.root_hub.port(number).ok_or(UsbError::NotFound)?.speed;
        let address = ctrl.addresses.alloc().ok_or(UsbError::NoAddress)?;
        let ep = ctrl.default_endpoint(speed);
        let hold = ctrl.refs.hold();

        let device = self.create_device(hc, number, address, speed).ok_or(UsbError::NotFound)?;
        if let Some(port) = self
            .controllers
            .get_mut(&hc)
            .and_then(|c| c.root_hub.port_mut(number))
        {
            port.device = Some(device);
        }
        log::debug!("roothub: port {} SET_ADDRESS {}", number, address);
        let urb = Urb::control_out(SetupPacket::set_address(address), Vec::new());
        let timeout = self.config.control_timeout_ms;
        self.sub_submit(
            SubRef::Port(hc, number),
            hc,
            ep,
            Some(device),
            urb,
            timeout,
            Some(hold),
        )?;
        Ok(())
    }

    /// Continuation of every port operation.
    pub(crate) fn port_continue(&mut self, hc: HcId, number: u8, result: SubResult) {
        let SubResult { outcome, hold: _hold } = result;
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        if ctrl.state != HcState::Working {
            return;
        }
        let step = match ctrl.root_hub.port(number).map(|p| p.state) {
            Some(PortState::Enumerating(step)) => step,
            state => {
                log::debug!("roothub: port {} stale continuation in {:?}", number, state);
                return;
            }
        };
        let (status, change) = match ctrl.driver.port_status(number) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("roothub: port {} status: {}", number, e);
                return self.port_failed(hc, number, step.phase(), UrbStatus::Error);
            }
        };
        if let Some(port) = ctrl.root_hub.port_mut(number) {
            port.status = status;
        }
        if !status.contains(PortStatus::CONNECTION) {
            return self.port_disconnected(hc, number, step);
        }

        match (step, outcome) {
            (EnumStep::WaitRestart, SubOutcome::Elapsed) => self.port_enter(hc, number, EnumStep::WaitReset),
            (EnumStep::WaitReset, SubOutcome::Elapsed) => {
                if change.contains(PortChange::RESET) {
                    if let Err(e) = ctrl.driver.clear_port_change(number, PortChange::RESET) {
                        log::warn!("roothub: port {} clear reset change: {}", number, e);
                    }
                }
                if status.contains(PortStatus::RESET) || !status.contains(PortStatus::ENABLE) {
                    log::warn!("roothub: port {} reset did not complete ({:?})", number, status);
                    return self.port_failed(hc, number, EnumPhase::PortReset, UrbStatus::Timeout);
                }
                let speed = status.speed();
                if let Some(port) = ctrl.root_hub.port_mut(number) {
                    port.speed = speed;
                }
                log::info!("roothub: port {} enabled, {:?} speed", number, speed);
                self.port_enter(hc, number, EnumStep::Res);
            }
            (EnumStep::WaitSettle, SubOutcome::Elapsed) => {
                if !status.contains(PortStatus::ENABLE) {
                    return self.port_failed(hc, number, EnumPhase::PortReset, UrbStatus::Error);
                }
                self.port_enter(hc, number, EnumStep::WaitSetAddress);
            }
            (EnumStep::WaitSetAddress, SubOutcome::Request(urb)) => {
                let status = urb.status.unwrap_or(UrbStatus::Error);
                if !status.is_success() {
                    log::warn!("roothub: port {} SET_ADDRESS failed: {:?}", number, status);
                    return self.port_failed(hc, number, EnumPhase::SetAddress, status);
                }
                self.port_enter(hc, number, EnumStep::WaitAddress);
            }
            (EnumStep::WaitAddress, SubOutcome::Elapsed) => {
                if !status.contains(PortStatus::ENABLE) {
                    return self.port_failed(hc, number, EnumPhase::SetAddress, UrbStatus::Error);
                }
                self.port_addressed(hc, number);
            }
            (step, outcome) => {
                log::warn!("roothub: port {} unexpected {:?} in {:?}", number, outcome, step);
            }
        }
    }

    /// The device answers at its new address: open its default pipe, give
    /// the port up to `Enabled` and hand the device to configuration.
    fn port_addressed(&mut self, hc: HcId, number: u8) {
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        let Some(device) = ctrl.root_hub.port(number).and_then(|p| p.device) else {
            return self.port_failed(hc, number, EnumPhase::SetAddress, UrbStatus::Error);
        };
        let Some(dev) = self.devices.get_mut(&device) else {
            return self.port_failed(hc, number, EnumPhase::SetAddress, UrbStatus::Error);
        };
        let params = EndpointParams::control(dev.address, 8, dev.speed);
        match ctrl.driver.add_endpoint(&params) {
            Ok(ep) => {
                dev.ep0 = Some(ep);
                dev.ep0_mps = 8;
            }
            Err(e) => {
                log::warn!("roothub: port {} open default pipe: {}", number, e);
                return self.port_failed(hc, number, EnumPhase::SetAddress, UrbStatus::from(e));
            }
        }
        let address = dev.address;
        if let Some(port) = ctrl.root_hub.port_mut(number) {
            port.state = PortState::Enabled;
            port.retries = 0;
        }
        ctrl.active_port_reset.release(number);
        log::info!("roothub: port {} device {:?} at address {}", number, device, address);

        self.start_device_enumeration(device);
        self.schedule_scan(hc, 0);
    }

    /// Count a failed attempt; restart the port or give up on it.
    fn port_failed(&mut self, hc: HcId, number: u8, phase: EnumPhase, status: UrbStatus) {
        let Some(port) = self
            .controllers
            .get_mut(&hc)
            .and_then(|c| c.root_hub.port_mut(number))
        else {
            return;
        };
        let device = port.device.take();
        port.retries = port.retries.saturating_add(1);
        let retries = port.retries;
        if let Some(device) = device {
            self.remove_device(device);
        }
        let stop = retries > self.config.enum_retries;
        self.report_enum_error(&EnumErrorReport {
            hc,
            port: number,
            phase,
            status,
            retry: !stop,
            stop,
            disconnect: false,
        });

        if !stop {
            log::debug!("roothub: port {} retry {} after {:?}", number, retries, status);
            return self.port_enter(hc, number, EnumStep::Restart);
        }

        log::warn!("roothub: port {} gave up after {} attempts", number, retries);
        self.stats.failed_enumerations += 1;
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        if let Some(port) = ctrl.root_hub.port_mut(number) {
            port.state = PortState::Error;
        }
        if let Err(e) = ctrl.driver.disable_port(number) {
            log::warn!("roothub: port {} disable: {}", number, e);
        }
        self.release_reset_token(hc, number);
    }

    fn port_disconnected(&mut self, hc: HcId, number: u8, step: EnumStep) {
        log::info!("roothub: port {} disconnect during {:?}", number, step);
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        let Some(port) = ctrl.root_hub.port_mut(number) else {
            return;
        };
        port.state = PortState::Removed;
        port.retries = 0;
        let device = port.device.take();
        if let Err(e) = ctrl.driver.disable_port(number) {
            log::warn!("roothub: port {} disable: {}", number, e);
        }
        if let Some(device) = device {
            self.remove_device(device);
        }
        self.report_enum_error(&EnumErrorReport {
            hc,
            port: number,
            phase: step.phase(),
            status: UrbStatus::DeviceRemoved,
            retry: false,
            stop: true,
            disconnect: true,
        });
        self.release_reset_token(hc, number);
    }

    fn release_reset_token(&mut self, hc: HcId, number: u8) {
        let Some(ctrl) = self.controllers.get_mut(&hc) else {
            return;
        };
        if ctrl.active_port_reset.release(number) {
            self.schedule_scan(hc, 0);
        }
    }
}
