//! Host controller driver contract.
//!
//! The bus core talks to hardware only through [`HostControllerDriver`].
//! OHCI is one implementation; any other controller type can sit behind the
//! same trait. Ports are numbered from 1.

use alloc::vec::Vec;

use crate::descriptor::{EndpointType, UsbSpeed};
use crate::error::{UrbStatus, UsbResult};
use crate::urb::{Urb, UrbId};

/// Driver-side endpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpHandle(pub u32);

/// What the driver needs to open a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointParams {
    pub device_address: u8,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    pub speed: UsbSpeed,
    /// Polling interval in frames (interrupt endpoints)
    pub interval: u8,
}

impl EndpointParams {
    /// Default control pipe of a device.
    pub fn control(device_address: u8, max_packet_size: u16, speed: UsbSpeed) -> Self {
        Self {
            device_address,
            endpoint: 0,
            kind: EndpointType::Control,
            max_packet_size,
            speed,
            interval: 0,
        }
    }

    pub fn number(&self) -> u8 {
        self.endpoint & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.endpoint & 0x80 != 0
    }
}

/// Controller power/operational state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcState {
    Working,
    Suspended,
    Removed,
}

/// Target of a port power request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTarget {
    /// Every port (ganged switching)
    All,
    Port(u8),
}

bitflags::bitflags! {
    /// Port status, hub class layout (wPortStatus)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
    }
}

bitflags::bitflags! {
    /// Port change bits (wPortChange)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChange: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubStatus: u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HubChange: u16 {
        const LOCAL_POWER = 1 << 0;
        const OVER_CURRENT = 1 << 1;
    }
}

impl PortStatus {
    pub fn speed(&self) -> UsbSpeed {
        if self.contains(PortStatus::LOW_SPEED) {
            UsbSpeed::Low
        } else if self.contains(PortStatus::HIGH_SPEED) {
            UsbSpeed::High
        } else {
            UsbSpeed::Full
        }
    }
}

/// A finished request as reported by the driver
#[derive(Debug, Clone)]
pub struct Completed {
    pub urb: UrbId,
    pub status: UrbStatus,
    pub actual_length: usize,
    /// Received bytes for IN transfers; empty for OUT
    pub data: Vec<u8>,
}

/// Operations the bus core needs from a host controller.
///
/// Every call is made from the bus task. `submit_request` returning `Ok`
/// means "pending": exactly one [`Completed`] for that id will later be
/// returned from [`take_completions`](Self::take_completions).
pub trait HostControllerDriver {
    fn name(&self) -> &str;

    /// Bring the controller to the operational state.
    fn start(&mut self) -> UsbResult<()>;

    fn add_endpoint(&mut self, params: &EndpointParams) -> UsbResult<EpHandle>;
    /// Outstanding requests on the endpoint complete as `Cancelled`.
    fn release_endpoint(&mut self, ep: EpHandle);

    fn submit_request(&mut self, ep: EpHandle, id: UrbId, urb: &Urb) -> UsbResult<()>;
    /// Stop the endpoint and complete everything queued on it as `Cancelled`.
    fn abort_endpoint(&mut self, ep: EpHandle);
    /// Clear halt and data toggle.
    fn reset_endpoint(&mut self, ep: EpHandle) -> UsbResult<()>;

    fn set_state(&mut self, state: HcState) -> UsbResult<()>;

    fn reset_port(&mut self, port: u8) -> UsbResult<()>;
    fn set_port_power(&mut self, target: PowerTarget, on: bool) -> UsbResult<()>;
    fn port_status(&self, port: u8) -> UsbResult<(PortStatus, PortChange)>;
    fn clear_port_change(&mut self, port: u8, change: PortChange) -> UsbResult<()>;
    fn disable_port(&mut self, port: u8) -> UsbResult<()>;
    fn hub_status(&self) -> (HubStatus, HubChange);
    fn clear_hub_change(&mut self, change: HubChange);
    fn port_count(&self) -> u8;
    /// Power-on to power-good time of the root hub ports.
    fn power_good_time_ms(&self) -> u32;

    /// Handle a raised interrupt. Returns true when root hub status changed.
    fn service_interrupt(&mut self) -> bool;
    /// Whether deferred work is waiting for the next frame.
    fn needs_frame_tick(&self) -> bool;
    /// Called roughly once per frame while `needs_frame_tick` holds.
    fn frame_tick(&mut self);
    /// Move finished requests into `out`.
    fn take_completions(&mut self, out: &mut Vec<Completed>);
}
