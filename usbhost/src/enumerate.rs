//! Device half of enumeration: descriptors, configuration, interfaces.
//!
//! Runs once per device, after the root hub gave it an address:
//!
//! 1. GET_DESCRIPTOR(device, 8) to learn bMaxPacketSize0, reopening EP0
//!    if it differs from 8
//! 2. GET_DESCRIPTOR(device, 18)
//! 3. GET_DESCRIPTOR(configuration, 9) for wTotalLength
//! 4. GET_DESCRIPTOR(configuration, wTotalLength)
//! 5. SET_CONFIGURATION with the first configuration
//!
//! then every alternate-setting-0 interface is registered with its pipes
//! open and PnP clients are told. A failed step leaves the device `Failed`;
//! it stays addressed until it is unplugged.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::bus::{DeviceId, Interface, InterfaceId, UsbHost};
use crate::descriptor::{
    ConfigDescriptor, Configuration, DescriptorType, DeviceDescriptor, EndpointType, SetupPacket,
};
use crate::error::{UrbStatus, UsbError, UsbResult};
use crate::hcd::{EndpointParams, EpHandle};
use crate::notify::{EnumErrorReport, EnumPhase};
use crate::substate::{SubOutcome, SubRef, SubResult};
use crate::urb::Urb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStep {
    MaxPacketSize,
    DeviceDescriptor,
    ConfigHeader,
    Configuration,
    SetConfiguration,
}

impl DeviceStep {
    fn phase(self) -> EnumPhase {
        match self {
            DeviceStep::MaxPacketSize => EnumPhase::MaxPacketSize,
            DeviceStep::DeviceDescriptor => EnumPhase::DeviceDescriptor,
            DeviceStep::ConfigHeader | DeviceStep::Configuration => EnumPhase::ConfigDescriptor,
            DeviceStep::SetConfiguration => EnumPhase::SetConfiguration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// SET_ADDRESS in progress
    Addressing,
    Enumerating(DeviceStep),
    Configured,
    Failed,
    Removed,
}

impl UsbHost {
    pub(crate) fn start_device_enumeration(&mut self, device: DeviceId) {
        let setup = SetupPacket::get_descriptor(DescriptorType::Device, 0, 8);
        self.device_request(device, DeviceStep::MaxPacketSize, Urb::control_in(setup));
    }

    fn device_request(&mut self, device: DeviceId, step: DeviceStep, urb: Urb) {
        let Some(dev) = self.devices.get_mut(&device) else {
            return;
        };
        dev.state = DeviceState::Enumerating(step);
        let hc = dev.hc;
        let hold = dev.refs.hold();
        let Some(ep) = dev.ep0 else {
            return self.device_failed(device, step, UrbStatus::Error);
        };
        let timeout = self.config.control_timeout_ms;
        if let Err(e) = self.sub_submit(SubRef::Device(device), hc, ep, Some(device), urb, timeout, Some(hold)) {
            log::warn!("usb: device {:?} {:?} submit: {}", device, step, e);
            self.device_failed(device, step, UrbStatus::from(e));
        }
    }

    pub(crate) fn device_continue(&mut self, device: DeviceId, result: SubResult) {
        let SubResult { outcome, hold: _hold } = result;
        let step = match self.devices.get(&device).map(|d| d.state) {
            Some(DeviceState::Enumerating(step)) => step,
            _ => return,
        };
        let SubOutcome::Request(urb) = outcome else {
            log::warn!("usb: device {:?} woke without a request in {:?}", device, step);
            return;
        };
        let status = urb.status.unwrap_or(UrbStatus::Error);
        if !status.is_success() {
            log::warn!("usb: device {:?} {:?} failed: {:?}", device, step, status);
            return self.device_failed(device, step, status);
        }
        if let Err(e) = self.device_step(device, step, &urb) {
            log::warn!("usb: device {:?} {:?}: {}", device, step, e);
            self.device_failed(device, step, UrbStatus::from(e));
        }
    }

    fn device_step(&mut self, device: DeviceId, step: DeviceStep, urb: &Urb) -> UsbResult<()> {
        match step {
            DeviceStep::MaxPacketSize => {
                let mps = DeviceDescriptor::parse_max_packet_size0(urb.data())?;
                self.reopen_ep0(device, mps as u16)?;
                let setup = SetupPacket::get_descriptor(DescriptorType::Device, 0, DeviceDescriptor::LENGTH as u16);
                self.device_request(device, DeviceStep::DeviceDescriptor, Urb::control_in(setup));
            }
            DeviceStep::DeviceDescriptor => {
                let descriptor = DeviceDescriptor::parse(urb.data())?;
                if descriptor.num_configurations == 0 {
                    return Err(UsbError::Invalid);
                }
                let dev = self.devices.get_mut(&device).ok_or(UsbError::NotFound)?;
                dev.descriptor = Some(descriptor);
                let setup = SetupPacket::get_descriptor(DescriptorType::Configuration, 0, ConfigDescriptor::LENGTH as u16);
                self.device_request(device, DeviceStep::ConfigHeader, Urb::control_in(setup));
            }
            DeviceStep::ConfigHeader => {
                let header = ConfigDescriptor::parse(urb.data())?;
                let setup = SetupPacket::get_descriptor(DescriptorType::Configuration, 0, header.total_length);
                self.device_request(device, DeviceStep::Configuration, Urb::control_in(setup));
            }
            DeviceStep::Configuration => {
                let configuration = Configuration::parse(urb.data())?;
                let value = configuration.descriptor.configuration_value;
                let dev = self.devices.get_mut(&device).ok_or(UsbError::NotFound)?;
                dev.configuration = Some(configuration);
                let setup = SetupPacket::set_configuration(value);
                self.device_request(device, DeviceStep::SetConfiguration, Urb::control_out(setup, Vec::new()));
            }
            DeviceStep::SetConfiguration => self.device_configured(device)?,
        }
        Ok(())
    }

    /// Move EP0 to the packet size the device reported.
    fn reopen_ep0(&mut self, device: DeviceId, mps: u16) -> UsbResult<()> {
        let dev = self.devices.get_mut(&device).ok_or(UsbError::NotFound)?;
        if dev.ep0_mps == mps && dev.ep0.is_some() {
            return Ok(());
        }
        let ctrl = self.controllers.get_mut(&dev.hc).ok_or(UsbError::NotFound)?;
        if let Some(old) = dev.ep0.take() {
            ctrl.driver.release_endpoint(old);
        }
        let ep = ctrl
            .driver
            .add_endpoint(&EndpointParams::control(dev.address, mps, dev.speed))?;
        dev.ep0 = Some(ep);
        dev.ep0_mps = mps;
        log::debug!("usb: device {:?} EP0 max packet size {}", device, mps);
        let hc = dev.hc;
        self.arm_frame_tick(hc);
        Ok(())
    }

    fn device_configured(&mut self, device: DeviceId) -> UsbResult<()> {
        let dev = self.devices.get(&device).ok_or(UsbError::NotFound)?;
        let configuration = dev.configuration.clone().ok_or(UsbError::Invalid)?;
        let (hc, address, speed) = (dev.hc, dev.address, dev.speed);

        let mut created = Vec::new();
        for info in configuration
            .interfaces
            .iter()
            .filter(|i| i.descriptor.alternate_setting == 0)
        {
            let ctrl = self.controllers.get_mut(&hc).ok_or(UsbError::ControllerRemoved)?;
            let mut pipes: BTreeMap<u8, EpHandle> = BTreeMap::new();
            for ep in &info.endpoints {
                let kind = ep.transfer_type();
                if matches!(kind, EndpointType::Isochronous | EndpointType::Control) {
                    log::debug!(
                        "usb: device {:?} interface {} skips {:?} endpoint {:#04x}",
                        device,
                        info.descriptor.interface_number,
                        kind,
                        ep.endpoint_address
                    );
                    continue;
                }
                let params = EndpointParams {
                    device_address: address,
                    endpoint: ep.endpoint_address,
                    kind,
                    max_packet_size: ep.max_packet_size,
                    speed,
                    interval: ep.interval,
                };
                match ctrl.driver.add_endpoint(&params) {
                    Ok(handle) => {
                        pipes.insert(ep.endpoint_address, handle);
                    }
                    Err(e) => log::warn!(
                        "usb: device {:?} endpoint {:#04x} not opened: {}",
                        device,
                        ep.endpoint_address,
                        e
                    ),
                }
            }
            let id = InterfaceId(self.next_interface);
            self.next_interface += 1;
            self.interfaces.insert(
                id,
                Interface {
                    id,
                    device,
                    info: info.clone(),
                    pipes,
                },
            );
            created.push(id);
        }

        let dev = self.devices.get_mut(&device).ok_or(UsbError::NotFound)?;
        dev.interfaces = created.clone();
        dev.state = DeviceState::Configured;
        self.stats.total_enumerated += 1;
        self.stats.current_devices += 1;
        if let Some(d) = dev.descriptor {
            log::info!(
                "usb: device {:?} configured: {:04x}:{:04x} class {:#04x}, {} interface(s)",
                device,
                d.vendor_id,
                d.product_id,
                d.device_class,
                created.len()
            );
        }
        for id in created {
            self.queue_pnp_add(id);
        }
        Ok(())
    }

    fn device_failed(&mut self, device: DeviceId, step: DeviceStep, status: UrbStatus) {
        let Some(dev) = self.devices.get_mut(&device) else {
            return;
        };
        if dev.state == DeviceState::Removed {
            return;
        }
        dev.state = DeviceState::Failed;
        let (hc, port) = (dev.hc, dev.port);
        self.stats.failed_enumerations += 1;
        self.report_enum_error(&EnumErrorReport {
            hc,
            port,
            phase: step.phase(),
            status,
            retry: false,
            stop: true,
            disconnect: status == UrbStatus::DeviceRemoved,
        });
    }
}
