//! USB 2.0 protocol types: speeds, setup packets and standard descriptors.

use alloc::vec::Vec;

use crate::error::{UsbError, UsbResult};

/// Bus speed of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,  // 1.5 Mbps
    Full, // 12 Mbps
    High, // 480 Mbps
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out, // Host -> Device
    In,  // Device -> Host
}

/// Standard requests
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum StandardRequest {
    GetStatus = 0,
    ClearFeature = 1,
    SetFeature = 3,
    SetAddress = 5,
    GetDescriptor = 6,
    GetConfiguration = 8,
    SetConfiguration = 9,
    GetInterface = 10,
    SetInterface = 11,
}

/// Descriptor types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
}

/// Common class codes
pub mod class {
    pub const INTERFACE_CLASS: u8 = 0x00;
    pub const AUDIO: u8 = 0x01;
    pub const CDC: u8 = 0x02;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
    pub const CDC_DATA: u8 = 0x0A;
    pub const VENDOR: u8 = 0xFF;
}

/// Setup packet (8 bytes on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn get_descriptor(desc_type: DescriptorType, index: u8, length: u16) -> Self {
        Self {
            request_type: 0x80, // Device to Host, Standard, Device
            request: StandardRequest::GetDescriptor as u8,
            value: ((desc_type as u16) << 8) | (index as u16),
            index: 0,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        Self {
            request_type: 0x00, // Host to Device, Standard, Device
            request: StandardRequest::SetAddress as u8,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(config: u8) -> Self {
        Self {
            request_type: 0x00,
            request: StandardRequest::SetConfiguration as u8,
            value: config as u16,
            index: 0,
            length: 0,
        }
    }

    /// Data stage direction
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(b: &[u8; 8]) -> Self {
        Self {
            request_type: b[0],
            request: b[1],
            value: u16::from_le_bytes([b[2], b[3]]),
            index: u16::from_le_bytes([b[4], b[5]]),
            length: u16::from_le_bytes([b[6], b[7]]),
        }
    }
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

/// Device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;

    pub fn parse(b: &[u8]) -> UsbResult<Self> {
        if b.len() < Self::LENGTH || b[1] != DescriptorType::Device as u8 {
            return Err(UsbError::Invalid);
        }
        Ok(Self {
            usb_version: le16(b, 2),
            device_class: b[4],
            device_subclass: b[5],
            device_protocol: b[6],
            max_packet_size0: b[7],
            vendor_id: le16(b, 8),
            product_id: le16(b, 10),
            device_version: le16(b, 12),
            manufacturer_index: b[14],
            product_index: b[15],
            serial_index: b[16],
            num_configurations: b[17],
        })
    }

    /// bMaxPacketSize0 from the first 8 bytes, which is all a device is
    /// guaranteed to return before its EP0 packet size is known.
    pub fn parse_max_packet_size0(b: &[u8]) -> UsbResult<u8> {
        if b.len() < 8 || b[1] != DescriptorType::Device as u8 {
            return Err(UsbError::Invalid);
        }
        match b[7] {
            8 | 16 | 32 | 64 => Ok(b[7]),
            _ => Err(UsbError::Invalid),
        }
    }
}

/// Configuration descriptor header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub const LENGTH: usize = 9;

    pub fn parse(b: &[u8]) -> UsbResult<Self> {
        if b.len() < Self::LENGTH || b[1] != DescriptorType::Configuration as u8 {
            return Err(UsbError::Invalid);
        }
        let total_length = le16(b, 2);
        if (total_length as usize) < Self::LENGTH {
            return Err(UsbError::Invalid);
        }
        Ok(Self {
            total_length,
            num_interfaces: b[4],
            configuration_value: b[5],
            configuration_index: b[6],
            attributes: b[7],
            max_power: b[8],
        })
    }
}

/// Interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn endpoint_number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn direction(&self) -> Direction {
        if self.endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn transfer_type(&self) -> EndpointType {
        match self.attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// One interface (alternate setting) with its endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// A parsed configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub descriptor: ConfigDescriptor,
    pub interfaces: Vec<InterfaceInfo>,
}

impl Configuration {
    /// Walk a full configuration descriptor set. Class-specific descriptors
    /// are skipped; endpoints attach to the interface that precedes them.
    pub fn parse(b: &[u8]) -> UsbResult<Self> {
        let descriptor = ConfigDescriptor::parse(b)?;
        let end = core::cmp::min(descriptor.total_length as usize, b.len());
        let mut interfaces: Vec<InterfaceInfo> = Vec::new();
        let mut pos = b[0] as usize;

        while pos + 2 <= end {
            let len = b[pos] as usize;
            if len < 2 || pos + len > end {
                log::warn!("usb: truncated descriptor at offset {} in configuration", pos);
                break;
            }
            let d = &b[pos..pos + len];
            match d[1] {
                t if t == DescriptorType::Interface as u8 && len >= 9 => {
                    interfaces.push(InterfaceInfo {
                        descriptor: InterfaceDescriptor {
                            interface_number: d[2],
                            alternate_setting: d[3],
                            num_endpoints: d[4],
                            interface_class: d[5],
                            interface_subclass: d[6],
                            interface_protocol: d[7],
                            interface_index: d[8],
                        },
                        endpoints: Vec::new(),
                    });
                }
                t if t == DescriptorType::Endpoint as u8 && len >= 7 => {
                    if let Some(iface) = interfaces.last_mut() {
                        iface.endpoints.push(EndpointDescriptor {
                            endpoint_address: d[2],
                            attributes: d[3],
                            max_packet_size: le16(d, 4) & 0x07FF,
                            interval: d[6],
                        });
                    }
                }
                _ => {}
            }
            pos += len;
        }

        Ok(Self {
            descriptor,
            interfaces,
        })
    }
}
