//! Error and request status codes.

use core::fmt;

/// Errors returned by host core calls.
///
/// Resource exhaustion (`NoMemory`, `NoAddress`) is always recoverable by the
/// caller; nothing in the core treats it as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Descriptor pool or DMA memory exhausted
    NoMemory,
    /// Unknown controller, device, interface, endpoint or handle
    NotFound,
    /// Argument out of range or operation invalid in the current state
    Invalid,
    /// The slot is already running an operation
    Busy,
    NotSupported,
    Timeout,
    /// Target device was removed (possibly with requests in flight)
    DeviceRemoved,
    ControllerRemoved,
    /// All 127 device addresses are in use
    NoAddress,
    /// Controller did not behave as the OHCI specification requires
    Hardware,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UsbError::NoMemory => "out of descriptor memory",
            UsbError::NotFound => "not found",
            UsbError::Invalid => "invalid argument or state",
            UsbError::Busy => "busy",
            UsbError::NotSupported => "not supported",
            UsbError::Timeout => "timed out",
            UsbError::DeviceRemoved => "device removed",
            UsbError::ControllerRemoved => "host controller removed",
            UsbError::NoAddress => "no free device address",
            UsbError::Hardware => "host controller hardware error",
        };
        f.write_str(msg)
    }
}

pub type UsbResult<T> = core::result::Result<T, UsbError>;

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbStatus {
    Success,
    Crc,
    BitStuffing,
    DataToggle,
    Stall,
    NotResponding,
    PidCheck,
    UnexpectedPid,
    DataOverrun,
    BufferOverrun,
    BufferUnderrun,
    /// The request did not finish before its SubState timer fired
    Timeout,
    /// Aborted on behalf of the caller
    Cancelled,
    /// The device disappeared while the request was outstanding
    DeviceRemoved,
    /// Any other controller-reported failure
    Error,
}

impl UrbStatus {
    pub fn is_success(self) -> bool {
        self == UrbStatus::Success
    }

    /// Errors raised on the wire; these trigger bounded retry during enumeration.
    pub fn is_transport_error(self) -> bool {
        matches!(
            self,
            UrbStatus::Crc
                | UrbStatus::BitStuffing
                | UrbStatus::DataToggle
                | UrbStatus::Stall
                | UrbStatus::NotResponding
                | UrbStatus::PidCheck
                | UrbStatus::UnexpectedPid
                | UrbStatus::DataOverrun
                | UrbStatus::BufferOverrun
                | UrbStatus::BufferUnderrun
                | UrbStatus::Timeout
        )
    }
}

impl From<UsbError> for UrbStatus {
    fn from(err: UsbError) -> Self {
        match err {
            UsbError::Timeout => UrbStatus::Timeout,
            UsbError::DeviceRemoved => UrbStatus::DeviceRemoved,
            _ => UrbStatus::Error,
        }
    }
}
