//! Requests (URBs): the unit of asynchronous I/O.

use alloc::vec;
use alloc::vec::Vec;

use crate::descriptor::{Direction, SetupPacket};
use crate::error::UrbStatus;

/// Identifies a submitted request until its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UrbId(pub(crate) u32);

/// What a request asks the controller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrbFunction {
    Control(SetupPacket),
    Bulk,
    Interrupt,
    Isochronous { start_frame: u16 },
    /// Clear halt and data toggle of the endpoint
    ResetEndpoint,
    /// Cancel everything queued on the endpoint
    AbortEndpoint,
}

/// A request.
///
/// For IN transfers `buffer` is sized to the requested length on submit and
/// holds `actual_length` valid bytes on completion. For OUT transfers it
/// holds the data to send.
#[derive(Debug, Clone)]
pub struct Urb {
    pub function: UrbFunction,
    /// Endpoint address (number plus direction bit 0x80); 0 for the default pipe
    pub endpoint: u8,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
    /// `None` until the request completes
    pub status: Option<UrbStatus>,
}

impl Urb {
    fn new(function: UrbFunction, endpoint: u8, buffer: Vec<u8>) -> Self {
        Self {
            function,
            endpoint,
            buffer,
            actual_length: 0,
            status: None,
        }
    }

    /// Control transfer with an IN data stage of `setup.length` bytes
    pub fn control_in(setup: SetupPacket) -> Self {
        Self::new(UrbFunction::Control(setup), 0, vec![0; setup.length as usize])
    }

    /// Control transfer with an optional OUT data stage
    pub fn control_out(mut setup: SetupPacket, data: Vec<u8>) -> Self {
        setup.length = data.len() as u16;
        Self::new(UrbFunction::Control(setup), 0, data)
    }

    pub fn bulk_in(endpoint: u8, length: usize) -> Self {
        Self::new(UrbFunction::Bulk, endpoint | 0x80, vec![0; length])
    }

    pub fn bulk_out(endpoint: u8, data: Vec<u8>) -> Self {
        Self::new(UrbFunction::Bulk, endpoint & 0x0F, data)
    }

    pub fn interrupt_in(endpoint: u8, length: usize) -> Self {
        Self::new(UrbFunction::Interrupt, endpoint | 0x80, vec![0; length])
    }

    pub fn reset_endpoint(endpoint: u8) -> Self {
        Self::new(UrbFunction::ResetEndpoint, endpoint, Vec::new())
    }

    pub fn abort_endpoint(endpoint: u8) -> Self {
        Self::new(UrbFunction::AbortEndpoint, endpoint, Vec::new())
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> Direction {
        match self.function {
            UrbFunction::Control(setup) => setup.direction(),
            _ if self.endpoint & 0x80 != 0 => Direction::In,
            _ => Direction::Out,
        }
    }

    /// Bytes actually transferred.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(UrbStatus::Success)
    }
}
