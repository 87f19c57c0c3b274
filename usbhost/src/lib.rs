//! USB host stack: an OHCI host controller driver and the bus driver core
//! that enumerates and serves devices behind any [`HostControllerDriver`].
//!
//! The core is single-threaded: [`UsbHost::poll`] runs every state machine,
//! timer and completion. Interrupt handlers only touch the
//! [`InterruptSignal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod config;
pub mod descriptor;
pub mod dma;
pub mod enumerate;
pub mod error;
pub mod hcd;
pub mod notify;
pub mod ohci;
pub mod pool;
pub mod refcount;
pub mod roothub;
pub mod substate;
pub mod timer;
pub mod urb;

pub use bus::{Completion, DeviceId, HcId, InterfaceId, InterruptSignal, UsbHost, UsbStats};
pub use config::{HostConfig, PowerSwitching};
pub use enumerate::{DeviceState, DeviceStep};
pub use error::{UrbStatus, UsbError, UsbResult};
pub use hcd::{Completed, EndpointParams, EpHandle, HcState, HostControllerDriver};
pub use notify::{EnumErrorReport, EnumPhase, PnpEvent, PnpEventKind, PnpFilter, PnpHandle};
pub use ohci::{Ohci, OhciConfig};
pub use roothub::{EnumStep, PortState, ResetToken};
pub use urb::{Urb, UrbFunction, UrbId};
