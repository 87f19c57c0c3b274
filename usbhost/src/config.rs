//! Start-up configuration of the host core.

/// Root hub power switching policy.
///
/// Chosen once when the controller is added; nothing branches on it per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSwitching {
    /// Ports are powered whenever the controller is (no switching)
    AlwaysOn,
    /// All ports switched together through the hub power control
    Ganged,
    /// Each port switched individually
    PerPort,
}

/// Bus driver timing and retry parameters. Times are in milliseconds.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub power_switching: PowerSwitching,
    /// Failed enumeration attempts tolerated before a port enters `Error`
    pub enum_retries: u8,
    /// Delay before a failed port is reset again
    pub restart_delay_ms: u32,
    /// Time allowed for a port reset to report completion
    pub reset_timeout_ms: u32,
    /// Recovery time after reset before the first request
    pub reset_settle_ms: u32,
    /// Recovery time after SET_ADDRESS
    pub address_settle_ms: u32,
    /// Timeout of each enumeration control request
    pub control_timeout_ms: u32,
    /// Delay of the deferred PnP notification timer
    pub pnp_dispatch_delay_ms: u32,
    /// One frame; deferred descriptor returns wait at least this long
    pub frame_ms: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            power_switching: PowerSwitching::PerPort,
            enum_retries: 3,
            restart_delay_ms: 1000,
            reset_timeout_ms: 50,
            reset_settle_ms: 20,
            address_settle_ms: 10,
            control_timeout_ms: 500,
            pnp_dispatch_delay_ms: 1,
            frame_ms: 1,
        }
    }
}
