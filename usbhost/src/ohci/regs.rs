//! OHCI operational registers (OHCI 1.0a, chapter 7).

use core::ptr::{read_volatile, write_volatile};

// =============================================================================
// Register offsets
// =============================================================================

pub const HC_REVISION: u32 = 0x00;
pub const HC_CONTROL: u32 = 0x04;
pub const HC_COMMAND_STATUS: u32 = 0x08;
pub const HC_INTERRUPT_STATUS: u32 = 0x0C;
pub const HC_INTERRUPT_ENABLE: u32 = 0x10;
pub const HC_INTERRUPT_DISABLE: u32 = 0x14;
pub const HC_HCCA: u32 = 0x18;
pub const HC_PERIOD_CURRENT_ED: u32 = 0x1C;
pub const HC_CONTROL_HEAD_ED: u32 = 0x20;
pub const HC_CONTROL_CURRENT_ED: u32 = 0x24;
pub const HC_BULK_HEAD_ED: u32 = 0x28;
pub const HC_BULK_CURRENT_ED: u32 = 0x2C;
pub const HC_DONE_HEAD: u32 = 0x30;
pub const HC_FM_INTERVAL: u32 = 0x34;
pub const HC_FM_REMAINING: u32 = 0x38;
pub const HC_FM_NUMBER: u32 = 0x3C;
pub const HC_PERIODIC_START: u32 = 0x40;
pub const HC_LS_THRESHOLD: u32 = 0x44;
pub const HC_RH_DESCRIPTOR_A: u32 = 0x48;
pub const HC_RH_DESCRIPTOR_B: u32 = 0x4C;
pub const HC_RH_STATUS: u32 = 0x50;
/// First root hub port; port `n` (1-based) is at `+ (n - 1) * 4`
pub const HC_RH_PORT_STATUS: u32 = 0x54;

pub const fn port_reg(port: u8) -> u32 {
    HC_RH_PORT_STATUS + (port as u32 - 1) * 4
}

// HcControl
pub const CTRL_CBSR_MASK: u32 = 3 << 0;
pub const CTRL_PLE: u32 = 1 << 2;
pub const CTRL_IE: u32 = 1 << 3;
pub const CTRL_CLE: u32 = 1 << 4;
pub const CTRL_BLE: u32 = 1 << 5;
pub const CTRL_HCFS_MASK: u32 = 3 << 6;
pub const CTRL_HCFS_RESET: u32 = 0 << 6;
pub const CTRL_HCFS_RESUME: u32 = 1 << 6;
pub const CTRL_HCFS_OPERATIONAL: u32 = 2 << 6;
pub const CTRL_HCFS_SUSPEND: u32 = 3 << 6;
pub const CTRL_IR: u32 = 1 << 8;

// HcCommandStatus
pub const CMD_HCR: u32 = 1 << 0;
pub const CMD_CLF: u32 = 1 << 1;
pub const CMD_BLF: u32 = 1 << 2;
pub const CMD_OCR: u32 = 1 << 3;

// HcInterruptStatus / Enable / Disable
pub const INT_SO: u32 = 1 << 0;
pub const INT_WDH: u32 = 1 << 1;
pub const INT_SF: u32 = 1 << 2;
pub const INT_RD: u32 = 1 << 3;
pub const INT_UE: u32 = 1 << 4;
pub const INT_FNO: u32 = 1 << 5;
pub const INT_RHSC: u32 = 1 << 6;
pub const INT_OC: u32 = 1 << 30;
pub const INT_MIE: u32 = 1 << 31;

// HcFmInterval
pub const FM_FI_MASK: u32 = 0x3FFF;
pub const FM_FIT: u32 = 1 << 31;
/// 11999 bit times per frame
pub const FM_FI_DEFAULT: u32 = 0x2EDF;

// HcRhDescriptorA
pub const RH_A_NDP_MASK: u32 = 0xFF;
/// Power switching mode: 1 = per port
pub const RH_A_PSM: u32 = 1 << 8;
/// No power switching: ports always powered
pub const RH_A_NPS: u32 = 1 << 9;
pub const RH_A_POTPGT_SHIFT: u32 = 24;

// HcRhDescriptorB: port power control mask starts at bit 17 for port 1
pub const RH_B_PPCM_SHIFT: u32 = 16;

// HcRhStatus
/// Read: local power status. Write: clear global power
pub const RH_HS_LPS: u32 = 1 << 0;
pub const RH_HS_OCI: u32 = 1 << 1;
/// Read: local power status change. Write: set global power
pub const RH_HS_LPSC: u32 = 1 << 16;
pub const RH_HS_OCIC: u32 = 1 << 17;

// HcRhPortStatus, read side
pub const RH_PS_CCS: u32 = 1 << 0;
pub const RH_PS_PES: u32 = 1 << 1;
pub const RH_PS_PSS: u32 = 1 << 2;
pub const RH_PS_POCI: u32 = 1 << 3;
pub const RH_PS_PRS: u32 = 1 << 4;
pub const RH_PS_PPS: u32 = 1 << 8;
pub const RH_PS_LSDA: u32 = 1 << 9;
pub const RH_PS_CSC: u32 = 1 << 16;
pub const RH_PS_PESC: u32 = 1 << 17;
pub const RH_PS_PSSC: u32 = 1 << 18;
pub const RH_PS_OCIC: u32 = 1 << 19;
pub const RH_PS_PRSC: u32 = 1 << 20;

// HcRhPortStatus, write side (same bits, different meaning)
/// Clear port enable
pub const RH_PS_CPE: u32 = 1 << 0;
pub const RH_PS_SPE: u32 = 1 << 1;
pub const RH_PS_SPS: u32 = 1 << 2;
/// Clear suspend status
pub const RH_PS_CSS: u32 = 1 << 3;
pub const RH_PS_SPR: u32 = 1 << 4;
pub const RH_PS_SPP: u32 = 1 << 8;
pub const RH_PS_CPP: u32 = 1 << 9;

/// 32-bit register window of one controller.
pub trait OhciRegisters {
    fn read(&self, offset: u32) -> u32;
    fn write(&mut self, offset: u32, value: u32);
}

/// Memory-mapped register window.
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the mapped, uncached register window of an OHCI
    /// controller, valid for the lifetime of this value.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl OhciRegisters for MmioRegisters {
    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `new` requires a valid register window.
        unsafe { read_volatile((self.base + offset as usize) as *const u32) }
    }

    fn write(&mut self, offset: u32, value: u32) {
        // SAFETY: `new` requires a valid register window.
        unsafe { write_volatile((self.base + offset as usize) as *mut u32, value) }
    }
}
