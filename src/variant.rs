// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Register maps and fixed parameters of the SC1 and DCR1 hashing chips
//!
//! Both chips speak the same bus protocol. Everything that differs between them is
//! captured in a [`ChipVariant`] value which is selected once per string and then
//! carried by every component that talks to the chips.

use crate::error::{self, ErrorKind};

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Core address used to reach chip level registers (interrupt vector, engine done/busy)
pub const CHIP_REGISTER_CORE: usize = 0x80;

/// Maximum number of hash boards a controller can drive
pub const MAX_BOARDS: usize = 3;

/// Number of V registers (both variants)
pub const NUM_V_REGS: usize = 16;

/// Number of FIFO data registers in every core
pub const NUM_FIFO_REGS: usize = 8;

/// Number of cores sharing one oscillator
pub const CORES_PER_OSC_GROUP: usize = 16;

/// Each oscillator group register lives in the 8th core of its group
pub const OSC_GROUP_CORE_OFFSET: usize = 7;

/// Engine control register bits
pub mod ecr {
    pub const RESET_SPI_FSM: u64 = 0x01;
    pub const READ_COMPLETE: u64 = 0x02;
    pub const VALID_DATA: u64 = 0x04;
    pub const RESET_CORE: u64 = 0x08;
}

/// Engine status register bits
pub mod esr {
    pub const DONE: u64 = 0x01;
    pub const BUSY: u64 = 0x02;
    pub const CORE_STYLE_MASK: u64 = 0x0c;
    pub const CORE_REV_MASK: u64 = 0x70;
}

/// FIFO control register bits, 1 masks the nonce interrupt of the FIFO slot
pub mod fcr {
    pub const MASK_D0: u64 = 0x01;
    pub const MASK_ALL: u64 = 0xff;
}

/// Interrupt vector register layout
pub mod ivr {
    pub const INT_MASK: u64 = 0xff;
    pub const CORE_ID_POS: u32 = 8;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Sc1,
    Dcr1,
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Model::Sc1 => write!(f, "sc1"),
            Model::Dcr1 => write!(f, "dcr1"),
        }
    }
}

impl FromStr for Model {
    type Err = error::Error;

    fn from_str(s: &str) -> error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sc1" | "sc1a" => Ok(Model::Sc1),
            "dcr1" | "dcr1a" => Ok(Model::Dcr1),
            _ => Err(ErrorKind::Unsupported(format!("unknown chip model '{}'", s)))?,
        }
    }
}

/// Numeric addresses of the registers that are addressed symbolically by the driver
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegisterMap {
    /// V00, V01..V15 follow contiguously
    pub v00: u8,
    pub m0: u8,
    /// Number of M register indices including the reserved one
    pub m_count: usize,
    /// M register index that must never be written
    pub m_reserved: usize,
    /// Extra address offset applied to M register indices 10 and above
    pub m_high_offset: u8,
    pub v0_match: u8,
    pub v8_match: Option<u8>,
    pub fcr: u8,
    pub ub: u8,
    pub lb: u8,
    pub limits: u8,
    pub ecr: u8,
    pub step: Option<u8>,
    /// Oscillator control register, OCR-A on chips where it is split
    pub ocr: u8,
    /// Upper half of a split oscillator control register (OCR-B)
    pub ocr_high: Option<u8>,
    pub fdr0: u8,
    pub fsr: u8,
    pub esr: u8,
    /// Chip level engine done register(s), first of `engine_words`
    pub edr0: u8,
    /// Chip level engine busy register(s), first of `engine_words`
    pub ebr0: u8,
    pub engine_words: usize,
    pub ivr: u8,
}

impl RegisterMap {
    /// Bus address of M register `index` or `None` for the reserved index and indices past
    /// the end of the register file
    pub fn m_address(&self, index: usize) -> Option<u8> {
        if index == self.m_reserved || index >= self.m_count {
            return None;
        }
        let offset = if index >= 10 { self.m_high_offset } else { 0 };
        Some(self.m0 + index as u8 + offset)
    }

    /// Addresses of all writable M registers in ascending index order
    pub fn m_addresses(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        (0..self.m_count).filter_map(move |i| self.m_address(i).map(|addr| (i, addr)))
    }

    pub fn v_address(&self, index: usize) -> u8 {
        assert!(index < NUM_V_REGS, "BUG: V register {} out of range", index);
        self.v00 + index as u8
    }

    pub fn fdr_address(&self, index: usize) -> u8 {
        assert!(index < NUM_FIFO_REGS, "BUG: FIFO register {} out of range", index);
        self.fdr0 + index as u8
    }

    /// Core registers reporting engine state and found nonces (FIFO data, FSR, ESR)
    pub fn is_result_register(&self, register: u8) -> bool {
        (register >= self.fdr0 && register < self.fdr0 + NUM_FIFO_REGS as u8)
            || register == self.fsr
            || register == self.esr
    }
}

/// Values the datasheet prescribes for registers after reset
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegisterDefaults {
    pub limits: u64,
    pub step: Option<u64>,
    pub v: [u64; NUM_V_REGS],
    pub v0_match: u64,
    pub v8_match: Option<u64>,
}

/// Bit layout of the oscillator control register seen as one 64-bit value
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OscillatorLayout {
    pub div1: u64,
    pub div2: u64,
    pub div4: u64,
    pub div8: u64,
    pub div_mask: u64,
    /// First bit of the run that slows the oscillator down (negative bias)
    pub bias_slow_pos: u32,
    /// First bit of the run that speeds the oscillator up (positive bias)
    pub bias_fast_pos: u32,
    pub bias_mask: u64,
    /// Clock enable of the 16 cores in the addressed oscillator group
    pub core_enable: u64,
    pub core0: u64,
    /// Slowest setting used while the string is being brought up
    pub slow: u64,
    /// Setting of freshly enabled cores
    pub init: u64,
    /// Bit index where the value is split into OCR-A and OCR-B, if at all
    pub split_at: Option<u32>,
    /// Number of oscillator groups on the chip
    pub groups: usize,
}

impl OscillatorLayout {
    /// Clock enable bit of the last core in an oscillator group
    pub fn last_core_enable(&self) -> u64 {
        self.core0 << (CORES_PER_OSC_GROUP - 1)
    }

    /// Split a combined value into the halves written to OCR-A and OCR-B
    pub fn split(&self, value: u64) -> (u64, Option<u64>) {
        match self.split_at {
            Some(bits) => (value & ((1u64 << bits) - 1), Some(value >> bits)),
            None => (value, None),
        }
    }

    /// Inverse of [`split`](Self::split)
    pub fn join(&self, low: u64, high: Option<u64>) -> u64 {
        match self.split_at {
            Some(bits) => low | (high.unwrap_or(0) << bits),
            None => low,
        }
    }
}

/// Everything that makes SC1 and DCR1 different from the driver point of view
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChipVariant {
    pub model: Model,
    pub name: &'static str,
    /// Register data width in bytes
    pub data_bytes: usize,
    pub cores: usize,
    pub chips: usize,
    /// Read erratum of early silicon: read addresses go out shifted left and read data
    /// comes back shifted left by this amount
    pub read_shift: u32,
    pub regs: RegisterMap,
    pub defaults: RegisterDefaults,
    pub osc: OscillatorLayout,
    /// Core ID field of the interrupt vector register
    pub ivr_core_mask: u64,
    /// Pattern used by the M register write/read-back check
    pub m_check_pattern: u64,
    /// Settle time after engine reset during device initialization
    pub reset_settle: Duration,
}

const COMMON_OSC: OscillatorLayout = OscillatorLayout {
    div1: 0x40,
    div2: 0x20,
    div4: 0x10,
    div8: 0x08,
    div_mask: 0x78,
    bias_slow_pos: 23,
    bias_fast_pos: 28,
    bias_mask: 0x0000_0001_ff80_0000,
    core_enable: 0x007f_ff80,
    core0: 0x80,
    slow: 0x0f80_0000 | 0x08,
    init: 0x08,
    split_at: None,
    groups: 4,
};

pub const SC1: ChipVariant = ChipVariant {
    model: Model::Sc1,
    name: "SC1A",
    data_bytes: 8,
    cores: 64,
    chips: 15,
    read_shift: 0,
    regs: RegisterMap {
        v00: 0x00,
        m0: 0x10,
        m_count: 10,
        m_reserved: 4,
        m_high_offset: 0,
        v0_match: 0x1a,
        v8_match: Some(0x1b),
        fcr: 0x1c,
        ub: 0x1d,
        lb: 0x1e,
        limits: 0x1f,
        ecr: 0x20,
        step: Some(0x21),
        ocr: 0x2f,
        ocr_high: None,
        fdr0: 0x40,
        fsr: 0x4b,
        esr: 0x4e,
        edr0: 0x40,
        ebr0: 0x41,
        engine_words: 1,
        ivr: 0x42,
    },
    defaults: RegisterDefaults {
        limits: 0x31,
        step: Some(0x3f1),
        v: [
            0x6A09E667F2BDC928,
            0xBB67AE8584CAA73B,
            0x3C6EF372FE94F82B,
            0xA54FF53A5F1D36F1,
            0x510E527FADE682D1,
            0x9B05688C2B3E6C1F,
            0x1F83D9ABFB41BD6B,
            0x5BE0CD19137E2179,
            0x6A09E667F3BCC908,
            0xBB67AE8584CAA73B,
            0x3C6EF372FE94F82B,
            0xA54FF53A5F1D36F1,
            0x510E527FADE68281,
            0x9B05688C2B3E6C1F,
            0xE07C265404BE4294,
            0x5BE0CD19137E2179,
        ],
        v0_match: 0x6A09E667F2BDC928,
        v8_match: Some(0x0000_00FF_FFFF_FFFF),
    },
    osc: COMMON_OSC,
    ivr_core_mask: 0x3f00,
    m_check_pattern: 0x55AA_CC99_F00F_6688,
    reset_settle: Duration::from_millis(20),
};

pub const DCR1: ChipVariant = ChipVariant {
    model: Model::Dcr1,
    name: "DCR1A",
    data_bytes: 4,
    cores: 128,
    chips: 15,
    read_shift: 0,
    regs: RegisterMap {
        v00: 0x00,
        m0: 0x10,
        m_count: 13,
        m_reserved: 3,
        m_high_offset: 0x21 - 0x1a,
        v0_match: 0x1a,
        v8_match: None,
        fcr: 0x1c,
        ub: 0x1d,
        lb: 0x1e,
        limits: 0x1f,
        ecr: 0x20,
        step: None,
        ocr: 0x2f,
        ocr_high: Some(0x2e),
        fdr0: 0x40,
        fsr: 0x4b,
        esr: 0x4e,
        edr0: 0x40,
        ebr0: 0x44,
        engine_words: 4,
        ivr: 0x48,
    },
    defaults: RegisterDefaults {
        limits: 0x38,
        step: None,
        v: [
            0x51F87D90, 0x660D07D4, 0xA697C2B7, 0xC52BB4EF, 0xBB2C0B5E, 0x41B8CB4C, 0x9254A116,
            0xE2B2CC34, 0x243F6A88, 0x85A308D3, 0x13198A2E, 0x03707344, 0xA4093D82, 0x299F3470,
            0x082EFA98, 0xEC4E6C89,
        ],
        v0_match: 0xE2B2CC34,
        v8_match: None,
    },
    osc: OscillatorLayout {
        split_at: Some(32),
        groups: 8,
        ..COMMON_OSC
    },
    ivr_core_mask: 0x7f00,
    m_check_pattern: 0xF00F_6688,
    reset_settle: Duration::from_millis(0),
};

impl ChipVariant {
    pub fn for_model(model: Model) -> Self {
        match model {
            Model::Sc1 => SC1,
            Model::Dcr1 => DCR1,
        }
    }

    /// The same chip with the rev-A read workaround turned on
    pub fn with_read_erratum(self, shift: u32) -> Self {
        Self {
            read_shift: shift,
            ..self
        }
    }

    /// Register values are truncated to this mask
    pub fn data_mask(&self) -> u64 {
        if self.data_bytes >= 8 {
            std::u64::MAX
        } else {
            (1u64 << (self.data_bytes * 8)) - 1
        }
    }

    /// One bit per chip of the string as reported by the board DONE/NONCE lines
    pub fn chip_mask(&self) -> u16 {
        ((1u32 << self.chips) - 1) as u16
    }

    pub fn last_core(&self) -> usize {
        self.cores - 1
    }

    /// Core address holding the oscillator register of group `group`
    pub fn osc_group_core(&self, group: usize) -> usize {
        assert!(group < self.osc.groups, "BUG: oscillator group {}", group);
        group * CORES_PER_OSC_GROUP + OSC_GROUP_CORE_OFFSET
    }

    /// Address shift of a read of `register` in `core`
    ///
    /// Rev-A silicon only mangles reads of the core configuration registers. Chip level
    /// registers and core result registers are decoded at their own address.
    pub fn read_shift_for(&self, core: usize, register: u8) -> u32 {
        if core == CHIP_REGISTER_CORE || self.regs.is_result_register(register) {
            0
        } else {
            self.read_shift
        }
    }

    /// Whether a register can be read with the configured read erratum shift
    ///
    /// A shifted configuration register address must fit the header and must not land
    /// on a result register, which the chip would answer instead.
    pub fn is_readable(&self, core: usize, register: u8) -> bool {
        let shift = self.read_shift_for(core, register);
        if shift == 0 {
            return true;
        }
        let shifted = (register as u32) << shift;
        shifted <= 0x7f && !self.regs.is_result_register(shifted as u8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_m_register_addresses() {
        let sc1: Vec<_> = SC1.regs.m_addresses().collect();
        assert_eq!(sc1.len(), 9);
        assert!(sc1.iter().all(|(i, _)| *i != 4), "SC1 must skip M4");
        assert_eq!(sc1.last(), Some(&(9, 0x19)));

        let dcr1: Vec<_> = DCR1.regs.m_addresses().collect();
        assert_eq!(dcr1.len(), 12);
        assert!(dcr1.iter().all(|(i, _)| *i != 3), "DCR1 must skip M3");
        assert_eq!(DCR1.regs.m_address(9), Some(0x19));
        assert_eq!(DCR1.regs.m_address(10), Some(0x21));
        assert_eq!(DCR1.regs.m_address(12), Some(0x23));
        assert_eq!(DCR1.regs.m_address(13), None);
    }

    #[test]
    fn test_osc_groups() {
        assert_eq!(SC1.osc_group_core(3), 0x37);
        assert_eq!(DCR1.osc_group_core(0), 0x07);
        assert_eq!(DCR1.osc_group_core(7), 0x77);
        assert_eq!(DCR1.osc.last_core_enable(), 0x0040_0000);
    }

    #[test]
    fn test_split_and_join() {
        let value = 0x0000_0001_0f80_0008;
        assert_eq!(SC1.osc.split(value), (value, None));
        assert_eq!(DCR1.osc.split(value), (0x0f80_0008, Some(1)));
        assert_eq!(DCR1.osc.join(0x0f80_0008, Some(1)), value);
    }

    #[test]
    fn test_masks() {
        assert_eq!(SC1.data_mask(), std::u64::MAX);
        assert_eq!(DCR1.data_mask(), 0xffff_ffff);
        assert_eq!(DCR1.chip_mask(), 0x7fff);
    }

    #[test]
    fn test_read_erratum_limits_readable_registers() {
        for variant in [SC1, DCR1].iter() {
            let rev_a = variant.with_read_erratum(1);
            let regs = &rev_a.regs;
            assert!(rev_a.is_readable(7, regs.ocr));
            assert!(rev_a.is_readable(0, regs.m0));
            // ECR would be read from FDR0
            assert!(!rev_a.is_readable(0, regs.ecr));
            assert!(variant.is_readable(0, regs.ecr));
            // results and chip level registers are read as they are
            for register in [regs.fdr0, regs.fsr, regs.esr].iter() {
                assert!(rev_a.is_readable(0, *register));
                assert_eq!(rev_a.read_shift_for(0, *register), 0);
            }
            assert!(rev_a.is_readable(CHIP_REGISTER_CORE, regs.ivr));
            assert_eq!(rev_a.read_shift_for(CHIP_REGISTER_CORE, regs.ivr), 0);
            assert_eq!(rev_a.read_shift_for(7, regs.ocr), 1);
        }
    }

    #[test]
    fn test_model_parse() {
        assert_eq!("SC1".parse::<Model>().unwrap(), Model::Sc1);
        assert_eq!("dcr1a".parse::<Model>().unwrap(), Model::Dcr1);
        assert!("bm1387".parse::<Model>().is_err());
    }
}
