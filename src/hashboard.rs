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

//! Hash board services provided outside of the ASIC bus (port expander, e-pot, ADC)

use crate::error::{self, ErrorKind};

use serde::{Deserialize, Serialize};

use std::fmt;

/// String supply control level of the digital potentiometer
///
/// Note: the higher the level, the lower the voltage
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[serde(try_from = "u8", into = "u8")]
pub struct EpotLevel(pub(crate) u8);

impl EpotLevel {
    /// Lowest string voltage the potentiometer can produce
    pub const MIN_VOLTAGE: Self = Self(127);
    /// Highest string voltage the potentiometer can produce
    pub const MAX_VOLTAGE: Self = Self(12);

    pub fn new(level: u8) -> error::Result<Self> {
        if level > Self::MIN_VOLTAGE.0 || level < Self::MAX_VOLTAGE.0 {
            Err(ErrorKind::InvalidArgument(format!(
                "e-pot level {} out of range {}..={}",
                level,
                Self::MAX_VOLTAGE.0,
                Self::MIN_VOLTAGE.0
            )))?
        }
        Ok(Self(level))
    }

    pub fn level(&self) -> u8 {
        self.0
    }

    /// One or more counts towards higher voltage, `None` when `limit` would be crossed
    pub fn raised(&self, counts: u8, limit: Self) -> Option<Self> {
        let level = self.0.checked_sub(counts)?;
        if level < limit.0 {
            None
        } else {
            Some(Self(level))
        }
    }

    /// Voltage is at `limit` or higher
    pub fn reached(&self, limit: Self) -> bool {
        self.0 <= limit.0
    }
}

impl fmt::Display for EpotLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::convert::TryFrom<u8> for EpotLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).map_err(|e| e.to_string())
    }
}

impl From<EpotLevel> for u8 {
    fn from(level: EpotLevel) -> u8 {
        level.0
    }
}

/// Board level signals and supply control used to drive a string
///
/// All methods take the hash board index, one implementation serves the whole controller.
pub trait Hashboard {
    fn is_present(&self, board: usize) -> bool;

    /// Aggregated DONE lines, one bit per chip
    fn read_done_lines(&mut self, board: usize) -> error::Result<u16>;

    /// Aggregated NONCE lines, one bit per chip
    fn read_nonce_lines(&mut self, board: usize) -> error::Result<u16>;

    /// Drive START_CLK, enabling clocking of all oscillators on the string
    fn set_hash_clock(&mut self, board: usize, enable: bool) -> error::Result<()>;

    fn set_supply_enable(&mut self, board: usize, enable: bool) -> error::Result<()>;

    fn set_supply_level(&mut self, board: usize, level: EpotLevel) -> error::Result<()>;

    fn supply_level(&mut self, board: usize) -> error::Result<EpotLevel>;

    /// Check system voltages are sane after a supply change
    fn check_voltages(&mut self, board: usize) -> error::Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_level_range() {
        assert!(EpotLevel::new(11).is_err());
        assert!(EpotLevel::new(128).is_err());
        assert_eq!(EpotLevel::new(30).unwrap().level(), 30);
    }

    #[test]
    fn test_raise_stops_at_limit() {
        let floor = EpotLevel::new(17).unwrap();
        let level = EpotLevel::new(18).unwrap();
        assert_eq!(level.raised(1, floor), Some(floor));
        assert_eq!(level.raised(2, floor), None);
        assert!(floor.reached(floor));
        assert!(!level.reached(floor));
    }
}
