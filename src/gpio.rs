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

//! Controller board pins: SPI mux address lines, hash board chip selects and presence

use crate::error::{self, ErrorKind};
use crate::variant::MAX_BOARDS;

use embedded_hal;
use embedded_hal::digital::v2::InputPin;
use sysfs_gpio;

/// Helper struct for altering output pins which implements OutputPin trait
#[derive(Clone)]
pub struct PinOut(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::OutputPin for PinOut {
    type Error = sysfs_gpio::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(0)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(1)
    }
}

/// Helper struct for reading input pins which implements InputPin trait
#[derive(Clone)]
pub struct PinIn(sysfs_gpio::Pin);

impl embedded_hal::digital::v2::InputPin for PinIn {
    type Error = sysfs_gpio::Error;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value > 0)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.0.get_value().map(|value| value == 0)
    }
}

/// All known output pins of the controller
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PinOutName {
    /// Bus multiplexer address lines
    SpiAddr0,
    SpiAddr1,
    /// Active low chip select of hash board `n` (0 based)
    SpiSelect(usize),
}

/// All known input pins of the controller
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PinInName {
    /// Active low presence of hash board `n` (0 based)
    BoardPresent(usize),
}

impl PinOutName {
    pub fn number(&self) -> u64 {
        match *self {
            PinOutName::SpiAddr0 => 12,
            PinOutName::SpiAddr1 => 13,
            PinOutName::SpiSelect(i) => {
                assert!(i < MAX_BOARDS, "SPI select pin {} is out of range", i);
                [17, 7, 8][i]
            }
        }
    }
}

impl PinInName {
    pub fn number(&self) -> u64 {
        match *self {
            PinInName::BoardPresent(i) => {
                assert!(i < MAX_BOARDS, "Board present pin {} is out of range", i);
                77 + i as u64
            }
        }
    }
}

/// Provides functionality for configuring specific controller pins
/// The pins can be accessed by name (see PinOutName and PinInName)
pub struct ControlPinManager;

impl ControlPinManager {
    pub fn new() -> Self {
        ControlPinManager {}
    }

    /// Returns a specified output pin and initializes it (export in sysfs)
    pub fn get_pin_out(&self, pin_name: PinOutName) -> Result<PinOut, sysfs_gpio::Error> {
        let pin = sysfs_gpio::Pin::new(pin_name.number());
        pin.export()?;
        // chip selects are active low, start deasserted
        let direction = match pin_name {
            PinOutName::SpiSelect(_) => sysfs_gpio::Direction::High,
            _ => sysfs_gpio::Direction::Low,
        };
        pin.set_direction(direction)?;
        Ok(PinOut(pin))
    }

    /// Returns a specified input pin and initializes it (export in sysfs)
    pub fn get_pin_in(&self, pin_name: PinInName) -> Result<PinIn, sysfs_gpio::Error> {
        let pin = sysfs_gpio::Pin::new(pin_name.number());
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::In)?;
        Ok(PinIn(pin))
    }

    /// Indices of hash boards plugged into the controller
    pub fn detect_boards(&self) -> error::Result<Vec<usize>> {
        let mut boards = Vec::new();
        for i in 0..MAX_BOARDS {
            let pin = self.get_pin_in(PinInName::BoardPresent(i))?;
            let present = pin
                .is_low()
                .map_err(|e| ErrorKind::Gpio(format!("board {} presence: {}", i, e)))?;
            if present {
                boards.push(i);
            }
        }
        Ok(boards)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pin_numbers() {
        assert_eq!(PinOutName::SpiAddr0.number(), 12);
        assert_eq!(PinOutName::SpiAddr1.number(), 13);
        let selects: Vec<_> = (0..MAX_BOARDS)
            .map(|i| PinOutName::SpiSelect(i).number())
            .collect();
        assert_eq!(selects, vec![17, 7, 8]);
        assert_eq!(PinInName::BoardPresent(2).number(), 79);
    }

    /// Verify non existing
    #[test]
    #[should_panic]
    fn test_select_pin_doesnt_exist() {
        PinOutName::SpiSelect(MAX_BOARDS).number();
    }

    #[test]
    #[should_panic]
    fn test_present_pin_doesnt_exist() {
        PinInName::BoardPresent(MAX_BOARDS).number();
    }
}
