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

//! Transfer back end on top of `embedded-hal` SPI and GPIO

use crate::error::{self, ErrorKind};
use crate::gpio::{ControlPinManager, PinOut, PinOutName};
use crate::transfer::{Backend, MuxTarget};
use crate::variant::MAX_BOARDS;

use embedded_hal::blocking::spi;
use embedded_hal::digital::v2::OutputPin;
use linux_embedded_hal::spidev::{SpidevOptions, SPI_MODE_0};
use linux_embedded_hal::Spidev;

use std::fmt::Debug;
use std::path::Path;

/// SPI master of the controller wired to the hash board connectors
pub const DEFAULT_SPIDEV_PATH: &'static str = "/dev/spidev32766.0";

const SPI_SPEED_HZ: u32 = 1_000_000;

/// Open and configure the controller SPI master: mode 0, 8 bit words
pub fn open_spidev<P: AsRef<Path>>(path: P) -> error::Result<Spidev> {
    let mut spi = Spidev::open(path)?;
    let options = SpidevOptions::new()
        .bits_per_word(8)
        .max_speed_hz(SPI_SPEED_HZ)
        .mode(SPI_MODE_0)
        .build();
    spi.configure(&options)?;
    Ok(spi)
}

/// SPI master with the controller bus multiplexer and per-board chip selects
pub struct SpiBackend<S, P> {
    spi: S,
    addr0: P,
    addr1: P,
    /// Active low chip selects indexed by hash board
    selects: Vec<P>,
    selected: Option<usize>,
}

fn pin_error<E: Debug>(what: &str, e: E) -> error::Error {
    ErrorKind::Gpio(format!("{}: {:?}", what, e)).into()
}

impl<S, P, E> SpiBackend<S, P>
where
    S: spi::Transfer<u8, Error = E> + spi::Write<u8, Error = E>,
    E: Debug,
    P: OutputPin,
    P::Error: Debug,
{
    pub fn new(spi: S, addr0: P, addr1: P, selects: Vec<P>) -> Self {
        Self {
            spi,
            addr0,
            addr1,
            selects,
            selected: None,
        }
    }

    fn release(&mut self) -> error::Result<()> {
        if let Some(board) = self.selected.take() {
            self.selects[board]
                .set_high()
                .map_err(|e| pin_error("chip select", e))?;
        }
        Ok(())
    }
}

impl<S> SpiBackend<S, PinOut>
where
    S: spi::Transfer<u8> + spi::Write<u8>,
{
    /// Back end using the controller pins exported through sysfs
    pub fn with_control_pins(spi: S, manager: &ControlPinManager) -> error::Result<Self> {
        let mut selects = Vec::with_capacity(MAX_BOARDS);
        for i in 0..MAX_BOARDS {
            selects.push(manager.get_pin_out(PinOutName::SpiSelect(i))?);
        }
        Ok(Self {
            spi,
            addr0: manager.get_pin_out(PinOutName::SpiAddr0)?,
            addr1: manager.get_pin_out(PinOutName::SpiAddr1)?,
            selects,
            selected: None,
        })
    }
}

impl<S, P, E> Backend for SpiBackend<S, P>
where
    S: spi::Transfer<u8, Error = E> + spi::Write<u8, Error = E>,
    E: Debug,
    P: OutputPin,
    P::Error: Debug,
{
    fn is_busy(&mut self) -> error::Result<bool> {
        Ok(self.selected.is_some())
    }

    fn set_mux(&mut self, target: MuxTarget) -> error::Result<()> {
        let (addr0, addr1) = target.address_lines();
        let set = |pin: &mut P, high: bool| {
            if high {
                pin.set_high()
            } else {
                pin.set_low()
            }
        };
        set(&mut self.addr0, addr0).map_err(|e| pin_error("mux ADDR0", e))?;
        set(&mut self.addr1, addr1).map_err(|e| pin_error("mux ADDR1", e))?;
        Ok(())
    }

    fn select(&mut self, board: usize) -> error::Result<()> {
        if board >= self.selects.len() {
            Err(ErrorKind::NotFound(format!("no chip select for board {}", board)))?
        }
        self.selects[board]
            .set_low()
            .map_err(|e| pin_error("chip select", e))?;
        self.selected = Some(board);
        Ok(())
    }

    fn deselect_all(&mut self) -> error::Result<()> {
        for pin in self.selects.iter_mut() {
            pin.set_high().map_err(|e| pin_error("chip select", e))?;
        }
        self.selected = None;
        Ok(())
    }

    fn transfer(&mut self, output: &[u8], input: &mut [u8]) -> error::Result<()> {
        input.copy_from_slice(output);
        self.spi
            .transfer(input)
            .map_err(|e| ErrorKind::Spi(format!("transfer: {:?}", e)))?;
        self.release()
    }

    fn start_write(&mut self, output: &[u8]) -> error::Result<()> {
        self.spi
            .write(output)
            .map_err(|e| ErrorKind::Spi(format!("write: {:?}", e)))?;
        self.release()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::RefCell;
    use std::convert::Infallible;
    use std::rc::Rc;

    /// Pin that logs its level changes into a shared journal
    struct LogPin(&'static str, Rc<RefCell<Vec<(&'static str, bool)>>>);

    impl OutputPin for LogPin {
        type Error = Infallible;

        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.1.borrow_mut().push((self.0, false));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.1.borrow_mut().push((self.0, true));
            Ok(())
        }
    }

    /// Loop back SPI that inverts every byte
    struct InvertingSpi;

    impl spi::Transfer<u8> for InvertingSpi {
        type Error = ();

        fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
            for w in words.iter_mut() {
                *w = !*w;
            }
            Ok(words)
        }
    }

    impl spi::Write<u8> for InvertingSpi {
        type Error = ();

        fn write(&mut self, _words: &[u8]) -> Result<(), ()> {
            Ok(())
        }
    }

    fn backend() -> (
        SpiBackend<InvertingSpi, LogPin>,
        Rc<RefCell<Vec<(&'static str, bool)>>>,
    ) {
        let log = Rc::new(RefCell::new(vec![]));
        let backend = SpiBackend::new(
            InvertingSpi,
            LogPin("addr0", log.clone()),
            LogPin("addr1", log.clone()),
            vec![
                LogPin("cs0", log.clone()),
                LogPin("cs1", log.clone()),
                LogPin("cs2", log.clone()),
            ],
        );
        (backend, log)
    }

    #[test]
    fn test_mux_lines() {
        let (mut backend, log) = backend();
        backend.set_mux(MuxTarget::Asic).unwrap();
        assert_eq!(*log.borrow(), vec![("addr0", true), ("addr1", false)]);
    }

    #[test]
    fn test_chip_select_released_after_transfer() {
        let (mut backend, log) = backend();
        backend.select(1).unwrap();
        assert!(backend.is_busy().unwrap());
        let mut input = [0u8; 3];
        backend.transfer(&[0x00, 0x0f, 0xff], &mut input).unwrap();
        assert_eq!(input, [0xff, 0xf0, 0x00]);
        assert!(!backend.is_busy().unwrap());
        assert_eq!(*log.borrow(), vec![("cs1", false), ("cs1", true)]);
    }

    #[test]
    fn test_missing_spidev() {
        match open_spidev("/dev/obelisk-no-such-spidev").err().unwrap().kind() {
            ErrorKind::Io(_) => (),
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn test_unknown_board() {
        let (mut backend, _) = backend();
        match backend.select(MAX_BOARDS).unwrap_err().kind() {
            ErrorKind::NotFound(_) => (),
            k => panic!("unexpected error {:?}", k),
        }
    }
}
