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

//! Single frame transfers over the shared SPI bus
//!
//! The [`Dispatcher`] owns everything that used to be process wide: frame buffers, the
//! memoized bus multiplexer setting and the clock. Independent strings can therefore be
//! driven by independent dispatchers as long as they don't share the physical bus.

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::frame::{Codec, Frame, Mode, MAX_FRAME_BYTES, MAX_REGISTER};
use crate::variant::{ChipVariant, CHIP_REGISTER_CORE, MAX_BOARDS};

use embedded_hal::blocking::delay::DelayUs;
use linux_embedded_hal::Delay;

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// How long to wait for the bus to become idle before giving up
pub const DEFAULT_BUS_TIMEOUT: Duration = Duration::from_millis(100);

/// Polling period of the bus busy line
const BUS_POLL_PERIOD: Duration = Duration::from_micros(10);

/// Routing of the controller bus multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxTarget {
    Reset,
    /// Chip selects go to the ASIC strings
    Asic,
    /// Chip selects go to the hash board port expanders
    Gpio,
    Invalid,
}

impl MuxTarget {
    /// Levels of the (ADDR0, ADDR1) select lines
    pub fn address_lines(&self) -> (bool, bool) {
        match self {
            MuxTarget::Reset => (false, false),
            MuxTarget::Asic => (true, false),
            MuxTarget::Gpio => (false, true),
            MuxTarget::Invalid => (true, true),
        }
    }
}

/// Raw byte transport consumed by the dispatcher
pub trait Backend {
    /// Any chip select is asserted
    fn is_busy(&mut self) -> error::Result<bool>;

    fn set_mux(&mut self, target: MuxTarget) -> error::Result<()>;

    /// Assert chip select of hash board `board`
    fn select(&mut self, board: usize) -> error::Result<()>;

    /// Bus error recovery, release every chip select
    fn deselect_all(&mut self) -> error::Result<()>;

    /// Synchronous full duplex transfer, chip select is released when done
    fn transfer(&mut self, output: &[u8], input: &mut [u8]) -> error::Result<()>;

    /// Start a write, the back end releases chip select at the end of the physical transfer
    fn start_write(&mut self, output: &[u8]) -> error::Result<()>;
}

/// Monotonic clock with a blocking delay
pub trait Timer {
    /// Time elapsed since an arbitrary fixed point
    fn now(&self) -> Duration;

    fn delay(&mut self, duration: Duration);
}

/// Wall clock timer built on top of `linux-embedded-hal`
pub struct SystemTimer {
    epoch: Instant,
    delay: Delay,
}

impl SystemTimer {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            delay: Delay,
        }
    }
}

impl Timer for SystemTimer {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn delay(&mut self, duration: Duration) {
        let us = duration.as_micros();
        let us = if us > std::u32::MAX as u128 {
            std::u32::MAX
        } else {
            us as u32
        };
        self.delay.delay_us(us);
    }
}

/// Timer that only moves when somebody waits, clones share the same clock
#[derive(Clone, Debug)]
pub struct ManualTimer(Rc<Cell<Duration>>);

impl ManualTimer {
    pub fn new() -> Self {
        ManualTimer(Rc::new(Cell::new(Duration::from_secs(0))))
    }

    pub fn advance(&self, duration: Duration) {
        self.0.set(self.0.get() + duration);
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> Duration {
        self.0.get()
    }

    fn delay(&mut self, duration: Duration) {
        self.advance(duration);
    }
}

/// Addressing scheme of register writes within one string
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// All cores of all chips
    All,
    /// All cores of one chip
    Chip(usize),
    /// One core of one chip
    Core { chip: usize, core: usize },
}

impl Target {
    /// Return if address is a broadcast
    pub fn is_broadcast(&self) -> bool {
        match self {
            Target::All => true,
            _ => false,
        }
    }

    pub fn frame(&self, board: usize, register: u8, data: u64) -> Frame {
        match *self {
            Target::All => Frame::multicast(board, register, data),
            Target::Chip(chip) => Frame::chip_write(board, chip, register, data),
            Target::Core { chip, core } => Frame::write(board, chip, core, register, data),
        }
    }
}

pub struct Dispatcher<B, T> {
    backend: B,
    timer: T,
    variant: ChipVariant,
    codec: Codec,
    out_buf: [u8; MAX_FRAME_BYTES],
    in_buf: [u8; MAX_FRAME_BYTES],
    /// Last multiplexer setting applied to the back end
    mux: Option<MuxTarget>,
    bus_timeout: Duration,
}

impl<B, T> Dispatcher<B, T>
where
    B: Backend,
    T: Timer,
{
    pub fn new(backend: B, timer: T, variant: ChipVariant) -> Self {
        Self {
            backend,
            timer,
            variant,
            codec: Codec::new(&variant),
            out_buf: [0; MAX_FRAME_BYTES],
            in_buf: [0; MAX_FRAME_BYTES],
            mux: None,
            bus_timeout: DEFAULT_BUS_TIMEOUT,
        }
    }

    pub fn with_bus_timeout(mut self, timeout: Duration) -> Self {
        self.bus_timeout = timeout;
        self
    }

    pub fn variant(&self) -> &ChipVariant {
        &self.variant
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn now(&self) -> Duration {
        self.timer.now()
    }

    pub fn delay(&mut self, duration: Duration) {
        self.timer.delay(duration)
    }

    pub fn mux(&self) -> Option<MuxTarget> {
        self.mux
    }

    /// Route the bus multiplexer, the change is refused while the bus is mid-transfer
    pub fn set_mux(&mut self, target: MuxTarget) -> error::Result<()> {
        if self.mux == Some(target) {
            return Ok(());
        }
        if self.backend.is_busy()? {
            warn!("Refusing to switch bus mux to {:?} during transfer", target);
            Err(ErrorKind::Busy(format!(
                "cannot switch mux to {:?} while bus is busy",
                target
            )))?
        }
        self.backend.set_mux(target)?;
        self.mux = Some(target);
        Ok(())
    }

    /// Execute one frame transfer, reads return the decoded register value
    pub fn transfer(&mut self, frame: &Frame) -> error::Result<Option<u64>> {
        self.validate(frame)?;
        self.wait_for_bus()?;
        self.set_mux(MuxTarget::Asic)?;
        self.backend.select(frame.board)?;

        let len = self.codec.encode(frame, &mut self.out_buf);
        if frame.is_read() {
            for byte in self.in_buf[..len].iter_mut() {
                *byte = 0;
            }
            if let Err(e) = self
                .backend
                .transfer(&self.out_buf[..len], &mut self.in_buf[..len])
            {
                if e.kind().is_bus_error() {
                    self.recover();
                }
                return Err(e);
            }
            Ok(Some(self.codec.decode_data(frame, &self.in_buf[..len])))
        } else {
            if let Err(e) = self.backend.start_write(&self.out_buf[..len]) {
                if e.kind().is_bus_error() {
                    self.recover();
                }
                return Err(e);
            }
            Ok(None)
        }
    }

    /// Write register of all cores/chips covered by `target`
    pub fn write(
        &mut self,
        board: usize,
        target: Target,
        register: u8,
        data: u64,
    ) -> error::Result<()> {
        self.transfer(&target.frame(board, register, data))?;
        Ok(())
    }

    /// Read register of one core, use [`CHIP_REGISTER_CORE`] for chip level registers
    pub fn read(
        &mut self,
        board: usize,
        chip: usize,
        core: usize,
        register: u8,
    ) -> error::Result<u64> {
        let data = self.transfer(&Frame::read(board, chip, core, register))?;
        Ok(data.expect("BUG: read transfer without data"))
    }

    fn validate(&self, frame: &Frame) -> error::Result<()> {
        if frame.board >= MAX_BOARDS {
            Err(ErrorKind::NotFound(format!(
                "hash board {} out of range 0..{}",
                frame.board, MAX_BOARDS
            )))?
        }
        if frame.mode != Mode::Multicast && frame.chip >= self.variant.chips {
            Err(ErrorKind::NotFound(format!(
                "chip {} out of range 0..{}",
                frame.chip, self.variant.chips
            )))?
        }
        let core_field_used = match frame.mode {
            Mode::RegWrite | Mode::RegRead => true,
            Mode::ChipWrite | Mode::Multicast => false,
        };
        if core_field_used && frame.core >= self.variant.cores && frame.core != CHIP_REGISTER_CORE
        {
            Err(ErrorKind::InvalidArgument(format!(
                "core {:#x} out of range for {}",
                frame.core, self.variant.name
            )))?
        }
        if frame.register > MAX_REGISTER {
            Err(ErrorKind::InvalidArgument(format!(
                "register {:#x} does not fit the frame",
                frame.register
            )))?
        }
        if frame.data & !self.variant.data_mask() != 0 {
            Err(ErrorKind::InvalidArgument(format!(
                "data {:#x} wider than {} bytes",
                frame.data, self.variant.data_bytes
            )))?
        }
        if frame.is_read() && !self.variant.is_readable(frame.core, frame.register) {
            Err(ErrorKind::Unsupported(format!(
                "register {:#x} of core {:#x} cannot be read with read shift {}",
                frame.register, frame.core, self.variant.read_shift
            )))?
        }
        Ok(())
    }

    fn wait_for_bus(&mut self) -> error::Result<()> {
        let deadline = self.timer.now() + self.bus_timeout;
        while self.backend.is_busy()? {
            if self.timer.now() >= deadline {
                self.recover();
                Err(ErrorKind::Busy(format!(
                    "bus still busy after {:?}",
                    self.bus_timeout
                )))?
            }
            self.timer.delay(BUS_POLL_PERIOD);
        }
        Ok(())
    }

    fn recover(&mut self) {
        warn!("SPI bus error, releasing all chip selects");
        if let Err(e) = self.backend.deselect_all() {
            error!("Bus recovery failed: {}", e);
        }
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;

    /// What the fake bus saw
    #[derive(Debug, Clone, PartialEq)]
    pub enum Event {
        Mux(MuxTarget),
        Select(usize),
        DeselectAll,
        Transfer(Vec<u8>),
        Write(Vec<u8>),
    }

    /// Back end that records traffic and answers reads with a fixed payload
    pub struct FakeBackend {
        pub events: Vec<Event>,
        /// Number of `is_busy` polls that report busy
        pub busy_polls: usize,
        pub fail_transfer: Option<ErrorKind>,
        pub fail_write: Option<ErrorKind>,
        pub response: Vec<u8>,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self {
                events: vec![],
                busy_polls: 0,
                fail_transfer: None,
                fail_write: None,
                response: vec![],
            }
        }
    }

    impl Backend for FakeBackend {
        fn is_busy(&mut self) -> error::Result<bool> {
            if self.busy_polls > 0 {
                self.busy_polls -= 1;
                return Ok(true);
            }
            Ok(false)
        }

        fn set_mux(&mut self, target: MuxTarget) -> error::Result<()> {
            self.events.push(Event::Mux(target));
            Ok(())
        }

        fn select(&mut self, board: usize) -> error::Result<()> {
            self.events.push(Event::Select(board));
            Ok(())
        }

        fn deselect_all(&mut self) -> error::Result<()> {
            self.busy_polls = 0;
            self.events.push(Event::DeselectAll);
            Ok(())
        }

        fn transfer(&mut self, output: &[u8], input: &mut [u8]) -> error::Result<()> {
            self.events.push(Event::Transfer(output.to_vec()));
            if let Some(kind) = self.fail_transfer.clone() {
                Err(kind)?
            }
            for (dst, src) in input.iter_mut().zip(self.response.iter()) {
                *dst = *src;
            }
            Ok(())
        }

        fn start_write(&mut self, output: &[u8]) -> error::Result<()> {
            self.events.push(Event::Write(output.to_vec()));
            if let Some(kind) = self.fail_write.take() {
                Err(kind)?
            }
            Ok(())
        }
    }
}
