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

//! Driver for strings of Obelisk SC1 and DCR1 hashing chips
//!
//! The layers from the bottom up:
//!
//! - [`frame`] encodes addressed register accesses into SPI frames
//! - [`transfer`] owns the bus and executes single frame transfers
//! - [`job`] programs search parameters, [`lifecycle`] runs a job on one core
//! - [`ocr`] builds oscillator register values and keeps per-chip clock tuning
//! - [`calibration`] ramps the string supply until every chip answers and initializes them
//!
//! [`sim`] provides a simulated controller that plugs into the same seams as the hardware.

pub mod logging;

pub mod calibration;
pub mod config;
pub mod error;
pub mod frame;
pub mod gpio;
pub mod hashboard;
pub mod job;
pub mod lifecycle;
pub mod ocr;
pub mod selftest;
pub mod sim;
pub mod spi;
pub mod transfer;
pub mod variant;

pub use calibration::{calibrate_string, initialize_device};
pub use lifecycle::JobCycle;
pub use ocr::build_oscillator_register;
pub use transfer::Dispatcher;
pub use variant::{ChipVariant, Model};
