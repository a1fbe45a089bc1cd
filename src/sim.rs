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

//! Simulated hash boards for tests and bench runs without hardware
//!
//! The simulation keeps a register file per core, models oscillator groups, core clock
//! gating and the engine control handshakes. Jobs are not hashed: a core that is started
//! with the M/V registers of a known job reports that job's solution when it falls into
//! the core's nonce range.
//!
//! A chip only answers when the string supply is on and the e-pot level has reached the
//! chip's wake up threshold. Silent chips read as zero.

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::frame::{Codec, Mode, HEADER_BYTES};
use crate::hashboard::{EpotLevel, Hashboard};
use crate::job::{self, Job};
use crate::transfer::{Backend, MuxTarget};
use crate::variant::{
    ecr, esr, fcr, ChipVariant, CHIP_REGISTER_CORE, CORES_PER_OSC_GROUP, MAX_BOARDS,
    NUM_FIFO_REGS, NUM_V_REGS,
};

use std::cell::RefCell;
use std::rc::Rc;

const NUM_REGISTERS: usize = 128;

/// Threshold of a chip that never wakes up
pub const NEVER: u8 = 0;

#[derive(Clone)]
struct SimCore {
    regs: [u64; NUM_REGISTERS],
    done: bool,
    fifo: [u64; NUM_FIFO_REGS],
    /// FIFO status, one bit per valid FIFO slot
    fsr: u64,
}

impl SimCore {
    fn new() -> Self {
        Self {
            regs: [0; NUM_REGISTERS],
            done: false,
            fifo: [0; NUM_FIFO_REGS],
            fsr: 0,
        }
    }

    fn clear_engine(&mut self) {
        self.done = false;
        self.fifo = [0; NUM_FIFO_REGS];
        self.fsr = 0;
    }

    /// FIFO slots with an unmasked nonce interrupt
    fn pending(&self, fcr_register: u8) -> u64 {
        self.fsr & !self.regs[fcr_register as usize] & fcr::MASK_ALL
    }
}

struct SimChip {
    /// Highest e-pot level (lowest voltage) the chip works at
    threshold: u8,
    /// Reads that still come back corrupted
    flaky_reads: usize,
    cores: Vec<SimCore>,
}

struct SimBoard {
    chips: Vec<SimChip>,
    supply: bool,
    level: EpotLevel,
    hash_clock: bool,
    voltage_fault: bool,
}

impl SimBoard {
    fn responsive(&self, chip: usize) -> bool {
        self.supply && self.level.level() <= self.chips[chip].threshold
    }
}

/// State shared by [`SimBus`] and [`SimBoards`]
pub struct SimController {
    variant: ChipVariant,
    codec: Codec,
    boards: Vec<Option<SimBoard>>,
    jobs: Vec<Job>,
    mux: Option<MuxTarget>,
    selected: Option<usize>,
    transfers: usize,
}

impl SimController {
    /// Controller without any boards that knows the sample jobs of `variant`
    pub fn new(variant: ChipVariant) -> Self {
        Self {
            variant,
            codec: Codec::new(&variant),
            boards: (0..MAX_BOARDS).map(|_| None).collect(),
            jobs: job::sample_jobs(variant.model).to_vec(),
            mux: None,
            selected: None,
            transfers: 0,
        }
    }

    /// Insert a board, `thresholds` holds the wake up level of every chip
    pub fn with_board(mut self, board: usize, thresholds: &[u8]) -> Self {
        assert!(board < MAX_BOARDS, "BUG: board {} out of range", board);
        assert_eq!(
            thresholds.len(),
            self.variant.chips,
            "BUG: one threshold per chip expected"
        );
        let chips = thresholds
            .iter()
            .map(|threshold| SimChip {
                threshold: *threshold,
                flaky_reads: 0,
                cores: vec![SimCore::new(); self.variant.cores],
            })
            .collect();
        self.boards[board] = Some(SimBoard {
            chips,
            supply: false,
            level: EpotLevel::MIN_VOLTAGE,
            hash_clock: false,
            voltage_fault: false,
        });
        self
    }

    /// Insert a board where every chip wakes up at `threshold`
    pub fn with_uniform_board(self, board: usize, threshold: u8) -> Self {
        let thresholds = vec![threshold; self.variant.chips];
        self.with_board(board, &thresholds)
    }

    /// The next `reads` reads of `chip` return a corrupted value
    pub fn with_flaky_chip(mut self, board: usize, chip: usize, reads: usize) -> Self {
        self.board_mut(board).chips[chip].flaky_reads = reads;
        self
    }

    /// Teach the simulation another job with a known solution
    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn split(self) -> (SimBus, SimBoards) {
        let shared = Rc::new(RefCell::new(self));
        (SimBus(shared.clone()), SimBoards(shared))
    }

    fn board(&self, board: usize) -> &SimBoard {
        self.boards[board]
            .as_ref()
            .expect("BUG: access to missing simulated board")
    }

    fn board_mut(&mut self, board: usize) -> &mut SimBoard {
        self.boards[board]
            .as_mut()
            .expect("BUG: access to missing simulated board")
    }

    fn is_clocked(&self, board: usize, chip: usize, core: usize) -> bool {
        let sim = self.board(board);
        if !sim.hash_clock {
            return false;
        }
        let group = core / CORES_PER_OSC_GROUP;
        let ocr = sim.chips[chip].cores[self.variant.osc_group_core(group)].regs
            [self.variant.regs.ocr as usize];
        ocr & (self.variant.osc.core0 << (core % CORES_PER_OSC_GROUP)) != 0
    }

    /// Known job the core has been loaded with
    fn loaded_job(&self, core: &SimCore) -> Option<&Job> {
        let regs = &self.variant.regs;
        self.jobs.iter().find(|job| {
            regs.m_addresses()
                .all(|(i, address)| core.regs[address as usize] == job.m[i])
                && job.v.map_or(true, |v| {
                    (0..NUM_V_REGS).all(|i| core.regs[regs.v_address(i) as usize] == v[i])
                })
                && job
                    .match_reg
                    .map_or(true, |m| core.regs[regs.v0_match as usize] == m)
        })
    }

    fn run_engine(&mut self, board: usize, chip: usize, core: usize) {
        if !self.is_clocked(board, chip, core) {
            trace!("sim: chip {} core {:#x} started without clock", chip, core);
            return;
        }
        let regs = self.variant.regs;
        let solution = {
            let sim_core = &self.board(board).chips[chip].cores[core];
            let lb = sim_core.regs[regs.lb as usize];
            let ub = sim_core.regs[regs.ub as usize];
            self.loaded_job(sim_core)
                .and_then(|job| job.expected_solution)
                .filter(|nonce| (lb..=ub).contains(nonce))
        };
        let sim_core = &mut self.board_mut(board).chips[chip].cores[core];
        if let Some(nonce) = solution {
            sim_core.fifo[0] = nonce;
            sim_core.fsr |= 1;
        }
        sim_core.done = true;
    }

    fn write_core(&mut self, board: usize, chip: usize, core: usize, register: u8, data: u64) {
        let ecr_register = self.variant.regs.ecr;
        let sim_core = &mut self.board_mut(board).chips[chip].cores[core];
        let previous = sim_core.regs[register as usize];
        sim_core.regs[register as usize] = data;
        if register != ecr_register {
            return;
        }
        if data & (ecr::RESET_SPI_FSM | ecr::RESET_CORE | ecr::READ_COMPLETE) != 0 {
            sim_core.clear_engine();
        }
        if data & ecr::VALID_DATA != 0 && previous & ecr::VALID_DATA == 0 {
            self.run_engine(board, chip, core);
        }
    }

    fn write_chip(&mut self, board: usize, chip: usize, core: Option<usize>, register: u8, data: u64) {
        if !self.board(board).responsive(chip) {
            return;
        }
        match core {
            Some(core) if core < self.variant.cores => {
                self.write_core(board, chip, core, register, data)
            }
            Some(_) => (),
            None => {
                for core in 0..self.variant.cores {
                    self.write_core(board, chip, core, register, data);
                }
            }
        }
    }

    fn write(&mut self, board: usize, mode: Mode, chip: usize, core: usize, register: u8, data: u64) {
        let chips = self.variant.chips;
        match mode {
            Mode::RegWrite if chip < chips => self.write_chip(board, chip, Some(core), register, data),
            Mode::ChipWrite if chip < chips => self.write_chip(board, chip, None, register, data),
            Mode::Multicast => {
                for chip in 0..chips {
                    self.write_chip(board, chip, None, register, data);
                }
            }
            _ => (),
        }
    }

    fn engine_word(&self, board: usize, chip: usize, word: usize, busy: bool) -> u64 {
        if busy {
            // engines finish instantly
            return 0;
        }
        let bits = self.variant.data_bytes * 8;
        let cores = &self.board(board).chips[chip].cores;
        (0..bits)
            .map(|bit| word * bits + bit)
            .filter(|core| *core < cores.len() && cores[*core].done)
            .fold(0, |acc, core| acc | 1 << (core % bits))
    }

    fn read_chip_register(&self, board: usize, chip: usize, register: u8) -> u64 {
        let regs = &self.variant.regs;
        let words = regs.engine_words as u8;
        if register == regs.ivr {
            let cores = &self.board(board).chips[chip].cores;
            cores
                .iter()
                .position(|core| core.pending(regs.fcr) != 0)
                .map_or(0, |i| ((i as u64) << 8) | cores[i].pending(regs.fcr))
        } else if register >= regs.edr0 && register < regs.edr0 + words {
            self.engine_word(board, chip, (register - regs.edr0) as usize, false)
        } else if register >= regs.ebr0 && register < regs.ebr0 + words {
            self.engine_word(board, chip, (register - regs.ebr0) as usize, true)
        } else {
            0
        }
    }

    fn read_core_register(&self, board: usize, chip: usize, core: usize, register: u8) -> u64 {
        let regs = &self.variant.regs;
        let sim_core = &self.board(board).chips[chip].cores[core];
        if register == regs.esr {
            if sim_core.done {
                esr::DONE
            } else {
                0
            }
        } else if register == regs.fsr {
            sim_core.fsr
        } else if register >= regs.fdr0 && register < regs.fdr0 + NUM_FIFO_REGS as u8 {
            sim_core.fifo[(register - regs.fdr0) as usize]
        } else {
            sim_core.regs[register as usize]
        }
    }

    fn read(&mut self, board: usize, chip: usize, core: usize, register: u8) -> u64 {
        let mask = self.variant.data_mask();
        if chip >= self.variant.chips || !self.board(board).responsive(chip) {
            return 0;
        }
        let value = if core == CHIP_REGISTER_CORE {
            self.read_chip_register(board, chip, register)
        } else if core < self.variant.cores {
            self.read_core_register(board, chip, core, register)
        } else {
            0
        };
        let sim_chip = &mut self.board_mut(board).chips[chip];
        let value = if sim_chip.flaky_reads > 0 {
            sim_chip.flaky_reads -= 1;
            value ^ 0x1
        } else {
            value
        };
        // rev-A silicon returns configuration register data shifted by the read erratum
        (value << self.variant.read_shift_for(core, register)) & mask
    }

    fn lines(&self, board: usize, active: impl Fn(&SimCore) -> bool) -> u16 {
        let sim = self.board(board);
        if !sim.supply {
            // floating lines of an unpowered string
            return std::u16::MAX;
        }
        sim.chips
            .iter()
            .enumerate()
            .filter(|(chip, sim_chip)| {
                sim.responsive(*chip) && sim_chip.cores.iter().any(|core| active(core))
            })
            .fold(0, |acc, (chip, _)| acc | 1 << chip)
    }
}

/// Bus side of the simulation
pub struct SimBus(Rc<RefCell<SimController>>);

impl Backend for SimBus {
    fn is_busy(&mut self) -> error::Result<bool> {
        Ok(false)
    }

    fn set_mux(&mut self, target: MuxTarget) -> error::Result<()> {
        self.0.borrow_mut().mux = Some(target);
        Ok(())
    }

    fn select(&mut self, board: usize) -> error::Result<()> {
        let mut sim = self.0.borrow_mut();
        if board >= MAX_BOARDS {
            Err(ErrorKind::NotFound(format!("no chip select for board {}", board)))?
        }
        sim.selected = Some(board);
        Ok(())
    }

    fn deselect_all(&mut self) -> error::Result<()> {
        self.0.borrow_mut().selected = None;
        Ok(())
    }

    fn transfer(&mut self, output: &[u8], input: &mut [u8]) -> error::Result<()> {
        let mut sim = self.0.borrow_mut();
        let board = sim.selected.take();
        sim.transfers += 1;
        for byte in input.iter_mut() {
            *byte = 0;
        }
        let board = match board {
            Some(board) if sim.mux == Some(MuxTarget::Asic) && sim.boards[board].is_some() => {
                board
            }
            _ => return Ok(()),
        };
        let frame = sim.codec.decode(board, output);
        if frame.mode != Mode::RegRead {
            Err(ErrorKind::Spi(format!(
                "full duplex transfer of {:?} frame",
                frame.mode
            )))?
        }
        let value = sim.read(board, frame.chip, frame.core, frame.register);
        let bytes = value.to_be_bytes();
        let data_bytes = input.len() - HEADER_BYTES;
        input[..HEADER_BYTES].copy_from_slice(&output[..HEADER_BYTES]);
        input[HEADER_BYTES..].copy_from_slice(&bytes[8 - data_bytes..]);
        Ok(())
    }

    fn start_write(&mut self, output: &[u8]) -> error::Result<()> {
        let mut sim = self.0.borrow_mut();
        let board = sim.selected.take();
        sim.transfers += 1;
        if let Some(board) = board {
            if sim.mux == Some(MuxTarget::Asic) && sim.boards[board].is_some() {
                let frame = sim.codec.decode(board, output);
                sim.write(
                    board,
                    frame.mode,
                    frame.chip,
                    frame.core,
                    frame.register,
                    frame.data,
                );
            }
        }
        Ok(())
    }
}

/// Board side of the simulation with inspection helpers for tests
#[derive(Clone)]
pub struct SimBoards(Rc<RefCell<SimController>>);

impl SimBoards {
    pub fn supply_enabled(&self, board: usize) -> bool {
        self.0.borrow().board(board).supply
    }

    pub fn level(&self, board: usize) -> EpotLevel {
        self.0.borrow().board(board).level
    }

    pub fn hash_clock(&self, board: usize) -> bool {
        self.0.borrow().board(board).hash_clock
    }

    /// Make the next voltage check of `board` fail
    pub fn set_voltage_fault(&self, board: usize, fault: bool) {
        self.0.borrow_mut().board_mut(board).voltage_fault = fault;
    }

    /// Register file content of one core
    pub fn register(&self, board: usize, chip: usize, core: usize, register: u8) -> u64 {
        self.0.borrow().board(board).chips[chip].cores[core].regs[register as usize]
    }

    /// Every register of every core of `board` followed by engine state
    pub fn snapshot(&self, board: usize) -> Vec<u64> {
        let sim = self.0.borrow();
        let mut state = vec![];
        for chip in sim.board(board).chips.iter() {
            for core in chip.cores.iter() {
                state.extend_from_slice(&core.regs);
                state.push(core.done as u64);
                state.push(core.fsr);
            }
        }
        state
    }

    /// Number of frames that went over the bus
    pub fn transfers(&self) -> usize {
        self.0.borrow().transfers
    }
}

impl Hashboard for SimBoards {
    fn is_present(&self, board: usize) -> bool {
        board < MAX_BOARDS && self.0.borrow().boards[board].is_some()
    }

    fn read_done_lines(&mut self, board: usize) -> error::Result<u16> {
        Ok(self.0.borrow().lines(board, |core| core.done))
    }

    fn read_nonce_lines(&mut self, board: usize) -> error::Result<u16> {
        let sim = self.0.borrow();
        let fcr_register = sim.variant.regs.fcr;
        Ok(sim.lines(board, |core| core.pending(fcr_register) != 0))
    }

    fn set_hash_clock(&mut self, board: usize, enable: bool) -> error::Result<()> {
        self.0.borrow_mut().board_mut(board).hash_clock = enable;
        Ok(())
    }

    fn set_supply_enable(&mut self, board: usize, enable: bool) -> error::Result<()> {
        let mut sim = self.0.borrow_mut();
        let cores = sim.variant.cores;
        let sim_board = sim.board_mut(board);
        if !enable {
            // chips lose their state
            for chip in sim_board.chips.iter_mut() {
                chip.cores = vec![SimCore::new(); cores];
            }
        }
        sim_board.supply = enable;
        Ok(())
    }

    fn set_supply_level(&mut self, board: usize, level: EpotLevel) -> error::Result<()> {
        self.0.borrow_mut().board_mut(board).level = level;
        Ok(())
    }

    fn supply_level(&mut self, board: usize) -> error::Result<EpotLevel> {
        Ok(self.0.borrow().board(board).level)
    }

    fn check_voltages(&mut self, board: usize) -> error::Result<()> {
        if self.0.borrow().board(board).voltage_fault {
            Err(ErrorKind::Hashboard(
                board,
                "system voltages out of range".to_string(),
            ))?
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transfer::{Dispatcher, ManualTimer, Target};
    use crate::variant::{DCR1, SC1};

    #[test]
    fn test_silent_chip_reads_zero() {
        let (bus, mut boards) = SimController::new(DCR1)
            .with_uniform_board(0, 20)
            .split();
        let mut dispatcher = Dispatcher::new(bus, ManualTimer::new(), DCR1);
        boards.set_supply_enable(0, true).unwrap();
        boards.set_supply_level(0, EpotLevel::new(25).unwrap()).unwrap();
        dispatcher.write(0, Target::Chip(3), 0x2f, 0x1234).unwrap();
        assert_eq!(dispatcher.read(0, 3, 7, 0x2f).unwrap(), 0);

        boards.set_supply_level(0, EpotLevel::new(20).unwrap()).unwrap();
        dispatcher.write(0, Target::Chip(3), 0x2f, 0x1234).unwrap();
        assert_eq!(dispatcher.read(0, 3, 7, 0x2f).unwrap(), 0x1234);
    }

    #[test]
    fn test_read_erratum_round_trip() {
        let variant = DCR1.with_read_erratum(1);
        let (bus, mut boards) = SimController::new(variant)
            .with_uniform_board(1, 30)
            .split();
        let mut dispatcher = Dispatcher::new(bus, ManualTimer::new(), variant);
        boards.set_supply_enable(1, true).unwrap();
        boards.set_supply_level(1, EpotLevel::new(30).unwrap()).unwrap();
        dispatcher.write(1, Target::All, 0x2f, 0x0f80_0008).unwrap();
        assert_eq!(dispatcher.read(1, 14, 7, 0x2f).unwrap(), 0x0f80_0008);
        // the top bit falls off with the erratum shift
        dispatcher.write(1, Target::All, 0x10, 0xf00f_6688).unwrap();
        assert_eq!(dispatcher.read(1, 0, 0, 0x10).unwrap(), 0x700f_6688);
    }

    #[test]
    fn test_unpowered_string_asserts_all_lines() {
        let (_, mut boards) = SimController::new(SC1).with_uniform_board(0, 30).split();
        assert_eq!(boards.read_done_lines(0).unwrap(), 0xffff);
        boards.set_supply_enable(0, true).unwrap();
        assert_eq!(boards.read_done_lines(0).unwrap(), 0);
        assert!(!boards.is_present(1));
    }
}
