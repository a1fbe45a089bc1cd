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

//! String start up: voltage ramp until every chip answers, then device initialization
//!
//! All chips of a string share one supply and their wake up thresholds differ. The ramp
//! starts low and raises the voltage one e-pot count at a time, probing the whole string
//! after every step, until all chips respond or the voltage floor is reached.

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::hashboard::{EpotLevel, Hashboard};
use crate::ocr::ChipTuning;
use crate::transfer::{Backend, Dispatcher, Target, Timer};
use crate::variant::{ecr, fcr, ChipVariant, Model, MAX_BOARDS, NUM_V_REGS};

use serde::{Deserialize, Serialize};

use std::task::Poll;
use std::time::Duration;

/// Supply level the ramp starts at (low voltage)
pub const DEFAULT_STARTUP_LEVEL: EpotLevel = EpotLevel(30);

/// Highest voltage the ramp may reach
pub const DEFAULT_FLOOR_LEVEL: EpotLevel = EpotLevel(17);

/// Safety margin in e-pot counts added once every chip answers
pub const DEFAULT_BOOST: u8 = 10;

/// Wait for the supply to stabilize after each change
pub const DEFAULT_SUPPLY_SETTLE: Duration = Duration::from_millis(200);

/// Additional probes of a chip that answered with a near miss
pub const DEFAULT_PROBE_RETRIES: usize = 1;

const M_CHECK_PASSES: usize = 8;
const M_CHECK_READ_RETRIES: usize = 5;
/// M registers M0..M2 (minus the reserved one) take part in the check
const M_CHECK_REGISTERS: usize = 3;

/// Which cores get their clock enabled at the end of device initialization
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoreClockPolicy {
    /// Only the last core of the last oscillator group, used for single core jobs
    LastCoreOnly,
    All,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationSettings {
    pub startup_level: EpotLevel,
    pub floor: EpotLevel,
    pub boost: u8,
    pub supply_settle: Duration,
    pub probe_retries: usize,
    pub m_register_check: bool,
    pub core_clock: CoreClockPolicy,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            startup_level: DEFAULT_STARTUP_LEVEL,
            floor: DEFAULT_FLOOR_LEVEL,
            boost: DEFAULT_BOOST,
            supply_settle: DEFAULT_SUPPLY_SETTLE,
            probe_retries: DEFAULT_PROBE_RETRIES,
            m_register_check: false,
            core_clock: CoreClockPolicy::LastCoreOnly,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    NotInitialized,
    Ready,
    Failure,
}

/// What is known about one hash board and its string
#[derive(Clone, Debug, PartialEq)]
pub struct BoardCalibrationState {
    pub board: usize,
    pub present: bool,
    pub model: Model,
    /// One bit per chip that answered the last probe
    pub pass_flags: u16,
    pub awake: usize,
    pub level: Option<EpotLevel>,
    pub tuning: Vec<ChipTuning>,
    pub status: BoardStatus,
}

impl BoardCalibrationState {
    pub fn new(board: usize, present: bool, variant: &ChipVariant) -> Self {
        Self {
            board,
            present,
            model: variant.model,
            pass_flags: 0,
            awake: 0,
            level: None,
            tuning: vec![ChipTuning::default(); variant.chips],
            status: BoardStatus::NotInitialized,
        }
    }

    /// Forget everything learned about the string, presence is kept
    pub fn reset(&mut self) {
        self.pass_flags = 0;
        self.awake = 0;
        self.level = None;
        for tuning in self.tuning.iter_mut() {
            *tuning = ChipTuning::default();
        }
        self.status = BoardStatus::NotInitialized;
    }

    /// Record probe result of `chip`, returns `true` when the chip changed its state
    pub fn mark(&mut self, chip: usize, pass: bool) -> bool {
        let bit = 1u16 << chip;
        let was_passing = self.pass_flags & bit != 0;
        if was_passing == pass {
            return false;
        }
        if pass {
            self.pass_flags |= bit;
            self.awake += 1;
        } else {
            self.pass_flags &= !bit;
            self.awake -= 1;
        }
        true
    }

    pub fn failed_chips(&self) -> Vec<usize> {
        (0..self.tuning.len())
            .filter(|chip| self.pass_flags & (1 << chip) == 0)
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    Pass,
    /// Some bits came back right, the chip is close to waking up
    NearMiss,
    /// Nothing came back at all
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Ready,
    /// Floor reached with some chips still silent, supply stays on
    Partial,
    /// Floor reached and no chip answered, supply turned off
    Dead,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationReport {
    pub board: usize,
    pub outcome: CalibrationOutcome,
    pub level: EpotLevel,
    pub failed_chips: Vec<usize>,
}

/// Make sure `board` can be driven at all
pub fn check_board<H: Hashboard>(hashboard: &H, board: usize) -> error::Result<()> {
    if board >= MAX_BOARDS {
        Err(ErrorKind::Unsupported(format!(
            "hash board {} out of range 0..{}",
            board, MAX_BOARDS
        )))?
    }
    if !hashboard.is_present(board) {
        Err(ErrorKind::NotFound(format!("hash board {} not present", board)))?
    }
    Ok(())
}

/// Load the start up value into the oscillator register of `chip` and read it back
pub fn probe_chip<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
) -> error::Result<ProbeResult> {
    let variant = *dispatcher.variant();
    let (slow, _) = variant.osc.split(variant.osc.slow);
    if let Some(ocr_high) = variant.regs.ocr_high {
        dispatcher.write(board, Target::Chip(chip), ocr_high, 0)?;
    }
    dispatcher.write(board, Target::Chip(chip), variant.regs.ocr, slow)?;

    let core = variant.osc_group_core(0);
    let value = dispatcher.read(board, chip, core, variant.regs.ocr)?;
    let mask = variant.data_mask() >> variant.read_shift_for(core, variant.regs.ocr);
    let result = if value == slow & mask {
        ProbeResult::Pass
    } else if value == 0 || value == mask {
        ProbeResult::Dead
    } else {
        ProbeResult::NearMiss
    };
    trace!(
        "Hashboard {} chip {}: OCR {:#x} -> {:?}",
        board,
        chip,
        value,
        result
    );
    Ok(result)
}

fn probe_with_retry<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
    retries: usize,
) -> error::Result<bool> {
    for _ in 0..=retries {
        match probe_chip(dispatcher, board, chip)? {
            ProbeResult::Pass => return Ok(true),
            ProbeResult::Dead => return Ok(false),
            ProbeResult::NearMiss => continue,
        }
    }
    Ok(false)
}

/// Write/read back test of the M registers in every core of `chip`
///
/// Returns `false` on the first core that does not return the written pattern.
pub fn check_m_registers<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
) -> error::Result<bool> {
    let variant = *dispatcher.variant();
    let registers: Vec<_> = variant
        .regs
        .m_addresses()
        .filter(|(index, _)| *index < M_CHECK_REGISTERS)
        .map(|(_, address)| address)
        .collect();

    for register in registers {
        let mask = variant.data_mask() >> variant.read_shift_for(0, register);
        let mut pattern = variant.m_check_pattern;
        for _ in 0..M_CHECK_PASSES {
            dispatcher.write(board, Target::Chip(chip), register, pattern)?;
            for core in 0..variant.cores {
                let mut passed = false;
                for retry in 0..M_CHECK_READ_RETRIES {
                    if dispatcher.read(board, chip, core, register)? == pattern & mask {
                        passed = true;
                        break;
                    }
                    trace!(
                        "Hashboard {} chip {} core {:#x} M register {:#x} retry {}",
                        board,
                        chip,
                        core,
                        register,
                        retry + 1
                    );
                }
                if !passed {
                    warn!(
                        "Hashboard {} chip {} core {:#x}: M register {:#x} check failed",
                        board, chip, core, register
                    );
                    return Ok(false);
                }
            }
            pattern >>= 1;
        }
    }
    Ok(true)
}

/// Put every chip of the string into a known idle state with the selected core clocks
/// running
///
/// Calling this repeatedly on an idle string always ends in the same register state.
pub fn initialize_device<B: Backend, T: Timer, H: Hashboard>(
    dispatcher: &mut Dispatcher<B, T>,
    hashboard: &mut H,
    board: usize,
    policy: CoreClockPolicy,
) -> error::Result<()> {
    let variant = *dispatcher.variant();
    let regs = variant.regs;
    let defaults = variant.defaults;
    let osc = variant.osc;
    let all = Target::All;

    dispatcher.write(board, all, regs.fcr, fcr::MASK_ALL)?;
    hashboard.set_hash_clock(board, false)?;
    if let Some(ocr_high) = regs.ocr_high {
        dispatcher.write(board, all, ocr_high, 0)?;
    }
    let (slow, _) = osc.split(osc.slow);
    dispatcher.write(board, all, regs.ocr, slow | osc.core_enable)?;
    dispatcher.write(board, all, regs.ecr, 0)?;

    dispatcher.write(board, all, regs.limits, defaults.limits)?;
    if let (Some(step), Some(value)) = (regs.step, defaults.step) {
        dispatcher.write(board, all, step, value)?;
    }
    dispatcher.write(board, all, regs.lb, 0)?;
    dispatcher.write(board, all, regs.ub, 0)?;
    for i in 0..NUM_V_REGS {
        dispatcher.write(board, all, regs.v_address(i), defaults.v[i])?;
    }
    dispatcher.write(board, all, regs.v0_match, defaults.v0_match)?;
    if let (Some(v8_match), Some(value)) = (regs.v8_match, defaults.v8_match) {
        dispatcher.write(board, all, v8_match, value)?;
    }
    for (_, address) in regs.m_addresses() {
        dispatcher.write(board, all, address, 0)?;
    }

    // engine reset needs a running clock to propagate
    dispatcher.write(board, all, regs.ecr, ecr::RESET_SPI_FSM | ecr::RESET_CORE)?;
    hashboard.set_hash_clock(board, true)?;
    dispatcher.delay(variant.reset_settle);
    dispatcher.write(board, all, regs.ecr, 0)?;
    hashboard.set_hash_clock(board, false)?;

    dispatcher.write(board, all, regs.ocr, slow)?;
    let init = osc.split(osc.init).0;
    match policy {
        CoreClockPolicy::LastCoreOnly => {
            let core = variant.osc_group_core(osc.groups - 1);
            for chip in 0..variant.chips {
                let target = Target::Core { chip, core };
                if let Some(ocr_high) = regs.ocr_high {
                    dispatcher.write(board, target, ocr_high, 0)?;
                }
                dispatcher.write(board, target, regs.ocr, osc.last_core_enable() | init)?;
            }
        }
        CoreClockPolicy::All => {
            dispatcher.write(board, all, regs.ocr, osc.core_enable | init)?;
        }
    }
    hashboard.set_hash_clock(board, true)?;

    let done = hashboard.read_done_lines(board)? & variant.chip_mask();
    let nonce = hashboard.read_nonce_lines(board)? & variant.chip_mask();
    if done != 0 || nonce != 0 {
        Err(ErrorKind::Failure(format!(
            "DONE {:#06x} / NONCE {:#06x} asserted after initialization",
            done, nonce
        )))?
    }
    dispatcher.write(board, all, regs.fcr, fcr::MASK_ALL)?;
    debug!("Hashboard {}: device initialized ({:?})", board, policy);
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
enum Phase {
    PowerUp,
    /// Supply has been changed, probe once it settles
    Settling { deadline: Duration },
    /// All chips answered and the safety margin has been applied
    Boosting { deadline: Duration },
    Finished(CalibrationReport),
}

/// Voltage ramp of one string as a step function
///
/// Each call to [`poll`](Self::poll) does a bounded amount of bus work. While the supply
/// settles the caller is free to service other boards.
pub struct StringCalibration {
    settings: CalibrationSettings,
    state: BoardCalibrationState,
    phase: Phase,
}

impl StringCalibration {
    pub fn new(board: usize, variant: &ChipVariant, settings: CalibrationSettings) -> Self {
        Self {
            settings,
            state: BoardCalibrationState::new(board, true, variant),
            phase: Phase::PowerUp,
        }
    }

    pub fn state(&self) -> &BoardCalibrationState {
        &self.state
    }

    pub fn into_state(self) -> BoardCalibrationState {
        self.state
    }

    /// Time the next poll has something to do
    pub fn deadline(&self) -> Option<Duration> {
        match self.phase {
            Phase::Settling { deadline } | Phase::Boosting { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn poll<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Poll<CalibrationReport>> {
        let result = self.step(dispatcher, hashboard);
        if result.is_err() {
            self.state.status = BoardStatus::Failure;
        }
        result
    }

    fn step<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Poll<CalibrationReport>> {
        let board = self.state.board;
        match self.phase.clone() {
            Phase::PowerUp => {
                hashboard.set_hash_clock(board, false)?;
                self.set_level(dispatcher, hashboard, self.settings.startup_level)?;
                hashboard.set_supply_enable(board, true)?;
                hashboard.check_voltages(board)?;
                info!(
                    "Hashboard {}: supply enabled at level {}",
                    board, self.settings.startup_level
                );
                Ok(Poll::Pending)
            }
            Phase::Settling { deadline } => {
                if dispatcher.now() < deadline {
                    return Ok(Poll::Pending);
                }
                self.probe_string(dispatcher, hashboard)
            }
            Phase::Boosting { deadline } => {
                if dispatcher.now() < deadline {
                    return Ok(Poll::Pending);
                }
                self.finish_ready(dispatcher, hashboard).map(Poll::Ready)
            }
            Phase::Finished(report) => Ok(Poll::Ready(report)),
        }
    }

    fn set_level<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
        level: EpotLevel,
    ) -> error::Result<()> {
        let board = self.state.board;
        hashboard.set_supply_level(board, level)?;
        let actual = hashboard.supply_level(board)?;
        if actual != level {
            Err(ErrorKind::Failure(format!(
                "supply level reads back {} instead of {}",
                actual, level
            )))?
        }
        self.state.level = Some(level);
        self.phase = Phase::Settling {
            deadline: dispatcher.now() + self.settings.supply_settle,
        };
        Ok(())
    }

    fn probe_string<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Poll<CalibrationReport>> {
        let board = self.state.board;
        let chips = dispatcher.variant().chips;
        let level = self
            .state
            .level
            .expect("BUG: probing string without supply level");

        for chip in 0..chips {
            let pass = probe_with_retry(dispatcher, board, chip, self.settings.probe_retries)?;
            if self.state.mark(chip, pass) {
                if pass {
                    info!("Hashboard {}: chip {} awake at level {}", board, chip, level);
                } else {
                    warn!("Hashboard {}: chip {} lost at level {}", board, chip, level);
                }
            }
        }

        if self.state.awake == chips {
            let boosted = level
                .raised(self.settings.boost, self.settings.floor)
                .unwrap_or(self.settings.floor);
            info!(
                "Hashboard {}: all {} chips awake at level {}, boosting to {}",
                board, chips, level, boosted
            );
            self.set_level(dispatcher, hashboard, boosted)?;
            let deadline = dispatcher.now() + self.settings.supply_settle;
            self.phase = Phase::Boosting { deadline };
            return Ok(Poll::Pending);
        }

        match level.raised(1, self.settings.floor) {
            Some(next) => {
                debug!(
                    "Hashboard {}: {} of {} chips awake, stepping level {} -> {}",
                    board, self.state.awake, chips, level, next
                );
                self.set_level(dispatcher, hashboard, next)?;
                Ok(Poll::Pending)
            }
            None => self.finish_failed(hashboard, level).map(Poll::Ready),
        }
    }

    fn finish_failed<H: Hashboard>(
        &mut self,
        hashboard: &mut H,
        level: EpotLevel,
    ) -> error::Result<CalibrationReport> {
        let board = self.state.board;
        let failed_chips = self.state.failed_chips();
        let outcome = if self.state.awake == 0 {
            hashboard.set_supply_enable(board, false)?;
            error!("Hashboard {}: no chip answers, supply disabled", board);
            CalibrationOutcome::Dead
        } else {
            error!(
                "Hashboard {}: chips {:?} do not answer at level {}",
                board, failed_chips, level
            );
            CalibrationOutcome::Partial
        };
        self.state.status = BoardStatus::Failure;
        Ok(self.finish(CalibrationReport {
            board,
            outcome,
            level,
            failed_chips,
        }))
    }

    fn finish_ready<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<CalibrationReport> {
        let board = self.state.board;
        let level = self
            .state
            .level
            .expect("BUG: finishing calibration without supply level");

        if self.settings.m_register_check {
            for chip in 0..dispatcher.variant().chips {
                if !check_m_registers(dispatcher, board, chip)? {
                    self.state.mark(chip, false);
                }
            }
            if self.state.awake < dispatcher.variant().chips {
                let failed_chips = self.state.failed_chips();
                error!(
                    "Hashboard {}: M register check failed on chips {:?}",
                    board, failed_chips
                );
                self.state.status = BoardStatus::Failure;
                return Ok(self.finish(CalibrationReport {
                    board,
                    outcome: CalibrationOutcome::Partial,
                    level,
                    failed_chips,
                }));
            }
        }

        initialize_device(dispatcher, hashboard, board, self.settings.core_clock)?;
        self.state.status = BoardStatus::Ready;
        info!("Hashboard {}: string ready at level {}", board, level);
        Ok(self.finish(CalibrationReport {
            board,
            outcome: CalibrationOutcome::Ready,
            level,
            failed_chips: vec![],
        }))
    }

    fn finish(&mut self, report: CalibrationReport) -> CalibrationReport {
        self.phase = Phase::Finished(report.clone());
        report
    }
}

/// Run the whole ramp of one string, sleeping through the settle phases
pub fn calibrate_string<B: Backend, T: Timer, H: Hashboard>(
    dispatcher: &mut Dispatcher<B, T>,
    hashboard: &mut H,
    board: usize,
    settings: CalibrationSettings,
) -> error::Result<(CalibrationReport, BoardCalibrationState)> {
    check_board(hashboard, board)?;
    let variant = *dispatcher.variant();
    let mut calibration = StringCalibration::new(board, &variant, settings);
    loop {
        if let Poll::Ready(report) = calibration.poll(dispatcher, hashboard)? {
            return Ok((report, calibration.into_state()));
        }
        if let Some(deadline) = calibration.deadline() {
            let now = dispatcher.now();
            if deadline > now {
                dispatcher.delay(deadline - now);
            }
        }
    }
}
