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

//! Life cycle of one job on one core
//!
//! `Idle -> Preloaded -> Started -> AwaitingSolution -> SolutionReady -> Idle`
//!
//! Waiting for the core to finish is a state the caller re-polls, so one thread can keep
//! many cores of many boards busy. Register level handshakes (data valid, read complete)
//! are short and bounded and are executed in place.

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::hashboard::Hashboard;
use crate::job::{self, Job};
use crate::transfer::{Backend, Dispatcher, Target, Timer};
use crate::variant::{ecr, esr, fcr, ivr, CHIP_REGISTER_CORE, NUM_FIFO_REGS};

use std::task::Poll;
use std::time::Duration;

/// Bound of the wait for a core to pick up valid data
pub const DEFAULT_DATA_VALID_TIMEOUT: Duration = Duration::from_secs(1);

/// Polling period of the engine status while waiting for the core to pick up data
pub const DEFAULT_DATA_VALID_POLL: Duration = Duration::from_millis(1);

/// Maximum time it takes to compute one job under normal circumstances
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

/// Length of the blind data valid pulse on chips with unreliable reads
const BLIND_DATA_VALID_PULSE: Duration = Duration::from_micros(10);

/// Length of the read complete pulse
const READ_COMPLETE_PULSE: Duration = Duration::from_micros(50);

/// What to do about DONE/NONCE lines still asserted after a solution has been read
///
/// Lines of one board are shared by all cores of all chips, a busy neighbour keeps them
/// asserted. Every line asserted at once is what an unpowered string looks like and is
/// always a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidualPolicy {
    /// Any residual line is a failure, for single chip testing
    Strict,
    /// Up to `max_residual` asserted chip lines are logged and ignored
    Tolerant { max_residual: u32 },
}

impl ResidualPolicy {
    /// Most permissive policy for a string of `chips` chips
    pub fn tolerant(chips: usize) -> Self {
        ResidualPolicy::Tolerant {
            max_residual: chips.saturating_sub(1) as u32,
        }
    }

    /// Check `lines` (DONE | NONCE) masked to the chips of the string
    pub fn check(&self, lines: u16, chip_mask: u16) -> error::Result<()> {
        let residual = lines & chip_mask;
        if residual == 0 {
            return Ok(());
        }
        let count = residual.count_ones();
        let tolerated = match *self {
            ResidualPolicy::Strict => false,
            ResidualPolicy::Tolerant { max_residual } => {
                count <= max_residual && residual != chip_mask
            }
        };
        if !tolerated {
            Err(ErrorKind::Failure(format!(
                "{} residual DONE/NONCE lines asserted: {:#06x}",
                count, residual
            )))?
        }
        debug!("Ignoring residual DONE/NONCE lines {:#06x}", residual);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobSettings {
    pub data_valid_timeout: Duration,
    pub data_valid_poll: Duration,
    pub completion_timeout: Duration,
    /// Verify DONE/NONCE of the target chip are clear before data valid
    pub check_lines_before_start: bool,
    pub residual: ResidualPolicy,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            data_valid_timeout: DEFAULT_DATA_VALID_TIMEOUT,
            data_valid_poll: DEFAULT_DATA_VALID_POLL,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            check_lines_before_start: true,
            residual: ResidualPolicy::Strict,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobState {
    Idle,
    Preloaded,
    Started,
    AwaitingSolution { deadline: Duration },
    SolutionReady,
    /// Unrecoverable failure, only [`JobEvent::Reset`] leaves this state
    Error(ErrorKind),
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Preloaded,
    Started,
    Waiting { deadline: Duration },
    DoneObserved,
    SolutionRead,
    TimedOut,
    Failed(ErrorKind),
    Reset,
}

impl JobState {
    /// Transition function of the life cycle, events that make no sense in the current
    /// state end up in [`JobState::Error`]
    pub fn next(self, event: JobEvent) -> JobState {
        match (self, event) {
            (_, JobEvent::Reset) => JobState::Idle,
            (JobState::Error(kind), _) => JobState::Error(kind),
            (_, JobEvent::Failed(kind)) => JobState::Error(kind),
            (JobState::Idle, JobEvent::Preloaded) => JobState::Preloaded,
            (JobState::Preloaded, JobEvent::Started) => JobState::Started,
            (JobState::Started, JobEvent::Waiting { deadline }) => {
                JobState::AwaitingSolution { deadline }
            }
            (JobState::Idle, JobEvent::TimedOut)
            | (JobState::Preloaded, JobEvent::TimedOut)
            | (JobState::Started, JobEvent::TimedOut) => JobState::Idle,
            (JobState::AwaitingSolution { .. }, JobEvent::DoneObserved) => JobState::SolutionReady,
            (JobState::AwaitingSolution { .. }, JobEvent::TimedOut) => JobState::Idle,
            (JobState::SolutionReady, JobEvent::SolutionRead) => JobState::Idle,
            (state, event) => JobState::Error(ErrorKind::InvalidArgument(format!(
                "event {:?} in state {:?}",
                event, state
            ))),
        }
    }
}

/// Assert valid data and wait until the core reports busy or done, valid data is released
/// on every path
pub fn pulse_data_valid<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
    core: usize,
    settings: &JobSettings,
) -> error::Result<()> {
    let regs = dispatcher.variant().regs;
    let target = Target::Core { chip, core };
    dispatcher.write(board, target, regs.ecr, ecr::VALID_DATA)?;

    let result = if dispatcher.variant().read_shift > 0 {
        // status read back is unreliable, time the pulse instead
        dispatcher.delay(BLIND_DATA_VALID_PULSE);
        Ok(())
    } else {
        wait_for_engine(dispatcher, board, chip, core, settings)
    };

    let released = dispatcher.write(board, target, regs.ecr, 0);
    result.and(released)
}

fn wait_for_engine<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
    core: usize,
    settings: &JobSettings,
) -> error::Result<()> {
    let esr_register = dispatcher.variant().regs.esr;
    let deadline = dispatcher.now() + settings.data_valid_timeout;
    loop {
        let status = dispatcher.read(board, chip, core, esr_register)?;
        if status & (esr::DONE | esr::BUSY) != 0 {
            return Ok(());
        }
        if dispatcher.now() >= deadline {
            Err(ErrorKind::Timeout(format!(
                "chip {} core {} did not start within {:?}",
                chip, core, settings.data_valid_timeout
            )))?
        }
        dispatcher.delay(settings.data_valid_poll);
    }
}

/// Assert and release read complete, clears DONE of the addressed cores
pub fn pulse_read_complete<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    target: Target,
) -> error::Result<()> {
    let ecr_register = dispatcher.variant().regs.ecr;
    dispatcher.write(board, target, ecr_register, ecr::READ_COMPLETE)?;
    dispatcher.delay(READ_COMPLETE_PULSE);
    dispatcher.write(board, target, ecr_register, 0)
}

/// Drain every valid FIFO entry of one core and acknowledge them
pub fn read_nonces<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
    core: usize,
) -> error::Result<Vec<u64>> {
    let regs = dispatcher.variant().regs;
    let status = dispatcher.read(board, chip, core, regs.fsr)? & 0xff;
    let mut nonces = Vec::with_capacity(status.count_ones() as usize);
    for slot in (0..NUM_FIFO_REGS).filter(|i| status & (1 << i) != 0) {
        nonces.push(dispatcher.read(board, chip, core, regs.fdr_address(slot))?);
    }
    pulse_read_complete(dispatcher, board, Target::Core { chip, core })?;
    Ok(nonces)
}

fn engine_mask<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
    first_register: u8,
) -> error::Result<u128> {
    let variant = *dispatcher.variant();
    let bits = variant.data_bytes * 8;
    let mut mask = 0u128;
    for word in 0..variant.regs.engine_words {
        let value = dispatcher.read(board, chip, CHIP_REGISTER_CORE, first_register + word as u8)?;
        mask |= (value as u128) << (word * bits);
    }
    Ok(mask)
}

/// One bit per core of `chip` that has finished its job
pub fn done_engines<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
) -> error::Result<u128> {
    let edr0 = dispatcher.variant().regs.edr0;
    engine_mask(dispatcher, board, chip, edr0)
}

/// One bit per core of `chip` that is computing
pub fn busy_engines<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chip: usize,
) -> error::Result<u128> {
    let ebr0 = dispatcher.variant().regs.ebr0;
    engine_mask(dispatcher, board, chip, ebr0)
}

/// Job life cycle bound to one core of one chip
pub struct JobCycle {
    board: usize,
    chip: usize,
    core: usize,
    state: JobState,
    settings: JobSettings,
}

impl JobCycle {
    pub fn new(board: usize, chip: usize, core: usize, settings: JobSettings) -> Self {
        Self {
            board,
            chip,
            core,
            state: JobState::Idle,
            settings,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn chip(&self) -> usize {
        self.chip
    }

    pub fn core(&self) -> usize {
        self.core
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Return to `Idle`, required after an error
    pub fn reset(&mut self) {
        self.apply(JobEvent::Reset);
    }

    /// Move the addressing context to another core, only possible when idle
    pub fn retarget(&mut self, chip: usize, core: usize) -> error::Result<()> {
        self.expect_state(|s| *s == JobState::Idle, "retarget")?;
        self.chip = chip;
        self.core = core;
        Ok(())
    }

    fn apply(&mut self, event: JobEvent) {
        let state = std::mem::replace(&mut self.state, JobState::Idle);
        self.state = state.next(event);
    }

    fn expect_state<F>(&self, accepted: F, operation: &str) -> error::Result<()>
    where
        F: Fn(&JobState) -> bool,
    {
        if !accepted(&self.state) {
            Err(ErrorKind::InvalidArgument(format!(
                "cannot {} chip {} core {} in state {:?}",
                operation, self.chip, self.core, self.state
            )))?
        }
        Ok(())
    }

    /// Record the outcome of a state changing operation, timeouts restart the cycle
    fn settle<T>(&mut self, result: error::Result<T>) -> error::Result<T> {
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::Timeout(_) => {
                    warn!(
                        "Hashboard {} chip {} core {}: {}",
                        self.board, self.chip, self.core, e
                    );
                    self.apply(JobEvent::TimedOut);
                }
                kind => self.apply(JobEvent::Failed(kind)),
            }
        }
        result
    }

    fn target(&self) -> Target {
        Target::Core {
            chip: self.chip,
            core: self.core,
        }
    }

    fn line(&self) -> u16 {
        1 << self.chip
    }

    /// Program `job` using `target` addressing, which may cover more than this core
    pub fn preload<B: Backend, T: Timer>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        job: &Job,
        target: Target,
    ) -> error::Result<()> {
        self.expect_state(|s| *s == JobState::Idle, "preload")?;
        let result = job::preload(dispatcher, self.board, target, job);
        self.settle(result)?;
        self.apply(JobEvent::Preloaded);
        Ok(())
    }

    /// Reset and unmask the core, then hand it the preloaded data
    pub fn start<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<()> {
        self.expect_state(|s| *s == JobState::Preloaded, "start")?;
        let result = self.start_inner(dispatcher, hashboard);
        self.settle(result)?;
        self.apply(JobEvent::Started);
        let deadline = dispatcher.now() + self.settings.completion_timeout;
        self.apply(JobEvent::Waiting { deadline });
        Ok(())
    }

    fn start_inner<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<()> {
        let regs = dispatcher.variant().regs;
        let target = self.target();
        dispatcher.write(
            self.board,
            target,
            regs.ecr,
            ecr::RESET_SPI_FSM | ecr::RESET_CORE,
        )?;
        dispatcher.write(self.board, target, regs.ecr, 0)?;
        dispatcher.write(self.board, target, regs.fcr, 0)?;

        if self.settings.check_lines_before_start {
            let lines = hashboard.read_nonce_lines(self.board)?
                | hashboard.read_done_lines(self.board)?;
            if lines & self.line() != 0 {
                if dispatcher.variant().read_shift > 0 {
                    warn!(
                        "Hashboard {} chip {}: DONE/NONCE asserted before start",
                        self.board, self.chip
                    );
                } else {
                    Err(ErrorKind::Failure(format!(
                        "chip {} DONE/NONCE asserted before start",
                        self.chip
                    )))?
                }
            }
        }
        pulse_data_valid(dispatcher, self.board, self.chip, self.core, &self.settings)
    }

    /// Poll for completion, returns the solution once the core is done
    ///
    /// `Ready(None)` means the core exhausted its range without finding a solution.
    pub fn poll<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Poll<Option<u64>>> {
        let deadline = match self.state {
            JobState::AwaitingSolution { deadline } => deadline,
            _ => {
                self.expect_state(|s| *s == JobState::SolutionReady, "poll")?;
                return self.finish(dispatcher, hashboard).map(Poll::Ready);
            }
        };

        let done = hashboard.read_done_lines(self.board);
        let done = self.settle(done)?;
        if done & self.line() != 0 {
            self.apply(JobEvent::DoneObserved);
            return self.finish(dispatcher, hashboard).map(Poll::Ready);
        }
        if dispatcher.now() >= deadline {
            let timeout = Err(ErrorKind::Timeout(format!(
                "no DONE from chip {} within {:?}",
                self.chip, self.settings.completion_timeout
            ))
            .into());
            return self.settle(timeout);
        }
        Ok(Poll::Pending)
    }

    fn finish<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Option<u64>> {
        let result = self.read_solution(dispatcher, hashboard);
        let solution = self.settle(result)?;
        self.apply(JobEvent::SolutionRead);
        Ok(solution)
    }

    fn read_solution<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Option<u64>> {
        let variant = *dispatcher.variant();
        let regs = variant.regs;
        let target = self.target();

        let nonce_lines = hashboard.read_nonce_lines(self.board)?;
        let solution = if nonce_lines & self.line() != 0 {
            let vector = dispatcher.read(self.board, self.chip, CHIP_REGISTER_CORE, regs.ivr)?;
            let core = ((vector & variant.ivr_core_mask) >> ivr::CORE_ID_POS) as usize;
            let pending = vector & ivr::INT_MASK;
            if core != self.core {
                Err(ErrorKind::Failure(format!(
                    "chip {} interrupt from core {:#x}, expected {:#x}",
                    self.chip, core, self.core
                )))?
            }
            if pending != fcr::MASK_D0 {
                Err(ErrorKind::Failure(format!(
                    "chip {} core {:#x} pending FIFO slots {:#04x}, expected exactly the first",
                    self.chip, self.core, pending
                )))?
            }
            let nonce = dispatcher.read(self.board, self.chip, self.core, regs.fdr0)?;
            dispatcher.write(self.board, target, regs.fcr, fcr::MASK_ALL)?;
            Some(nonce)
        } else {
            None
        };

        pulse_read_complete(dispatcher, self.board, target)?;

        let lines = hashboard.read_nonce_lines(self.board)?
            | hashboard.read_done_lines(self.board)?;
        self.settings.residual.check(lines, variant.chip_mask())?;
        Ok(solution)
    }

    /// Blocking convenience around [`poll`](Self::poll)
    pub fn wait_and_read_solution<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Option<u64>> {
        loop {
            if let Poll::Ready(solution) = self.poll(dispatcher, hashboard)? {
                return Ok(solution);
            }
            dispatcher.delay(self.settings.data_valid_poll);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let deadline = Duration::from_secs(5);
        let state = JobState::Idle
            .next(JobEvent::Preloaded)
            .next(JobEvent::Started)
            .next(JobEvent::Waiting { deadline });
        assert_eq!(state, JobState::AwaitingSolution { deadline });
        let state = state.next(JobEvent::DoneObserved);
        assert_eq!(state, JobState::SolutionReady);
        assert_eq!(state.next(JobEvent::SolutionRead), JobState::Idle);
    }

    #[test]
    fn test_timeout_restarts_from_idle() {
        let state = JobState::AwaitingSolution {
            deadline: Duration::from_secs(1),
        };
        assert_eq!(state.next(JobEvent::TimedOut), JobState::Idle);
        assert_eq!(
            JobState::Preloaded.next(JobEvent::TimedOut),
            JobState::Idle,
            "engine that never started"
        );
    }

    #[test]
    fn test_error_is_sticky_until_reset() {
        let kind = ErrorKind::Busy("bus".to_string());
        let state = JobState::Started.next(JobEvent::Failed(kind.clone()));
        assert_eq!(state, JobState::Error(kind.clone()));
        let state = state.next(JobEvent::Preloaded);
        assert_eq!(state, JobState::Error(kind));
        assert_eq!(state.next(JobEvent::Reset), JobState::Idle);
    }

    #[test]
    fn test_out_of_order_event() {
        match JobState::Idle.next(JobEvent::Started) {
            JobState::Error(ErrorKind::InvalidArgument(_)) => (),
            state => panic!("unexpected state {:?}", state),
        }
    }

    #[test]
    fn test_strict_residual_policy() {
        let policy = ResidualPolicy::Strict;
        assert!(policy.check(0, 0x7fff).is_ok());
        assert!(policy.check(0x8000, 0x7fff).is_ok(), "lines outside the string");
        assert!(policy.check(0x0001, 0x7fff).is_err());
    }

    #[test]
    fn test_tolerant_residual_policy_boundary() {
        let policy = ResidualPolicy::Tolerant { max_residual: 3 };
        assert!(policy.check(0b0111, 0x7fff).is_ok());
        assert!(policy.check(0b1111, 0x7fff).is_err());

        let policy = ResidualPolicy::tolerant(15);
        assert_eq!(policy, ResidualPolicy::Tolerant { max_residual: 14 });
        assert!(policy.check(0x3fff, 0x7fff).is_ok());
        assert!(
            policy.check(0x7fff, 0x7fff).is_err(),
            "all lines asserted looks like an unpowered string"
        );
        assert!(policy.check(0xffff, 0x7fff).is_err());
    }
}
