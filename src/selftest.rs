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

//! Sweep of the sample jobs over every chip of every initialized board
//!
//! The last core of each chip computes every sample job and the reported solution is
//! compared with the known one. Any failure restarts the sweep from the first job.

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::hashboard::Hashboard;
use crate::job::{self, Job};
use crate::lifecycle::{JobCycle, JobSettings};
use crate::transfer::{Backend, Dispatcher, Target, Timer};

use std::task::Poll;

/// How many times the sweep may start over before giving up
pub const DEFAULT_MAX_RESTARTS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NewJob,
    SetTarget,
    Load,
    Start,
    WaitForDone,
    ReadNonce,
    NextChip,
    NextBoard,
    NextJob,
    Finished,
}

/// Position of the sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursor {
    pub job: usize,
    /// Index into the list of boards under test
    pub board: usize,
    pub chip: usize,
}

/// Result of the effect of one phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Pending,
    Failed,
}

/// Size of the sweep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape {
    pub jobs: usize,
    pub boards: usize,
    pub chips: usize,
}

/// Transition function of the sweep
pub fn transition(phase: Phase, cursor: Cursor, outcome: Outcome, shape: Shape) -> (Phase, Cursor) {
    match outcome {
        Outcome::Failed => return (Phase::NewJob, Cursor::default()),
        Outcome::Pending => return (phase, cursor),
        Outcome::Done => (),
    }
    match phase {
        Phase::NewJob => (
            Phase::SetTarget,
            Cursor {
                board: 0,
                chip: 0,
                ..cursor
            },
        ),
        Phase::SetTarget => (Phase::Load, cursor),
        Phase::Load => (Phase::Start, cursor),
        Phase::Start => (Phase::WaitForDone, cursor),
        Phase::WaitForDone => (Phase::ReadNonce, cursor),
        Phase::ReadNonce => (Phase::NextChip, cursor),
        Phase::NextChip if cursor.chip + 1 < shape.chips => (
            Phase::SetTarget,
            Cursor {
                chip: cursor.chip + 1,
                ..cursor
            },
        ),
        Phase::NextChip => (Phase::NextBoard, cursor),
        Phase::NextBoard if cursor.board + 1 < shape.boards => (
            Phase::SetTarget,
            Cursor {
                board: cursor.board + 1,
                chip: 0,
                ..cursor
            },
        ),
        Phase::NextBoard => (Phase::NextJob, cursor),
        Phase::NextJob if cursor.job + 1 < shape.jobs => (
            Phase::NewJob,
            Cursor {
                job: cursor.job + 1,
                ..cursor
            },
        ),
        Phase::NextJob | Phase::Finished => (Phase::Finished, cursor),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SelfTestReport {
    /// Solutions that matched
    pub solutions: usize,
    pub restarts: usize,
}

pub struct SelfTest {
    boards: Vec<usize>,
    jobs: &'static [Job],
    shape: Shape,
    phase: Phase,
    cursor: Cursor,
    cycle: JobCycle,
    solution: Option<u64>,
    report: SelfTestReport,
    max_restarts: usize,
}

impl SelfTest {
    pub fn new<B: Backend, T: Timer>(
        dispatcher: &Dispatcher<B, T>,
        boards: Vec<usize>,
        settings: JobSettings,
    ) -> Self {
        let variant = *dispatcher.variant();
        let jobs = job::sample_jobs(variant.model);
        let first_board = boards.first().cloned().unwrap_or(0);
        Self {
            shape: Shape {
                jobs: jobs.len(),
                boards: boards.len(),
                chips: variant.chips,
            },
            boards,
            jobs,
            phase: Phase::NewJob,
            cursor: Cursor::default(),
            cycle: JobCycle::new(first_board, 0, variant.last_core(), settings),
            solution: None,
            report: SelfTestReport::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Execute the current phase and move on
    pub fn step<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Poll<SelfTestReport>> {
        if self.shape.boards == 0 || self.shape.jobs == 0 {
            Err(ErrorKind::InvalidArgument(
                "self test needs at least one board and one job".to_string(),
            ))?
        }
        if self.phase == Phase::Finished {
            return Ok(Poll::Ready(self.report.clone()));
        }

        let outcome = match self.effect(dispatcher, hashboard) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "Self test failed at {:?} {:?}: {}",
                    self.phase, self.cursor, e
                );
                if self.report.restarts >= self.max_restarts {
                    return Err(e);
                }
                self.report.restarts += 1;
                self.report.solutions = 0;
                self.cycle.reset();
                Outcome::Failed
            }
        };
        let (phase, cursor) = transition(self.phase, self.cursor, outcome, self.shape);
        self.phase = phase;
        self.cursor = cursor;

        if self.phase == Phase::Finished {
            info!(
                "Self test finished: {} solutions, {} restarts",
                self.report.solutions, self.report.restarts
            );
            return Ok(Poll::Ready(self.report.clone()));
        }
        Ok(Poll::Pending)
    }

    fn effect<B: Backend, T: Timer, H: Hashboard>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        hashboard: &mut H,
    ) -> error::Result<Outcome> {
        let board = self.boards[self.cursor.board];
        let jobs = self.jobs;
        let job = &jobs[self.cursor.job];
        match self.phase {
            Phase::NewJob => {
                info!("Self test: sample job {}", self.cursor.job);
            }
            Phase::SetTarget => {
                let core = dispatcher.variant().last_core();
                self.cycle = JobCycle::new(
                    board,
                    self.cursor.chip,
                    core,
                    self.cycle_settings(),
                );
            }
            Phase::Load => {
                self.cycle
                    .preload(dispatcher, job, Target::Chip(self.cursor.chip))?;
            }
            Phase::Start => {
                self.solution = None;
                self.cycle.start(dispatcher, hashboard)?;
            }
            Phase::WaitForDone => match self.cycle.poll(dispatcher, hashboard)? {
                Poll::Pending => return Ok(Outcome::Pending),
                Poll::Ready(solution) => self.solution = solution,
            },
            Phase::ReadNonce => {
                if self.solution != job.expected_solution {
                    Err(ErrorKind::Failure(format!(
                        "board {} chip {}: solution {:x?} instead of {:x?}",
                        board, self.cursor.chip, self.solution, job.expected_solution
                    )))?
                }
                debug!(
                    "Self test: board {} chip {} solved job {}",
                    board, self.cursor.chip, self.cursor.job
                );
                self.report.solutions += 1;
            }
            Phase::NextChip | Phase::NextBoard | Phase::NextJob | Phase::Finished => (),
        }
        Ok(Outcome::Done)
    }

    fn cycle_settings(&self) -> JobSettings {
        self.cycle.settings().clone()
    }
}

/// Run the sweep to completion, sleeping between polls of a running job
pub fn run_selftest<B: Backend, T: Timer, H: Hashboard>(
    dispatcher: &mut Dispatcher<B, T>,
    hashboard: &mut H,
    boards: Vec<usize>,
    settings: JobSettings,
) -> error::Result<SelfTestReport> {
    let poll_period = settings.data_valid_poll;
    let mut selftest = SelfTest::new(dispatcher, boards, settings);
    loop {
        if let Poll::Ready(report) = selftest.step(dispatcher, hashboard)? {
            return Ok(report);
        }
        if selftest.phase() == Phase::WaitForDone {
            dispatcher.delay(poll_period);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SHAPE: Shape = Shape {
        jobs: 2,
        boards: 2,
        chips: 2,
    };

    fn run_to_end(mut phase: Phase, mut cursor: Cursor) -> Vec<(Phase, Cursor)> {
        let mut visited = vec![];
        while phase != Phase::Finished {
            let next = transition(phase, cursor, Outcome::Done, SHAPE);
            phase = next.0;
            cursor = next.1;
            visited.push(next);
        }
        visited
    }

    #[test]
    fn test_sweep_visits_every_chip_of_every_board_for_every_job() {
        let visited = run_to_end(Phase::NewJob, Cursor::default());
        let starts: Vec<_> = visited
            .iter()
            .filter(|(phase, _)| *phase == Phase::Start)
            .map(|(_, cursor)| (cursor.job, cursor.board, cursor.chip))
            .collect();
        assert_eq!(
            starts,
            vec![
                (0, 0, 0),
                (0, 0, 1),
                (0, 1, 0),
                (0, 1, 1),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
                (1, 1, 1),
            ]
        );
    }

    #[test]
    fn test_failure_restarts_from_first_job() {
        let cursor = Cursor {
            job: 1,
            board: 1,
            chip: 1,
        };
        assert_eq!(
            transition(Phase::Start, cursor, Outcome::Failed, SHAPE),
            (Phase::NewJob, Cursor::default())
        );
    }

    #[test]
    fn test_pending_stays_put() {
        let cursor = Cursor {
            job: 0,
            board: 1,
            chip: 0,
        };
        assert_eq!(
            transition(Phase::WaitForDone, cursor, Outcome::Pending, SHAPE),
            (Phase::WaitForDone, cursor)
        );
    }

    #[test]
    fn test_finished_is_terminal() {
        let cursor = Cursor::default();
        assert_eq!(
            transition(Phase::Finished, cursor, Outcome::Done, SHAPE).0,
            Phase::Finished
        );
    }
}
