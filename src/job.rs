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

//! Search parameters of one job and their programming into the chips

use crate::error::{self, ErrorKind};
use crate::transfer::{Backend, Dispatcher, Target, Timer};
use crate::variant::{Model, NUM_V_REGS};

use once_cell::sync::Lazy;

use std::ops::Range;

/// Largest M register file of all variants
pub const MAX_M_REGS: usize = 13;

#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    /// M registers indexed by register number, the variant's reserved slot is ignored
    pub m: [u64; MAX_M_REGS],
    /// Per-job V registers, chips keep the values from device initialization when `None`
    pub v: Option<[u64; NUM_V_REGS]>,
    pub lower_bound: u64,
    pub upper_bound: u64,
    /// Per-job V0 match register
    pub match_reg: Option<u64>,
    /// Known solution of test jobs
    pub expected_solution: Option<u64>,
}

impl Job {
    pub fn new(m: [u64; MAX_M_REGS], lower_bound: u64, upper_bound: u64) -> Self {
        Self {
            m,
            v: None,
            lower_bound,
            upper_bound,
            match_reg: None,
            expected_solution: None,
        }
    }
}

/// Write nonce range bounds
pub fn load_range<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    target: Target,
    lower_bound: u64,
    upper_bound: u64,
) -> error::Result<()> {
    if lower_bound > upper_bound {
        Err(ErrorKind::InvalidArgument(format!(
            "lower bound {:#x} above upper bound {:#x}",
            lower_bound, upper_bound
        )))?
    }
    let regs = dispatcher.variant().regs;
    dispatcher.write(board, target, regs.lb, lower_bound)?;
    dispatcher.write(board, target, regs.ub, upper_bound)?;
    Ok(())
}

/// Program `job` into all cores covered by `target`
///
/// Bounds go first, then M registers, V registers and the match register last. The first
/// transfer error aborts the sequence leaving the chips partially programmed.
pub fn preload<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    target: Target,
    job: &Job,
) -> error::Result<()> {
    load_range(dispatcher, board, target, job.lower_bound, job.upper_bound)?;

    let regs = dispatcher.variant().regs;
    for (index, address) in regs.m_addresses() {
        dispatcher.write(board, target, address, job.m[index])?;
    }
    if let Some(v) = job.v.as_ref() {
        for (index, value) in v.iter().enumerate() {
            dispatcher.write(board, target, regs.v_address(index), *value)?;
        }
    }
    if let Some(match_reg) = job.match_reg {
        dispatcher.write(board, target, regs.v0_match, match_reg)?;
    }
    Ok(())
}

/// Split a nonce range into consecutive slices of `per_core` nonces, one for every core of
/// `chips`. Returns the first nonce past the last slice.
pub fn spread_nonce_range<B: Backend, T: Timer>(
    dispatcher: &mut Dispatcher<B, T>,
    board: usize,
    chips: Range<usize>,
    lower_bound: u64,
    per_core: u64,
) -> error::Result<u64> {
    if per_core == 0 {
        Err(ErrorKind::InvalidArgument(
            "nonce range slice must not be empty".to_string(),
        ))?
    }
    let cores = dispatcher.variant().cores;
    let mask = dispatcher.variant().data_mask();
    let mut next = lower_bound;
    for chip in chips {
        for core in 0..cores {
            let upper = match next.checked_add(per_core - 1) {
                Some(upper) if upper <= mask => upper,
                _ => Err(ErrorKind::InvalidArgument(format!(
                    "nonce range overflows at chip {} core {}",
                    chip, core
                )))?,
            };
            load_range(dispatcher, board, Target::Core { chip, core }, next, upper)?;
            next = upper.wrapping_add(1);
        }
    }
    Ok(next)
}

fn m_regs(values: &[(usize, u64)]) -> [u64; MAX_M_REGS] {
    let mut m = [0; MAX_M_REGS];
    for (index, value) in values.iter() {
        m[*index] = *value;
    }
    m
}

/// Jobs with known solutions from the SC1 datasheet
pub static SC1_SAMPLE_JOBS: Lazy<Vec<Job>> = Lazy::new(|| {
    vec![
        Job {
            expected_solution: Some(0x0000_0000_0B60_9376),
            ..Job::new(
                m_regs(&[
                    (0, 0x1E63000000000000),
                    (1, 0xF78B797E5D753F6F),
                    (2, 0xE0E21B09975ADACE),
                    (3, 0x923C26B1B437E95D),
                    (5, 0x0000000056307FC8),
                    (6, 0x1023C71D7FB4A5EB),
                    (7, 0x459779BFC18FFED4),
                    (8, 0x10EEA15DE88CAF87),
                    (9, 0xCC2F2CEDD68DB7C6),
                ]),
                0x0000_0000_0B60_9366,
                0x0000_0000_0B60_9386,
            )
        },
        Job {
            expected_solution: Some(0x0000_0000_0017_3398),
            ..Job::new(
                m_regs(&[
                    (0, 0x6F34000000000000),
                    (1, 0xC24A197EF68BB88B),
                    (2, 0x5D04905F16B44B06),
                    (3, 0x5FD01A37AB974684),
                    (5, 0x00000000557E177C),
                    (6, 0xA7791B442A204E89),
                    (7, 0x8C7FD7617FB56B67),
                    (8, 0xA80CD66DCA3D6CFB),
                    (9, 0x6B8C74CBBB4D92C8),
                ]),
                0x0000_0000_0017_3300,
                0x0000_0000_0017_3400,
            )
        },
        Job {
            expected_solution: Some(0x0000_0000_02C4_194D),
            ..Job::new(
                m_regs(&[
                    (0, 0x1A87010000000000),
                    (1, 0x29204EF569A84C18),
                    (2, 0x6338BAE980D39C75),
                    (3, 0x3915CD992103A086),
                    (5, 0x00000000557E2629),
                    (6, 0xF33F77F1E2FC8AFB),
                    (7, 0x8A0A35E84301372F),
                    (8, 0xC8DC262408A96147),
                    (9, 0x643F1871F5DD5EC1),
                ]),
                0x0000_0000_02C4_1900,
                0x0000_0000_02C4_1A00,
            )
        },
    ]
});

/// Jobs with known solutions from the DCR1 datasheet
pub static DCR1_SAMPLE_JOBS: Lazy<Vec<Job>> = Lazy::new(|| {
    let tail = [
        0x243F6A88, 0x85A308D3, 0x13198A2E, 0x03707344, 0xA4093D82, 0x299F3470, 0x082EFA98,
        0xEC4E6C89,
    ];
    let v = |head: [u64; 8]| {
        let mut v = [0; NUM_V_REGS];
        v[..8].copy_from_slice(&head);
        v[8..].copy_from_slice(&tail);
        v
    };
    vec![
        Job {
            v: Some(v([
                0x51F87D90, 0x660D07D4, 0xA697C2B7, 0xC52BB4EF, 0xBB2C0B5E, 0x41B8CB4C,
                0x9254A116, 0xE2B2CC34,
            ])),
            match_reg: Some(0xE2B2CC34),
            expected_solution: Some(0x64EE1D76),
            ..Job::new(
                m_regs(&[
                    (0, 0x6A5C0200),
                    (1, 0x39200000),
                    (2, 0x74017B59),
                    (4, 0x00000005),
                    (12, 0x04000000),
                ]),
                0x64EE1000,
                0x64EE1DB0,
            )
        },
        Job {
            v: Some(v([
                0xD496F8A3, 0x36CCF4C9, 0xC264E664, 0x7E3CBC93, 0xD35E50AC, 0x15615B42,
                0x20422DAD, 0xFA547D3B,
            ])),
            match_reg: Some(0xFA547D3B),
            expected_solution: Some(0x6E83D6DA),
            ..Job::new(
                m_regs(&[
                    (0, 0x01000000),
                    (1, 0x71BB0100),
                    (2, 0x27D8B856),
                    (4, 0x382A0936),
                    (5, 0xED7F1777),
                    (6, 0x43000000),
                ]),
                0x6E83D6C0,
                0x6E83D6F0,
            )
        },
    ]
});

pub fn sample_jobs(model: Model) -> &'static [Job] {
    match model {
        Model::Sc1 => &SC1_SAMPLE_JOBS,
        Model::Dcr1 => &DCR1_SAMPLE_JOBS,
    }
}
