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

//! Oscillator control register: clock divider, VCO bias and core clock enables

use crate::logging::macros::*;

use crate::error::{self, ErrorKind};
use crate::transfer::{Backend, Dispatcher, Target, Timer};
use crate::variant::{ChipVariant, OscillatorLayout};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use std::convert::TryFrom;
use std::fmt;

/// Core clock divider of the oscillator output
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Divider {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl Divider {
    pub fn from_value(value: usize) -> error::Result<Self> {
        match value {
            1 => Ok(Divider::One),
            2 => Ok(Divider::Two),
            4 => Ok(Divider::Four),
            8 => Ok(Divider::Eight),
            _ => Err(ErrorKind::InvalidArgument(format!(
                "clock divider {} is not one of 1, 2, 4, 8",
                value
            )))?,
        }
    }

    pub fn value(&self) -> usize {
        *self as usize
    }

    fn bits(&self, osc: &OscillatorLayout) -> u64 {
        match self {
            Divider::One => osc.div1,
            Divider::Two => osc.div2,
            Divider::Four => osc.div4,
            Divider::Eight => osc.div8,
        }
    }

    /// Twice the core clock
    fn faster(&self) -> Option<Self> {
        match self {
            Divider::One => None,
            Divider::Two => Some(Divider::One),
            Divider::Four => Some(Divider::Two),
            Divider::Eight => Some(Divider::Four),
        }
    }

    /// Half the core clock
    fn slower(&self) -> Option<Self> {
        match self {
            Divider::One => Some(Divider::Two),
            Divider::Two => Some(Divider::Four),
            Divider::Four => Some(Divider::Eight),
            Divider::Eight => None,
        }
    }
}

/// Signed VCO bias step, negative values slow the oscillator down
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "i8", into = "i8")]
pub struct Bias(i8);

impl Bias {
    pub const MIN: Self = Self(-5);
    pub const MAX: Self = Self(5);
    pub const NEUTRAL: Self = Self(0);

    pub fn new(bias: i8) -> error::Result<Self> {
        if bias < Self::MIN.0 || bias > Self::MAX.0 {
            Err(ErrorKind::InvalidArgument(format!(
                "bias {} out of range {}..={}",
                bias,
                Self::MIN.0,
                Self::MAX.0
            )))?
        }
        Ok(Self(bias))
    }

    pub fn value(&self) -> i8 {
        self.0
    }

    /// Thermometer coded run of |bias| bits at the slow or fast position
    fn bits(&self, osc: &OscillatorLayout) -> u64 {
        let run = (1u64 << self.0.abs()) - 1;
        if self.0 < 0 {
            run << osc.bias_slow_pos
        } else {
            run << osc.bias_fast_pos
        }
    }
}

impl TryFrom<i8> for Bias {
    type Error = String;

    fn try_from(bias: i8) -> Result<Self, Self::Error> {
        Self::new(bias).map_err(|e| e.to_string())
    }
}

impl From<Bias> for i8 {
    fn from(bias: Bias) -> i8 {
        bias.0
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

/// Map clock divider and bias to the oscillator control bit pattern (without core enables)
pub fn build(osc: &OscillatorLayout, divider: Divider, bias: Bias) -> u64 {
    divider.bits(osc) | bias.bits(osc)
}

/// Oscillator control register value of `variant` split into OCR-A and optional OCR-B
pub fn build_oscillator_register(
    variant: &ChipVariant,
    divider: Divider,
    bias: Bias,
) -> (u64, Option<u64>) {
    variant.osc.split(build(&variant.osc, divider, bias))
}

/// Per-chip clock setting that is kept across restarts
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChipTuning {
    pub divider: Divider,
    pub bias: Bias,
}

impl Default for ChipTuning {
    fn default() -> Self {
        Self {
            divider: Divider::Eight,
            bias: Bias::NEUTRAL,
        }
    }
}

impl ChipTuning {
    pub fn new(divider: Divider, bias: Bias) -> Self {
        Self { divider, bias }
    }

    /// Slowest possible clock
    pub fn is_slowest(&self) -> bool {
        self.divider == Divider::Eight && self.bias == Bias::MIN
    }

    /// One step faster, past the fastest bias the divider halves and bias restarts at
    /// the slowest setting. Returns `false` when there is nowhere to go.
    pub fn increase(&mut self) -> bool {
        if self.bias < Bias::MAX {
            self.bias = Bias(self.bias.0 + 1);
            true
        } else if let Some(divider) = self.divider.faster() {
            self.divider = divider;
            self.bias = Bias::MIN;
            true
        } else {
            false
        }
    }

    /// One step slower, inverse of [`increase`](Self::increase)
    pub fn decrease(&mut self) -> bool {
        if self.bias > Bias::MIN {
            self.bias = Bias(self.bias.0 - 1);
            true
        } else if let Some(divider) = self.divider.slower() {
            self.divider = divider;
            self.bias = Bias::MAX;
            true
        } else {
            false
        }
    }
}

/// Slow the whole string down in lock step until the slowest chip reaches the slowest
/// setting, preserving relative differences between chips
pub fn normalize(chips: &mut [ChipTuning]) {
    while !chips.is_empty() && !chips.iter().any(ChipTuning::is_slowest) {
        let mut changed = false;
        for chip in chips.iter_mut() {
            changed |= chip.decrease();
        }
        if !changed {
            break;
        }
    }
}

/// Remembers what was last written to the oscillator register of every chip of a string
pub struct OcrCache {
    board: usize,
    variant: ChipVariant,
    last: Vec<u64>,
}

impl OcrCache {
    pub fn new(board: usize, variant: ChipVariant) -> Self {
        Self {
            board,
            variant,
            last: vec![variant.osc.init; variant.chips],
        }
    }

    pub fn last(&self, chip: usize) -> u64 {
        self.last[chip]
    }

    fn check_chip(&self, chip: usize) -> error::Result<()> {
        if chip >= self.last.len() {
            Err(ErrorKind::NotFound(format!(
                "chip {} out of range 0..{}",
                chip,
                self.last.len()
            )))?
        }
        Ok(())
    }

    /// Replace divider and bias of one chip keeping the rest of the register, clocks of all
    /// cores end up enabled
    pub fn set_divider_and_bias<B: Backend, T: Timer>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        chip: usize,
        tuning: ChipTuning,
    ) -> error::Result<()> {
        self.check_chip(chip)?;
        let osc = &self.variant.osc;
        let value = (self.last[chip] & !(osc.div_mask | osc.bias_mask))
            | build(osc, tuning.divider, tuning.bias)
            | osc.core_enable;
        self.write(dispatcher, chip, value)?;
        debug!(
            "Hashboard {} chip {}: divider {} bias {}",
            self.board,
            chip,
            tuning.divider.value(),
            tuning.bias
        );
        Ok(())
    }

    /// Gate clocks of every core of one chip
    pub fn stop_chip<B: Backend, T: Timer>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        chip: usize,
    ) -> error::Result<()> {
        self.check_chip(chip)?;
        let value = self.last[chip] & !self.variant.osc.core_enable;
        self.write(dispatcher, chip, value)
    }

    fn write<B: Backend, T: Timer>(
        &mut self,
        dispatcher: &mut Dispatcher<B, T>,
        chip: usize,
        value: u64,
    ) -> error::Result<()> {
        let (low, high) = self.variant.osc.split(value);
        dispatcher.write(self.board, Target::Chip(chip), self.variant.regs.ocr, low)?;
        if let (Some(register), Some(high)) = (self.variant.regs.ocr_high, high) {
            dispatcher.write(self.board, Target::Chip(chip), register, high)?;
        }
        self.last[chip] = value;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transfer::test_utils::{Event, FakeBackend};
    use crate::transfer::ManualTimer;
    use crate::variant::{DCR1, SC1};

    #[test]
    fn test_divider_bits_are_exclusive() {
        let osc = &SC1.osc;
        for divider in [Divider::One, Divider::Two, Divider::Four, Divider::Eight].iter() {
            let bits = build(osc, *divider, Bias::NEUTRAL);
            assert_eq!((bits & osc.div_mask).count_ones(), 1, "{:?}", divider);
            assert_eq!(bits & !osc.div_mask, 0);
        }
        assert_eq!(build(osc, Divider::Eight, Bias::NEUTRAL), 0x08);
        assert_eq!(build(osc, Divider::One, Bias::NEUTRAL), 0x40);
    }

    #[test]
    fn test_bias_thermometer_code() {
        let osc = &DCR1.osc;
        for b in -5..=5i8 {
            let bits = build(osc, Divider::Four, Bias::new(b).unwrap()) & !osc.div_mask;
            assert_eq!(bits.count_ones(), b.abs() as u32, "bias {}", b);
            assert_eq!(bits & !osc.bias_mask, 0, "bias {} leaks out of the field", b);
            if b < 0 {
                assert_eq!(bits.trailing_zeros(), osc.bias_slow_pos);
            } else if b > 0 {
                assert_eq!(bits.trailing_zeros(), osc.bias_fast_pos);
            }
        }
        assert_eq!(build(osc, Divider::Eight, Bias::MIN), 0x0f80_0008);
    }

    #[test]
    fn test_fast_bias_spills_into_ocrb() {
        let (low, high) = build_oscillator_register(&DCR1, Divider::Two, Bias::MAX);
        assert_eq!(low, 0xf000_0020);
        assert_eq!(high, Some(0x1));
        let (low, high) = build_oscillator_register(&SC1, Divider::Two, Bias::MAX);
        assert_eq!(low, 0x1_f000_0020);
        assert_eq!(high, None);
    }

    #[test]
    fn test_builder_is_deterministic() {
        let a = build_oscillator_register(&DCR1, Divider::One, Bias::new(-3).unwrap());
        let b = build_oscillator_register(&DCR1, Divider::One, Bias::new(-3).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_bias_range() {
        assert!(Bias::new(-6).is_err());
        assert!(Bias::new(6).is_err());
        assert!(Divider::from_value(3).is_err());
        assert_eq!(Divider::from_value(4).unwrap(), Divider::Four);
    }

    #[test]
    fn test_increase_wraps_into_divider() {
        let mut tuning = ChipTuning::new(Divider::Eight, Bias::MAX);
        assert!(tuning.increase());
        assert_eq!(tuning, ChipTuning::new(Divider::Four, Bias::MIN));

        let mut fastest = ChipTuning::new(Divider::One, Bias::MAX);
        assert!(!fastest.increase());
        assert_eq!(fastest, ChipTuning::new(Divider::One, Bias::MAX));
    }

    #[test]
    fn test_decrease_wraps_into_divider() {
        let mut tuning = ChipTuning::new(Divider::Two, Bias::MIN);
        assert!(tuning.decrease());
        assert_eq!(tuning, ChipTuning::new(Divider::Four, Bias::MAX));

        let mut slowest = ChipTuning::new(Divider::Eight, Bias::MIN);
        assert!(!slowest.decrease());
    }

    #[test]
    fn test_normalize() {
        let mut chips = vec![
            ChipTuning::new(Divider::Four, Bias::new(2).unwrap()),
            ChipTuning::new(Divider::Eight, Bias::new(-3).unwrap()),
        ];
        normalize(&mut chips);
        assert_eq!(chips[1], ChipTuning::new(Divider::Eight, Bias::MIN));
        assert_eq!(chips[0], ChipTuning::new(Divider::Four, Bias::NEUTRAL));

        let mut empty: Vec<ChipTuning> = vec![];
        normalize(&mut empty);
    }

    #[test]
    fn test_set_divider_and_bias_writes_both_halves() {
        let mut dispatcher = Dispatcher::new(FakeBackend::new(), ManualTimer::new(), DCR1);
        let mut cache = OcrCache::new(1, DCR1);
        cache
            .set_divider_and_bias(
                &mut dispatcher,
                4,
                ChipTuning::new(Divider::Two, Bias::MAX),
            )
            .expect("cannot set divider and bias");
        assert_eq!(cache.last(4), 0x1_f07f_ffa0);

        let writes: Vec<_> = dispatcher
            .backend()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][2], 0x2f, "OCR-A goes first");
        assert_eq!(&writes[0][3..], &[0xf0, 0x7f, 0xff, 0xa0]);
        assert_eq!(writes[1][2], 0x2e);
        assert_eq!(&writes[1][3..], &[0, 0, 0, 1]);

        cache.stop_chip(&mut dispatcher, 4).unwrap();
        assert_eq!(cache.last(4) & DCR1.osc.core_enable, 0);
        assert!(cache.stop_chip(&mut dispatcher, 15).is_err());
    }
}
