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

//! Driver configuration file and persisted string tuning

use crate::logging::macros::*;

use crate::calibration::{
    self, BoardCalibrationState, CalibrationSettings, CoreClockPolicy,
};
use crate::error::{self, ErrorKind};
use crate::hashboard::EpotLevel;
use crate::lifecycle::{self, JobSettings, ResidualPolicy};
use crate::ocr::ChipTuning;
use crate::transfer;
use crate::variant::{ChipVariant, Model, MAX_BOARDS};

use serde::{Deserialize, Serialize};

use std::fs;
use std::io::{self, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Expected configuration version
const FORMAT_VERSION: &'static str = "1.0";

/// Location of default config
pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/obelisk-asic.toml";

/// Location of persisted voltage and clock tuning
pub const DEFAULT_TUNING_PATH: &'static str = "/etc/obelisk-asic-tuning.toml";

/// Read shift of rev-A silicon
const READ_ERRATUM_SHIFT: u32 = 1;

/// Value from the configuration file or a built-in default
pub enum OptionDefault<T> {
    Some(T),
    Default(T),
}

impl<T> OptionDefault<T> {
    pub fn new(value: Option<T>, default: T) -> Self {
        match value {
            Some(val) => OptionDefault::Some(val),
            None => OptionDefault::Default(default),
        }
    }

    pub fn is_some(&self) -> bool {
        match *self {
            OptionDefault::Some(_) => true,
            OptionDefault::Default(_) => false,
        }
    }
}

impl<T> Deref for OptionDefault<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self {
            OptionDefault::Some(val) => val,
            OptionDefault::Default(val) => val,
        }
    }
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    *OptionDefault::new(value.map(Duration::from_millis), default)
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
struct Format {
    version: String,
    /// Chip model of boards without an explicit model
    model: Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    generator: Option<String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            model: Model::Dcr1,
            generator: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Bus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Calibration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_level: Option<EpotLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floor_level: Option<EpotLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boost: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_retries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m_register_check: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_clock: Option<CoreClockPolicy>,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResidualMode {
    Strict,
    Tolerant,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Job {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_valid_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_valid_poll_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_lines_before_start: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual: Option<ResidualMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_residual: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Board {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    /// Rev-A silicon with shifted register reads
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_erratum: Option<bool>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    format: Format,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<Bus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(rename = "board")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boards: Option<Vec<Board>>,
}

impl Config {
    /// Configuration of a controller with all boards of the same `model`
    pub fn with_model(model: Model) -> Self {
        Self {
            format: Format {
                model,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn model(&self) -> Model {
        self.format.model
    }

    pub fn resolve_bus_timeout(&self) -> Duration {
        millis(
            self.bus.as_ref().and_then(|v| v.busy_timeout_ms),
            transfer::DEFAULT_BUS_TIMEOUT,
        )
    }

    pub fn resolve_calibration(&self) -> CalibrationSettings {
        let section = self.calibration.as_ref();
        CalibrationSettings {
            startup_level: *OptionDefault::new(
                section.and_then(|v| v.startup_level),
                calibration::DEFAULT_STARTUP_LEVEL,
            ),
            floor: *OptionDefault::new(
                section.and_then(|v| v.floor_level),
                calibration::DEFAULT_FLOOR_LEVEL,
            ),
            boost: *OptionDefault::new(section.and_then(|v| v.boost), calibration::DEFAULT_BOOST),
            supply_settle: millis(
                section.and_then(|v| v.settle_ms),
                calibration::DEFAULT_SUPPLY_SETTLE,
            ),
            probe_retries: *OptionDefault::new(
                section.and_then(|v| v.probe_retries),
                calibration::DEFAULT_PROBE_RETRIES,
            ),
            m_register_check: *OptionDefault::new(
                section.and_then(|v| v.m_register_check),
                false,
            ),
            core_clock: *OptionDefault::new(
                section.and_then(|v| v.core_clock),
                CoreClockPolicy::LastCoreOnly,
            ),
        }
    }

    /// Job settings for strings of `variant`
    ///
    /// Residual DONE/NONCE lines are tolerated by default since populated strings always
    /// have busy neighbours.
    pub fn resolve_job(&self, variant: &ChipVariant) -> JobSettings {
        let section = self.job.as_ref();
        let mode = OptionDefault::new(section.and_then(|v| v.residual), ResidualMode::Tolerant);
        let max_residual = OptionDefault::new(
            section.and_then(|v| v.max_residual),
            variant.chips.saturating_sub(1) as u32,
        );
        let residual = match *mode {
            ResidualMode::Strict => {
                // do sanity checks
                if max_residual.is_some() {
                    warn!(
                        "Unused 'max_residual' ({}) because 'strict' residual mode is set",
                        *max_residual
                    );
                }
                ResidualPolicy::Strict
            }
            ResidualMode::Tolerant => ResidualPolicy::Tolerant {
                max_residual: *max_residual,
            },
        };

        JobSettings {
            data_valid_timeout: millis(
                section.and_then(|v| v.data_valid_timeout_ms),
                lifecycle::DEFAULT_DATA_VALID_TIMEOUT,
            ),
            data_valid_poll: millis(
                section.and_then(|v| v.data_valid_poll_ms),
                lifecycle::DEFAULT_DATA_VALID_POLL,
            ),
            completion_timeout: millis(
                section.and_then(|v| v.completion_timeout_ms),
                lifecycle::DEFAULT_COMPLETION_TIMEOUT,
            ),
            check_lines_before_start: *OptionDefault::new(
                section.and_then(|v| v.check_lines_before_start),
                true,
            ),
            residual,
        }
    }

    /// Boards to drive, all of them when the file doesn't list any
    pub fn board_indices(&self) -> Vec<usize> {
        match &self.boards {
            Some(boards) => boards.iter().map(|b| b.index).collect(),
            None => (0..MAX_BOARDS).collect(),
        }
    }

    /// Chip variant of the string on `board`
    pub fn resolve_variant(&self, board: usize) -> ChipVariant {
        let entry = self
            .boards
            .as_ref()
            .and_then(|boards| boards.iter().find(|b| b.index == board));
        let model = OptionDefault::new(entry.and_then(|b| b.model), self.format.model);
        let variant = ChipVariant::for_model(*model);
        if entry.and_then(|b| b.read_erratum).unwrap_or(false) {
            variant.with_read_erratum(READ_ERRATUM_SHIFT)
        } else {
            variant
        }
    }

    fn check(&self) -> error::Result<()> {
        if self.format.version != FORMAT_VERSION {
            Err(ErrorKind::Config(format!(
                "incompatible format version '{}'",
                self.format.version
            )))?
        }

        if let Some(boards) = &self.boards {
            let mut seen = [false; MAX_BOARDS];
            for board in boards {
                if board.index >= MAX_BOARDS {
                    Err(ErrorKind::Config(format!(
                        "board index '{}' is out of range '0..{}'",
                        board.index, MAX_BOARDS
                    )))?
                }
                if seen[board.index] {
                    Err(ErrorKind::Config(format!(
                        "board index '{}' is listed twice",
                        board.index
                    )))?
                }
                seen[board.index] = true;
            }
        }

        let calibration = self.resolve_calibration();
        if calibration.floor > calibration.startup_level {
            Err(ErrorKind::Config(format!(
                "floor level {} is below start up voltage level {}",
                calibration.floor, calibration.startup_level
            )))?
        }
        Ok(())
    }

    pub fn parse_str(content: &str) -> error::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn parse<P: AsRef<Path>>(config_path: P) -> error::Result<Self> {
        let content = fs::read_to_string(config_path.as_ref())?;
        Self::parse_str(&content)
    }
}

/// Last good operating point of one string
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BoardTuning {
    pub board: usize,
    pub model: Model,
    pub level: EpotLevel,
    #[serde(rename = "chip")]
    pub chips: Vec<ChipTuning>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Tuning {
    /// Unix time of the last save
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "board")]
    #[serde(default)]
    pub boards: Vec<BoardTuning>,
}

impl Tuning {
    pub fn board(&self, board: usize) -> Option<&BoardTuning> {
        self.boards.iter().find(|b| b.board == board)
    }

    /// Take over the operating point of a calibrated board, strings that never reached a
    /// supply level are left alone
    pub fn update(&mut self, state: &BoardCalibrationState) {
        let level = match state.level {
            Some(level) => level,
            None => return,
        };
        let tuning = BoardTuning {
            board: state.board,
            model: state.model,
            level,
            chips: state.tuning.clone(),
        };
        match self.boards.iter_mut().find(|b| b.board == state.board) {
            Some(entry) => *entry = tuning,
            None => {
                self.boards.push(tuning);
                self.boards.sort_by_key(|b| b.board);
            }
        }
    }

    /// Restore persisted operating point into a fresh board state
    pub fn apply(&self, state: &mut BoardCalibrationState) -> bool {
        match self.board(state.board) {
            Some(saved) if saved.model == state.model && saved.chips.len() == state.tuning.len() => {
                state.level = Some(saved.level);
                state.tuning.copy_from_slice(&saved.chips);
                true
            }
            Some(saved) => {
                warn!(
                    "Ignoring saved tuning of board {}: {} with {} chips does not match",
                    saved.board,
                    saved.model,
                    saved.chips.len()
                );
                false
            }
            None => false,
        }
    }
}

/// File backed storage of [`Tuning`], replaced atomically on every save
pub struct TuningStore {
    path: PathBuf,
}

impl TuningStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing has been saved yet
    pub fn load(&self) -> error::Result<Option<Tuning>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => Err(e)?,
        };
        let tuning: Tuning = toml::from_str(&content)?;
        if let Some(timestamp) = tuning.timestamp {
            debug!(
                "Loaded tuning of {} boards saved {}",
                tuning.boards.len(),
                chrono::NaiveDateTime::from_timestamp(timestamp, 0)
            );
        }
        Ok(Some(tuning))
    }

    pub fn save(&self, tuning: &Tuning) -> error::Result<()> {
        let mut tuning = tuning.clone();
        tuning.timestamp = Some(chrono::Utc::now().timestamp());
        let content = toml::to_string(&tuning)?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        info!("Tuning saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ocr::{Bias, Divider};
    use crate::variant::{DCR1, SC1};

    #[test]
    fn test_defaults_without_sections() {
        let config = Config::parse_str(
            r#"
[format]
version = "1.0"
model = "sc1"
"#,
        )
        .expect("minimal config must parse");
        assert_eq!(config.model(), Model::Sc1);
        assert_eq!(config.resolve_calibration(), CalibrationSettings::default());
        assert_eq!(config.resolve_bus_timeout(), transfer::DEFAULT_BUS_TIMEOUT);
        assert_eq!(config.board_indices(), vec![0, 1, 2]);

        let job = config.resolve_job(&SC1);
        assert_eq!(job.residual, ResidualPolicy::Tolerant { max_residual: 14 });
        assert_eq!(job.completion_timeout, lifecycle::DEFAULT_COMPLETION_TIMEOUT);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::parse_str(
            r#"
[format]
version = "1.0"
model = "dcr1"

[bus]
busy_timeout_ms = 5

[calibration]
startup_level = 40
floor_level = 20
boost = 4
settle_ms = 50
core_clock = "all"

[job]
residual = "strict"
completion_timeout_ms = 100

[[board]]
index = 1
read_erratum = true

[[board]]
index = 2
model = "sc1"
"#,
        )
        .expect("config must parse");

        assert_eq!(config.resolve_bus_timeout(), Duration::from_millis(5));
        let calibration = config.resolve_calibration();
        assert_eq!(calibration.startup_level.level(), 40);
        assert_eq!(calibration.floor.level(), 20);
        assert_eq!(calibration.boost, 4);
        assert_eq!(calibration.supply_settle, Duration::from_millis(50));
        assert_eq!(calibration.core_clock, CoreClockPolicy::All);

        let job = config.resolve_job(&DCR1);
        assert_eq!(job.residual, ResidualPolicy::Strict);
        assert_eq!(job.completion_timeout, Duration::from_millis(100));

        assert_eq!(config.board_indices(), vec![1, 2]);
        assert_eq!(config.resolve_variant(1), DCR1.with_read_erratum(1));
        assert_eq!(config.resolve_variant(2), SC1);
        assert_eq!(config.resolve_variant(0), DCR1);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let parse = |extra: &str| {
            Config::parse_str(&format!(
                "[format]\nversion = \"1.0\"\nmodel = \"dcr1\"\n{}",
                extra
            ))
        };
        assert!(parse("[calibration]\nstartup_level = 200\n").is_err());
        assert!(parse("[calibration]\nstartup_level = 20\nfloor_level = 25\n").is_err());
        assert!(parse("[[board]]\nindex = 3\n").is_err());
        assert!(parse("[[board]]\nindex = 0\n[[board]]\nindex = 0\n").is_err());
        assert!(parse("[bus]\nunknown = 1\n").is_err());
        match Config::parse_str("[format]\nversion = \"0.1\"\nmodel = \"sc1\"\n")
            .unwrap_err()
            .kind()
        {
            ErrorKind::Config(_) => (),
            k => panic!("unexpected error {:?}", k),
        }
    }

    #[test]
    fn test_tuning_store_round_trip() {
        let dir = tempfile::tempdir().expect("cannot create temporary directory");
        let store = TuningStore::new(dir.path().join("tuning.toml"));
        assert_eq!(store.load().expect("missing file is not an error"), None);

        let mut state = BoardCalibrationState::new(2, true, &DCR1);
        state.level = Some(EpotLevel::new(21).unwrap());
        state.tuning[3] = ChipTuning::new(Divider::Two, Bias::new(-2).unwrap());
        let mut tuning = Tuning::default();
        tuning.update(&state);
        store.save(&tuning).expect("save failed");

        let loaded = store.load().expect("load failed").expect("tuning missing");
        assert!(loaded.timestamp.is_some());
        assert_eq!(loaded.boards, tuning.boards);

        let mut fresh = BoardCalibrationState::new(2, true, &DCR1);
        assert!(loaded.apply(&mut fresh));
        assert_eq!(fresh.level, state.level);
        assert_eq!(fresh.tuning, state.tuning);

        let mut other_model = BoardCalibrationState::new(2, true, &SC1);
        assert!(!loaded.apply(&mut other_model));
    }

    #[test]
    fn test_uncalibrated_board_is_not_saved() {
        let mut tuning = Tuning::default();
        tuning.update(&BoardCalibrationState::new(0, true, &SC1));
        assert!(tuning.boards.is_empty());
    }
}
