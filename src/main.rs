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

use obelisk_asic::logging::macros::*;

use obelisk_asic::calibration::{self, CalibrationOutcome, ProbeResult};
use obelisk_asic::config::{Config, Tuning, TuningStore};
use obelisk_asic::error::{self, ErrorKind};
use obelisk_asic::gpio::ControlPinManager;
use obelisk_asic::ocr::{self, Bias, Divider};
use obelisk_asic::selftest;
use obelisk_asic::sim::SimController;
use obelisk_asic::spi::{self, SpiBackend};
use obelisk_asic::transfer::{Dispatcher, ManualTimer, SystemTimer};
use obelisk_asic::variant::{ChipVariant, Model, MAX_BOARDS};

use clap;

use std::process;

/// Supply level at which simulated chips respond when not told otherwise
const DEFAULT_SIM_THRESHOLD: u8 = 20;

fn parse_value<T: std::str::FromStr>(
    matches: &clap::ArgMatches,
    name: &str,
) -> error::Result<Option<T>> {
    match matches.value_of(name) {
        None => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|_| {
            ErrorKind::InvalidArgument(format!("invalid value '{}' of '--{}'", value, name))
                .into()
        }),
    }
}

/// Print the oscillator control register value for given clock setting
fn handle_ocr(matches: &clap::ArgMatches) -> error::Result<()> {
    let model = parse_value::<Model>(matches, "model")?.unwrap_or(Model::Sc1);
    let divider = Divider::from_value(parse_value(matches, "divider")?.unwrap_or(1))?;
    let bias = Bias::new(parse_value(matches, "bias")?.unwrap_or(0))?;

    let variant = ChipVariant::for_model(model);
    let (low, high) = ocr::build_oscillator_register(&variant, divider, bias);
    println!("{} OCR-A: {:#x}", variant.name, low);
    if let Some(high) = high {
        println!("{} OCR-B: {:#x}", variant.name, high);
    }
    Ok(())
}

/// Print hash boards detected through the presence pins
fn handle_boards() -> error::Result<()> {
    let boards = ControlPinManager::new().detect_boards()?;
    if boards.is_empty() {
        println!("No hash board detected");
    }
    for board in boards {
        println!("Hash board {} is present", board);
    }
    Ok(())
}

fn load_config(matches: &clap::ArgMatches) -> error::Result<Config> {
    match matches.value_of("config") {
        Some(path) => Config::parse(path),
        None => Ok(Config::with_model(
            parse_value(matches, "model")?.unwrap_or(Model::Sc1),
        )),
    }
}

/// Read back the oscillator register of every chip of a powered hash board
fn handle_probe(matches: &clap::ArgMatches) -> error::Result<()> {
    let config = load_config(matches)?;
    let board = parse_value(matches, "board")?.unwrap_or(0);
    let manager = ControlPinManager::new();
    if !manager.detect_boards()?.contains(&board) {
        Err(ErrorKind::NotFound(format!("hash board {} is not present", board)))?
    }

    let variant = config.resolve_variant(board);
    let path = matches
        .value_of("spidev")
        .unwrap_or(spi::DEFAULT_SPIDEV_PATH);
    let backend = SpiBackend::with_control_pins(spi::open_spidev(path)?, &manager)?;
    let mut dispatcher = Dispatcher::new(backend, SystemTimer::new(), variant)
        .with_bus_timeout(config.resolve_bus_timeout());

    let mut passed = 0;
    for chip in 0..variant.chips {
        let result = calibration::probe_chip(&mut dispatcher, board, chip)?;
        if result == ProbeResult::Pass {
            passed += 1;
        }
        println!("Hash board {} chip {}: {:?}", board, chip, result);
    }
    println!(
        "{} of {} {} chips answered",
        passed, variant.chips, variant.name
    );
    Ok(())
}

/// Calibrate simulated strings and run the sample job sweep over them
fn handle_selftest(matches: &clap::ArgMatches) -> error::Result<()> {
    let config = load_config(matches)?;
    let threshold = parse_value(matches, "threshold")?.unwrap_or(DEFAULT_SIM_THRESHOLD);
    let boards = match matches.values_of("boards") {
        Some(values) => values
            .map(|value| {
                value.parse::<usize>().map_err(|_| {
                    error::Error::from(ErrorKind::InvalidArgument(format!(
                        "invalid board index '{}'",
                        value
                    )))
                })
            })
            .collect::<error::Result<Vec<_>>>()?,
        None => config.board_indices(),
    };
    if let Some(board) = boards.iter().find(|board| **board >= MAX_BOARDS) {
        Err(ErrorKind::InvalidArgument(format!(
            "board index '{}' is out of range '0..{}'",
            board, MAX_BOARDS
        )))?
    }
    let first = *boards.first().ok_or_else(|| {
        error::Error::from(ErrorKind::InvalidArgument("no board to test".to_string()))
    })?;

    // one dispatcher drives strings of a single variant
    let variant = config.resolve_variant(first);
    if let Some(board) = boards
        .iter()
        .find(|board| config.resolve_variant(**board) != variant)
    {
        Err(ErrorKind::Config(format!(
            "board {} has a different chip variant than board {}",
            board, first
        )))?
    }

    let mut controller = SimController::new(variant);
    for board in &boards {
        controller = controller.with_uniform_board(*board, threshold);
    }
    let (bus, mut hashboard) = controller.split();
    let mut dispatcher = Dispatcher::new(bus, ManualTimer::new(), variant)
        .with_bus_timeout(config.resolve_bus_timeout());

    let store = matches.value_of("tuning").map(TuningStore::new);
    let mut tuning = match &store {
        Some(store) => store.load()?.unwrap_or_default(),
        None => Tuning::default(),
    };

    let mut ready = Vec::new();
    for board in boards {
        let (report, state) = calibration::calibrate_string(
            &mut dispatcher,
            &mut hashboard,
            board,
            config.resolve_calibration(),
        )?;
        match report.outcome {
            CalibrationOutcome::Ready => ready.push(board),
            CalibrationOutcome::Partial => warn!(
                "Hash board {}: chips {:?} did not come up, skipping",
                board, report.failed_chips
            ),
            CalibrationOutcome::Dead => error!("Hash board {}: no chip came up", board),
        }
        tuning.update(&state);
    }
    if let Some(store) = &store {
        store.save(&tuning)?;
    }
    if ready.is_empty() {
        Err(ErrorKind::Failure("no hash board is ready".to_string()))?
    }

    let report = selftest::run_selftest(
        &mut dispatcher,
        &mut hashboard,
        ready,
        config.resolve_job(&variant),
    )?;
    println!(
        "Self test passed: {} solutions, {} restarts",
        report.solutions, report.restarts
    );
    Ok(())
}

fn main() {
    let app = clap::App::new("obelisk-asic")
        .version(clap::crate_version!())
        .about("Obelisk SC1/DCR1 hashing chip driver tools")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            clap::SubCommand::with_name("ocr")
                .about("Compute oscillator control register value")
                .arg(
                    clap::Arg::with_name("model")
                        .long("model")
                        .help("Chip model (sc1 or dcr1)")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("divider")
                        .long("divider")
                        .help("Clock divider (1, 2, 4 or 8)")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("bias")
                        .long("bias")
                        .help("Oscillator bias (-5 to 5)")
                        .allow_hyphen_values(true)
                        .takes_value(true),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("boards").about("List hash boards present on the controller"),
        )
        .subcommand(
            clap::SubCommand::with_name("probe")
                .about("Read back the oscillator register of every chip of a powered hash board")
                .arg(
                    clap::Arg::with_name("config")
                        .long("config")
                        .value_name("PATH")
                        .help("Set config file path")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("model")
                        .long("model")
                        .help("Chip model (sc1 or dcr1)")
                        .conflicts_with("config")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("board")
                        .long("board")
                        .help("Hash board index")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("spidev")
                        .long("spidev")
                        .value_name("PATH")
                        .help("SPI device of the controller")
                        .takes_value(true),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("selftest")
                .about("Calibrate simulated strings and solve the sample jobs on every chip")
                .arg(
                    clap::Arg::with_name("config")
                        .long("config")
                        .value_name("PATH")
                        .help("Set config file path")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("model")
                        .long("model")
                        .help("Chip model (sc1 or dcr1) of all strings")
                        .conflicts_with("config")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("boards")
                        .long("boards")
                        .help("Comma separated hash board indices")
                        .use_delimiter(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("threshold")
                        .long("threshold")
                        .help("Supply level at which simulated chips start responding")
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::with_name("tuning")
                        .long("tuning")
                        .help("Store calibration result to this file")
                        .takes_value(true),
                ),
        );

    let matches = app.get_matches();
    let result = match matches.subcommand() {
        ("ocr", Some(matches)) => handle_ocr(matches),
        ("boards", _) => handle_boards(),
        ("probe", Some(matches)) => handle_probe(matches),
        ("selftest", Some(matches)) => handle_selftest(matches),
        _ => Ok(()),
    };
    if let Err(e) = result {
        error!("{}", e);
        // let the asynchronous drain flush
        std::thread::sleep(std::time::Duration::from_millis(100));
        process::exit(1);
    }
}
