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

//! Drive simulated strings through calibration and jobs the same way the hardware is driven

use obelisk_asic::calibration::{
    self, CalibrationOutcome, CalibrationSettings, CoreClockPolicy,
};
use obelisk_asic::config::Config;
use obelisk_asic::error::ErrorKind;
use obelisk_asic::hashboard::{EpotLevel, Hashboard};
use obelisk_asic::job::{self, Job};
use obelisk_asic::lifecycle::{JobCycle, JobSettings, JobState};
use obelisk_asic::selftest;
use obelisk_asic::sim::{SimBoards, SimBus, SimController, NEVER};
use obelisk_asic::transfer::{Dispatcher, ManualTimer, Target};
use obelisk_asic::variant::{ChipVariant, Model, DCR1, SC1};

type SimDispatcher = Dispatcher<SimBus, ManualTimer>;

fn setup(controller: SimController, variant: ChipVariant) -> (SimDispatcher, SimBoards) {
    let (bus, boards) = controller.split();
    (Dispatcher::new(bus, ManualTimer::new(), variant), boards)
}

fn calibrated(variant: ChipVariant, boards: &[usize]) -> (SimDispatcher, SimBoards) {
    let mut controller = SimController::new(variant);
    for board in boards {
        controller = controller.with_uniform_board(*board, 20);
    }
    let (mut dispatcher, mut hashboard) = setup(controller, variant);
    for board in boards {
        let (report, _) = calibration::calibrate_string(
            &mut dispatcher,
            &mut hashboard,
            *board,
            CalibrationSettings::default(),
        )
        .expect("calibration failed");
        assert_eq!(report.outcome, CalibrationOutcome::Ready);
    }
    (dispatcher, hashboard)
}

fn solve(
    dispatcher: &mut SimDispatcher,
    hashboard: &mut SimBoards,
    chip: usize,
    job: &Job,
) -> Option<u64> {
    let core = dispatcher.variant().last_core();
    let mut cycle = JobCycle::new(0, chip, core, JobSettings::default());
    cycle
        .preload(dispatcher, job, Target::Core { chip, core })
        .expect("preload failed");
    cycle.start(dispatcher, hashboard).expect("start failed");
    let solution = cycle
        .wait_and_read_solution(dispatcher, hashboard)
        .expect("no solution read");
    assert_eq!(*cycle.state(), JobState::Idle);
    solution
}

#[test]
fn test_sc1_sample_job_on_last_core() {
    let (mut dispatcher, mut hashboard) = calibrated(SC1, &[0]);
    let job = &job::sample_jobs(Model::Sc1)[0];

    let solution = solve(&mut dispatcher, &mut hashboard, 3, job);
    assert_eq!(solution, Some(0x0B60_9376));
    assert_eq!(hashboard.read_done_lines(0).unwrap(), 0);
    assert_eq!(hashboard.read_nonce_lines(0).unwrap(), 0);
}

#[test]
fn test_dcr1_sample_job_on_last_core() {
    let (mut dispatcher, mut hashboard) = calibrated(DCR1, &[0]);
    let job = &job::sample_jobs(Model::Dcr1)[0];

    let solution = solve(&mut dispatcher, &mut hashboard, DCR1.chips - 1, job);
    assert_eq!(solution, Some(0x64EE_1D76));
    assert_eq!(hashboard.read_done_lines(0).unwrap(), 0);
    assert_eq!(hashboard.read_nonce_lines(0).unwrap(), 0);
}

#[test]
fn test_rev_a_dcr1_sample_job() {
    let variant = DCR1.with_read_erratum(1);
    let (mut dispatcher, mut hashboard) = calibrated(variant, &[0]);
    let job = &job::sample_jobs(Model::Dcr1)[0];

    let solution = solve(&mut dispatcher, &mut hashboard, 3, job);
    assert_eq!(solution, Some(0x64EE_1D76));
    assert_eq!(hashboard.read_done_lines(0).unwrap(), 0);
    assert_eq!(hashboard.read_nonce_lines(0).unwrap(), 0);
}

#[test]
fn test_rev_a_sc1_sample_job() {
    let variant = SC1.with_read_erratum(1);
    let (mut dispatcher, mut hashboard) = calibrated(variant, &[0]);
    let job = &job::sample_jobs(Model::Sc1)[0];

    assert_eq!(
        solve(&mut dispatcher, &mut hashboard, 0, job),
        Some(0x0B60_9376)
    );
}

#[test]
fn test_range_without_solution_finishes_empty() {
    let (mut dispatcher, mut hashboard) = calibrated(SC1, &[0]);
    let mut job = job::sample_jobs(Model::Sc1)[0].clone();
    let solution = job.expected_solution.unwrap();
    job.lower_bound = solution + 1;
    job.upper_bound = solution + 0x100;

    assert_eq!(solve(&mut dispatcher, &mut hashboard, 0, &job), None);
}

#[test]
fn test_unclocked_core_times_out_back_to_idle() {
    let (mut dispatcher, mut hashboard) = calibrated(SC1, &[0]);
    let job = &job::sample_jobs(Model::Sc1)[0];
    // only the last core gets a clock during initialization
    let mut cycle = JobCycle::new(0, 1, 0, JobSettings::default());
    cycle
        .preload(&mut dispatcher, job, Target::Chip(1))
        .expect("preload failed");

    let error = cycle
        .start(&mut dispatcher, &mut hashboard)
        .expect_err("start of an unclocked core must time out");
    match error.kind() {
        ErrorKind::Timeout(_) => (),
        kind => panic!("unexpected error {:?}", kind),
    }
    assert_eq!(*cycle.state(), JobState::Idle);
}

#[test]
fn test_out_of_order_operations_are_rejected() {
    let (mut dispatcher, mut hashboard) = calibrated(SC1, &[0]);
    let mut cycle = JobCycle::new(0, 0, SC1.last_core(), JobSettings::default());
    assert!(cycle.start(&mut dispatcher, &mut hashboard).is_err());
    assert!(cycle.poll(&mut dispatcher, &mut hashboard).is_err());
    assert!(cycle.retarget(2, 0).is_ok());
    assert_eq!(cycle.chip(), 2);
}

#[test]
fn test_ramp_stops_at_highest_threshold_and_boosts() {
    let mut thresholds = vec![35; SC1.chips];
    thresholds[4] = 31;
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(SC1).with_board(1, &thresholds), SC1);
    let settings = CalibrationSettings {
        startup_level: EpotLevel::new(40).unwrap(),
        floor: EpotLevel::new(12).unwrap(),
        ..Default::default()
    };

    let (report, state) =
        calibration::calibrate_string(&mut dispatcher, &mut hashboard, 1, settings).unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Ready);
    assert_eq!(report.level, EpotLevel::new(21).unwrap());
    assert_eq!(hashboard.level(1), EpotLevel::new(21).unwrap());
    assert_eq!(state.awake, SC1.chips);
    assert!(report.failed_chips.is_empty());
    assert!(hashboard.supply_enabled(1));
    assert!(hashboard.hash_clock(1));
}

#[test]
fn test_boost_is_clamped_to_floor() {
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(SC1).with_uniform_board(0, 20), SC1);
    let (report, _) = calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        0,
        CalibrationSettings::default(),
    )
    .unwrap();
    assert_eq!(report.level, calibration::DEFAULT_FLOOR_LEVEL);
}

#[test]
fn test_silent_chip_gives_partial_string_with_supply_on() {
    let mut thresholds = vec![25; DCR1.chips];
    thresholds[5] = NEVER;
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(DCR1).with_board(2, &thresholds), DCR1);

    let (report, state) = calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        2,
        CalibrationSettings::default(),
    )
    .unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Partial);
    assert_eq!(report.failed_chips, vec![5]);
    assert_eq!(report.level, calibration::DEFAULT_FLOOR_LEVEL);
    assert_eq!(state.awake, DCR1.chips - 1);
    assert!(hashboard.supply_enabled(2));
}

#[test]
fn test_dead_string_turns_supply_off() {
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(SC1).with_uniform_board(0, NEVER), SC1);

    let (report, state) = calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        0,
        CalibrationSettings::default(),
    )
    .unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Dead);
    assert_eq!(report.failed_chips.len(), SC1.chips);
    assert_eq!(state.awake, 0);
    assert!(!hashboard.supply_enabled(0));
}

#[test]
fn test_missing_board_is_not_found() {
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(SC1).with_uniform_board(0, 20), SC1);
    let error = calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        1,
        CalibrationSettings::default(),
    )
    .expect_err("board 1 is not plugged in");
    assert!(match error.kind() {
        ErrorKind::NotFound(_) => true,
        _ => false,
    });
}

#[test]
fn test_voltage_fault_aborts_calibration() {
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(SC1).with_uniform_board(0, 20), SC1);
    hashboard.set_voltage_fault(0, true);
    assert!(calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        0,
        CalibrationSettings::default(),
    )
    .is_err());
}

#[test]
fn test_near_miss_is_retried() {
    let controller = SimController::new(SC1)
        .with_uniform_board(0, 20)
        .with_flaky_chip(0, 2, 1);
    let (mut dispatcher, mut hashboard) = setup(controller, SC1);

    let (report, _) = calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        0,
        CalibrationSettings::default(),
    )
    .unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Ready);
}

#[test]
fn test_m_register_check_on_healthy_string() {
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(SC1).with_uniform_board(0, 20), SC1);
    let settings = CalibrationSettings {
        m_register_check: true,
        ..Default::default()
    };
    let (report, _) =
        calibration::calibrate_string(&mut dispatcher, &mut hashboard, 0, settings).unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Ready);
}

#[test]
fn test_initialization_is_idempotent() {
    let (mut dispatcher, mut hashboard) = calibrated(DCR1, &[0]);
    let before = hashboard.snapshot(0);
    calibration::initialize_device(
        &mut dispatcher,
        &mut hashboard,
        0,
        CoreClockPolicy::LastCoreOnly,
    )
    .unwrap();
    assert_eq!(hashboard.snapshot(0), before);
}

#[test]
fn test_selftest_solves_every_job_on_every_chip() {
    let (mut dispatcher, mut hashboard) = calibrated(SC1, &[0, 2]);
    let report = selftest::run_selftest(
        &mut dispatcher,
        &mut hashboard,
        vec![0, 2],
        JobSettings::default(),
    )
    .unwrap();
    assert_eq!(report.restarts, 0);
    assert_eq!(
        report.solutions,
        job::sample_jobs(Model::Sc1).len() * 2 * SC1.chips
    );
}

#[test]
fn test_configured_string_runs_selftest() {
    let config = Config::parse_str(
        r#"
[format]
version = "1.0"
model = "dcr1"

[calibration]
startup_level = 28
boost = 4

[[board]]
index = 1
"#,
    )
    .unwrap();
    let variant = config.resolve_variant(1);
    let (mut dispatcher, mut hashboard) =
        setup(SimController::new(variant).with_uniform_board(1, 26), variant);

    let (report, _) = calibration::calibrate_string(
        &mut dispatcher,
        &mut hashboard,
        1,
        config.resolve_calibration(),
    )
    .unwrap();
    assert_eq!(report.outcome, CalibrationOutcome::Ready);
    assert_eq!(report.level, EpotLevel::new(22).unwrap());

    let report = selftest::run_selftest(
        &mut dispatcher,
        &mut hashboard,
        config.board_indices(),
        config.resolve_job(&variant),
    )
    .unwrap();
    assert_eq!(report.restarts, 0);
}
