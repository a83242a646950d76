use std::{
    sync::Arc,
    time::{Duration, Instant},
    };
use etherdrive::{
    AlState, Cia402State, Config, DriveMaster, Transport,
    BringupError, ConfigurationError, Direction,
    bringup::{Bringup, MappingOutcome},
    cia402,
    config::Timing,
    cyclic::{CycleControl, CyclicExchange},
    image::ProcessLayout,
    mapping::{self, Negotiation},
    register::SharedIoRegister,
    registers::AlStatusCode,
    sdo::{objects, PdoEntry},
    simulation::SimulatedDrive,
    slave::StateController,
    };


fn config() -> Config {
    Config {timing: Timing::immediate(), .. Config::default()}
}

fn preop(drive: &mut SimulatedDrive) {
    drive.init("sim").unwrap();
    drive.discover_slaves().unwrap();
    drive.set_slave_state(1, AlState::PreOperational).unwrap();
}

/// wait for a condition on the cyclic thread's output, with a generous bound
fn until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if condition()  {return true}
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn negotiation_is_idempotent() {
    let _ = env_logger::try_init();
    let timing = Timing::immediate();
    let mut drive = SimulatedDrive::new(1);
    preop(&mut drive);
    drive.set_mapping(1, objects::RX_PDO.index, &[PdoEntry(0x6040_0010), PdoEntry(0x6071_0010)]);

    let target = objects::rx_mapping();
    let first = mapping::negotiate(&mut drive, 1, objects::RX_PDO, &target, None, &timing);
    assert!(matches!(first, Ok(Negotiation::Applied)));

    drive.clear_logs();
    let second = mapping::negotiate(&mut drive, 1, objects::RX_PDO, &target, None, &timing);
    assert!(matches!(second, Ok(Negotiation::Unchanged)));
    assert!(drive.sdo_writes().is_empty());
}

#[test]
fn single_mismatch_rewrites_whole_mapping() {
    let _ = env_logger::try_init();
    let timing = Timing::immediate();
    let mut drive = SimulatedDrive::new(1);
    preop(&mut drive);
    let target = objects::tx_mapping();
    let mut current = target.clone();
    current[2] = PdoEntry(0x606c_0020);
    drive.set_mapping(1, objects::TX_PDO.index, &current);
    drive.clear_logs();

    let result = mapping::negotiate(&mut drive, 1, objects::TX_PDO, &target, None, &timing);
    assert!(matches!(result, Ok(Negotiation::Applied)));

    let writes: Vec<(u16, u8)> = drive.sdo_writes().iter().map(|w| (w.index, w.sub)).collect();
    assert_eq!(writes, [
        (0x1c13, 0),
        (0x1a00, 0),
        (0x1a00, 1), (0x1a00, 2), (0x1a00, 3), (0x1a00, 4),
        (0x1a00, 0),
        (0x1c13, 0),
        ]);
    assert_eq!(drive.mapping(1, objects::TX_PDO.index), target.to_vec());
}

#[test]
fn escalation_through_safeop_happens_once() {
    let _ = env_logger::try_init();
    let timing = Timing {state_attempts: 3, .. Timing::immediate()};
    let mut drive = SimulatedDrive::new(1);
    preop(&mut drive);
    drive.map_process_image().unwrap();
    drive.stuck_in_preop(1, u32::MAX);
    drive.refuse_state(1, AlState::SafeOperational, AlStatusCode(0x0017));
    drive.clear_logs();

    let error = StateController::new(&timing).set_state(&mut drive, 1, AlState::Operational).unwrap_err();
    assert_eq!(error.observed, Some(AlState::PreOperational));
    let requests = drive.state_requests();
    assert_eq!(requests.iter().filter(|(_, state)| *state == AlState::SafeOperational).count(), 1);
    assert_eq!(requests.iter().filter(|(_, state)| *state == AlState::Operational).count(), 3);
    assert_eq!(requests[.. 2], [(1, AlState::Operational), (1, AlState::SafeOperational)]);
}

#[test]
fn canonical_sequence_enables_within_bound() {
    let mut state = Cia402State::NotReady;
    let mut commands = Vec::new();
    // states a compliant drive goes through
    for next in [Cia402State::SwitchOnDisabled, Cia402State::ReadyToSwitchOn, Cia402State::SwitchedOn, Cia402State::OperationEnabled] {
        if let Some(command) = cia402::next_command(state) {
            commands.push(command);
        }
        state = next;
    }
    assert_eq!(cia402::next_command(state), None);
    // the first command only leaves NotReady, the 3 others are the enabling sequence
    assert_eq!(commands.len(), 4);
    assert_eq!(commands[1 ..].iter().map(|c| c.bits()).collect::<Vec<_>>(), [0x06, 0x07, 0x0f]);
}

#[test]
fn torque_interlock_and_working_counter() {
    let _ = env_logger::try_init();
    let config = config();
    let layout = ProcessLayout::default();
    let mut drive = SimulatedDrive::new(1).frozen(1);
    preop(&mut drive);
    let image = drive.map_process_image().unwrap();
    drive.set_slave_state(1, AlState::SafeOperational).unwrap();
    drive.set_slave_state(1, AlState::Operational).unwrap();
    let probe = drive.probe();

    let (control, cyclic) = SharedIoRegister::new().split();
    let signals = Arc::new(CycleControl::new());
    signals.set_ready();
    let timing = Timing {enable_attempts: 3, .. config.timing.clone()};
    let config = Config {timing, .. config};
    let mut exchange = CyclicExchange::new(drive, &config, layout, image.expected_wkc(), cyclic, signals);
    assert!(exchange.wait_for_master());

    // frozen drive never leaves NotReady, so the torque must stay null whatever the setpoint
    control.set_target_torque(0.8);
    for _ in 0 .. 5 {
        assert!(exchange.step());
        assert_eq!(layout.target_torque.get(exchange.transport().outputs(1)).unwrap(), 0);
    }
    assert!(! control.telemetry().enabled);
    assert_eq!(control.telemetry().cia402_state, Cia402State::NotReady);

    exchange.transport().degrade_wkc(1);
    assert!(! exchange.step());
    assert!(! control.telemetry().communication_ok);
    assert!(exchange.step());
    assert!(control.telemetry().communication_ok);
    assert_eq!(control.telemetry().degraded_cycles, 1);
    assert!(probe.controlwords(1).iter().all(|&controlword| controlword != 0x000f));
}

#[test]
fn full_bringup_torque_and_shutdown() {
    let _ = env_logger::try_init();
    let drive = SimulatedDrive::new(1);
    let probe = drive.probe();
    let master = DriveMaster::bring_up(drive, "sim0", config()).unwrap();

    let report = master.report();
    assert_eq!(report.slaves, 1);
    assert!(report.parameter_failures.is_empty());
    assert_eq!(report.mode_display, Some(4));
    assert!(matches!(report.rx, MappingOutcome::Negotiated(Negotiation::Unchanged)));
    assert!(matches!(report.tx, MappingOutcome::Negotiated(Negotiation::Unchanged)));
    assert_eq!(report.expected_wkc, 3);
    assert_eq!(probe.al_state(1), AlState::Operational);

    assert!(until(|| master.telemetry().enabled));
    assert_eq!(master.telemetry().cia402_state, Cia402State::OperationEnabled);

    master.set_target_torque(0.25);
    assert!(until(|| probe.applied_torque(1) == 250));
    assert!(until(|| master.telemetry().torque == 250));
    // saturated to the torque field range
    master.set_target_torque(1e6);
    assert!(until(|| probe.applied_torque(1) == i16::MAX));

    let telemetry = master.telemetry();
    assert!(telemetry.communication_ok);
    assert!(telemetry.slave_operational);
    assert!(telemetry.cycles > 0);

    master.shutdown().unwrap();
    assert_eq!(probe.al_state(1), AlState::Init);
    assert!(probe.closed());
    assert_eq!(probe.controlwords(1).last(), Some(&0x0006));
    assert_eq!(probe.applied_torque(1), 0);
}

#[test]
fn negotiation_applies_custom_mapping() {
    let _ = env_logger::try_init();
    let mut drive = SimulatedDrive::new(1);
    drive.set_mapping(1, objects::RX_PDO.index, &[PdoEntry(0x6040_0010)]);
    let probe = drive.probe();
    let master = DriveMaster::bring_up(drive, "sim0", config()).unwrap();
    assert!(matches!(master.report().rx, MappingOutcome::Negotiated(Negotiation::Applied)));
    assert_eq!(master.report().image.slave(1).map(|image| image.output_bytes), Some(9));
    assert!(until(|| master.telemetry().enabled));
    master.shutdown().unwrap();
    assert!(probe.closed());
}

#[test]
fn undersized_image_aborts() {
    let _ = env_logger::try_init();
    let drive = SimulatedDrive::new(1).with_image(1, 9, 1);
    let probe = drive.probe();
    let error = DriveMaster::bring_up(drive, "sim0", config()).err().unwrap();
    assert!(matches!(error, BringupError::Configuration(ConfigurationError::UndersizedImage {
        slave: 1,
        direction: Direction::Input,
        required: 2,
        available: 1,
        })));
    assert!(probe.closed());
    assert_eq!(probe.al_state(1), AlState::Init);
    assert_eq!(probe.exchanges(), 0);
}

#[test]
fn minimal_mapping_is_enough() {
    let _ = env_logger::try_init();
    let mut config = config();
    config.mapping.rx = vec![PdoEntry(0x6040_0010)];
    config.mapping.tx = vec![PdoEntry(0x6041_0010)];
    let drive = SimulatedDrive::new(1);
    let probe = drive.probe();
    let master = DriveMaster::bring_up(drive, "sim0", config).unwrap();

    let image = master.report().image.slave(1).copied().unwrap();
    assert_eq!((image.output_bytes, image.input_bytes), (2, 2));
    assert!(matches!(master.report().rx, MappingOutcome::Negotiated(Negotiation::Applied)));
    assert!(until(|| master.telemetry().enabled));
    assert_eq!(master.telemetry().cia402_state, Cia402State::OperationEnabled);
    // no torque field in the image
    master.set_target_torque(0.5);
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(probe.applied_torque(1), 0);
    master.shutdown().unwrap();
    assert_eq!(probe.al_state(1), AlState::Init);
}

#[test]
fn minimal_image_is_enough() {
    let _ = env_logger::try_init();
    let drive = SimulatedDrive::new(1).with_image(1, 2, 2);
    let master = DriveMaster::bring_up(drive, "sim0", config()).unwrap();
    assert_eq!(master.report().image.slave(1).map(|image| (image.output_bytes, image.input_bytes)), Some((2, 2)));
    assert!(until(|| master.telemetry().enabled));
    master.shutdown().unwrap();
}

#[test]
fn missing_slave_aborts() {
    let _ = env_logger::try_init();
    let drive = SimulatedDrive::new(1);
    let probe = drive.probe();
    let error = DriveMaster::bring_up(drive, "sim0", Config {slave: 2, .. config()}).err().unwrap();
    assert!(matches!(error, BringupError::Configuration(ConfigurationError::MissingSlave {slave: 2, count: 1})));
    assert!(probe.closed());

    let error = DriveMaster::bring_up(SimulatedDrive::new(0), "sim0", config()).err().unwrap();
    assert!(matches!(error, BringupError::Configuration(ConfigurationError::NoSlaves)));
}

#[test]
fn refused_torque_mode_aborts() {
    let _ = env_logger::try_init();
    let mut drive = SimulatedDrive::new(1);
    drive.fail_sdo_write(0x6060, 0);
    let probe = drive.probe();
    let error = DriveMaster::bring_up(drive, "sim0", config()).err().unwrap();
    assert!(matches!(error, BringupError::Transport(_)));
    assert!(probe.closed());
}

#[test]
fn refused_operational_aborts() {
    let _ = env_logger::try_init();
    let mut drive = SimulatedDrive::new(1);
    drive.refuse_state(1, AlState::Operational, AlStatusCode(0x001b));
    let probe = drive.probe();
    let error = DriveMaster::bring_up(drive, "sim0", config()).err().unwrap();
    match error {
        BringupError::StateTransition(error) => {
            assert_eq!(error.target, AlState::Operational);
            assert_eq!(error.observed, Some(AlState::SafeOperational));
            assert_eq!(error.al_status, AlStatusCode(0x001b));
        },
        other => panic!("unexpected error {:?}", other),
    }
    assert!(probe.closed());
    assert_eq!(probe.al_state(1), AlState::Init);
}

#[test]
fn optional_failures_are_tolerated() {
    let _ = env_logger::try_init();
    // fixed mapping drive, its image does not depend on any assignment object
    let mut drive = SimulatedDrive::new(1)
        .without_object(1, objects::RX_PDO.assign)
        .with_image(1, 9, 9)
        .without_distributed_clocks();
    drive.fail_sdo_write(0x6075, 0);
    drive.fail_sdo_write(0x608f, 2);
    let master = DriveMaster::bring_up(drive, "sim0", config()).unwrap();
    let report = master.report();
    assert_eq!(report.parameter_failures.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
        ["rated current", "gear ratio"]);
    assert!(matches!(report.rx, MappingOutcome::Unsupported));
    assert!(matches!(report.tx, MappingOutcome::Unsupported));
    assert!(! report.distributed_clocks);
    master.shutdown().unwrap();
}

#[test]
fn fault_at_startup_is_reset() {
    let _ = env_logger::try_init();
    let drive = SimulatedDrive::new(1).starting_in_fault(1);
    let probe = drive.probe();
    let master = DriveMaster::bring_up(drive, "sim0", config()).unwrap();
    assert!(until(|| master.telemetry().enabled));
    assert!(probe.controlwords(1).contains(&0x0080));

    // a later fault is only cleared on request
    probe.fault(1);
    assert!(until(|| master.telemetry().cia402_state == Cia402State::Fault));
    master.set_target_torque(0.5);
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(probe.applied_torque(1), 0);
    master.reenable();
    assert!(until(|| master.telemetry().cia402_state == Cia402State::OperationEnabled));
    assert!(until(|| probe.applied_torque(1) == 500));
    master.shutdown().unwrap();
}

#[test]
fn slave_dropping_out_is_requested_back() {
    let _ = env_logger::try_init();
    let config = Config {timing: Timing {state_check_period: 5, .. Timing::immediate()}, .. Config::default()};
    let drive = SimulatedDrive::new(1);
    let probe = drive.probe();
    let master = DriveMaster::bring_up(drive, "sim0", config).unwrap();
    assert!(until(|| master.telemetry().enabled));

    probe.clear_logs();
    probe.drop_to(1, AlState::SafeOperational);
    assert!(until(|| probe.state_requests().contains(&(1, AlState::Operational))));
    assert!(until(|| probe.al_state(1) == AlState::Operational));
    assert!(until(|| master.telemetry().slave_operational));
    master.shutdown().unwrap();
}

#[test]
fn drop_stops_cyclic_thread() {
    let _ = env_logger::try_init();
    let drive = SimulatedDrive::new(1);
    let probe = drive.probe();
    let master = DriveMaster::bring_up(drive, "sim0", config()).unwrap();
    assert!(until(|| master.telemetry().cycles > 3));
    drop(master);
    let exchanges = probe.exchanges();
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(probe.exchanges(), exchanges);
    assert!(! probe.closed());
}

#[test]
fn bringup_on_multiple_slaves() {
    let _ = env_logger::try_init();
    let config = config();
    let layout = ProcessLayout::default();
    let mut drive = SimulatedDrive::new(3);
    let report = Bringup::new(&config, &layout).run(&mut drive, "sim0").unwrap();
    assert_eq!(report.slaves, 3);
    assert_eq!(report.expected_wkc, 9);
    let probe = drive.probe();
    for slave in 1 ..= 3 {
        assert_eq!(probe.al_state(slave), AlState::Operational);
    }
    assert_eq!(drive.exchange_process_data().unwrap(), 9);
}
