/*!
    Bring-up of a drive, from whatever state it powered up in to OPERATIONAL with a known process image.

    [Bringup::run] is a single threaded pipeline running before any cyclic exchange:

    0. open the transport, discover slaves, put them in PRE-OP
    1. write the drive parameters (only the operation mode is mandatory)
    2. negotiate the PDO mappings, keeping the drive's defaults when it refuses
    3. configure distributed clocks
    4. map the process image and check it is large enough
    5. set safe outputs
    6. go to SAFE-OP, feed the drive's watchdog, go to OPERATIONAL
    7. check every slave is OPERATIONAL

    The CiA 402 state machine is then handled by [drive_to_operation_enabled], from the cyclic thread.
*/

use crate::{
    cia402::{self, Cia402State, ControlwordCommand, OperationMode},
    config::{Config, Timing},
    error::{BringupError, BringupTimeoutError, ConfigurationError, Direction, MappingError, TransportError},
    image::ProcessLayout,
    mapping::{self, Negotiation},
    register::TelemetryWriter,
    registers::AlState,
    sdo::{objects, ConfigurablePdo, PdoEntry, Sdo},
    slave::StateController,
    transport::{ImageMap, Transport},
    };
use std::thread::sleep;


/// what happened to a PDO mapping during bring-up
#[derive(Clone, Debug)]
pub enum MappingOutcome {
    /// the drive does not expose the PDO assignment objects, its default mapping is used
    Unsupported,
    /// negotiation disabled by configuration
    Kept,
    Negotiated(Negotiation),
    /// negotiation failed, the drive's default mapping is used
    Failed(MappingError),
}

/// non fatal findings of a successful bring-up
#[derive(Clone, Debug)]
pub struct BringupReport {
    /// number of slaves on the segment
    pub slaves: u16,
    /// optional parameters the drive refused, by object name
    pub parameter_failures: Vec<(&'static str, TransportError)>,
    /// mode of operation read back after configuration, `None` if unreadable
    pub mode_display: Option<i8>,
    pub rx: MappingOutcome,
    pub tx: MappingOutcome,
    pub distributed_clocks: bool,
    pub image: ImageMap,
    pub expected_wkc: u16,
}

impl BringupReport {
    fn new() -> Self {
        Self {
            slaves: 0,
            parameter_failures: Vec::new(),
            mode_display: None,
            rx: MappingOutcome::Kept,
            tx: MappingOutcome::Kept,
            distributed_clocks: false,
            image: ImageMap::default(),
            expected_wkc: 0,
        }
    }
}

/// bring-up pipeline, see the module documentation
pub struct Bringup<'a> {
    config: &'a Config,
    layout: &'a ProcessLayout,
}

impl<'a> Bringup<'a> {
    pub fn new(config: &'a Config, layout: &'a ProcessLayout) -> Self {
        Self {config, layout}
    }

    /**
        run the complete pipeline on the given network interface

        On failure, every slave is requested to go back to INIT and the transport is closed before the error is returned.
    */
    pub fn run(&self, transport: &mut dyn Transport, interface: &str) -> Result<BringupReport, BringupError> {
        let mut report = BringupReport::new();
        match self.stages(transport, interface, &mut report) {
            Ok(()) => {
                log::info!("bring-up complete, {} slaves operational", report.slaves);
                Ok(report)
            },
            Err(err) => {
                log::error!("bring-up aborted: {}", err);
                release(transport, report.slaves);
                Err(err)
            },
        }
    }

    fn stages(&self, transport: &mut dyn Transport, interface: &str, report: &mut BringupReport) -> Result<(), BringupError> {
        let config = self.config;
        let slave = config.slave;
        let states = StateController::new(&config.timing);

        log::info!("opening {}", interface);
        transport.init(interface)?;
        report.slaves = transport.discover_slaves()?;
        if report.slaves == 0
            {return Err(ConfigurationError::NoSlaves.into())}
        if slave > report.slaves
            {return Err(ConfigurationError::MissingSlave {slave, count: report.slaves}.into())}
        log::info!("{} slaves found", report.slaves);
        for target in [AlState::Init, AlState::PreOperational] {
            for index in 1 ..= report.slaves {
                states.set_state(transport, index, target)?;
            }
        }

        self.write_parameters(transport, report)?;
        self.negotiate_mappings(transport, report);

        match transport.configure_distributed_clocks() {
            Ok(()) => report.distributed_clocks = true,
            Err(err) => log::warn!("distributed clocks not configured: {}", err),
        }

        report.image = transport.map_process_image()?;
        let image = report.image.slave(slave).copied().unwrap_or_default();
        let required = (config.min_process_bits + 7) / 8;
        for (direction, available) in [(Direction::Output, image.output_bytes), (Direction::Input, image.input_bytes)] {
            if available < required {
                return Err(ConfigurationError::UndersizedImage {slave, direction, required, available}.into());
            }
        }
        if image.output_bytes < self.layout.output_len() || image.input_bytes < self.layout.input_len() {
            log::warn!("process image of slave {} ({} output bytes, {} input bytes) does not cover the layout, fields beyond will not be exchanged",
                slave, image.output_bytes, image.input_bytes);
        }
        report.expected_wkc = report.image.expected_wkc();
        log::info!("process image mapped: {} output bytes, {} input bytes, expected working counter {}",
            image.output_bytes, image.input_bytes, report.expected_wkc);

        self.layout.init_safe_outputs(transport.outputs(slave), OperationMode::TorqueProfile.raw())
            .map_err(TransportError::from)?;

        for index in 1 ..= report.slaves {
            states.set_state(transport, index, AlState::SafeOperational)?;
        }
        watchdog_burst(transport, &config.timing);
        for index in 1 ..= report.slaves {
            states.set_state(transport, index, AlState::Operational)?;
        }

        for index in 1 ..= report.slaves {
            let state = transport.slave_state(index).ok().and_then(|status| status.state);
            if state != Some(AlState::Operational)
                {return Err(ConfigurationError::NotOperational {slave: index, state}.into())}
        }
        Ok(())
    }

    /// operation mode is mandatory, other parameters only tune the drive
    fn write_parameters(&self, transport: &mut dyn Transport, report: &mut BringupReport) -> Result<(), TransportError> {
        let slave = self.config.slave;
        let parameters = &self.config.parameters;

        objects::MODE_OF_OPERATION.write(transport, slave, OperationMode::TorqueProfile)
            .map_err(|err| {
                log::error!("slave {} refused torque mode: {}", slave, err);
                err
            })?;

        let mut optional = |name: &'static str, result: Result<(), TransportError>| {
            match result {
                Ok(()) => log::debug!("slave {} {} set", slave, name),
                Err(err) => {
                    log::warn!("slave {} {} not set: {}", slave, name, err);
                    report.parameter_failures.push((name, err));
                },
            }
        };
        optional("rated current", objects::RATED_CURRENT.write(transport, slave, parameters.rated_current));
        optional("max torque", objects::MAX_TORQUE.write(transport, slave, parameters.max_torque));
        optional("torque slope", objects::TORQUE_SLOPE.write(transport, slave, parameters.torque_slope));
        optional("interpolation period", objects::INTERPOLATION_PERIOD.write(transport, slave, parameters.interpolation_period));
        optional("interpolation index", objects::INTERPOLATION_INDEX.write(transport, slave, parameters.interpolation_index));
        optional("encoder increments", objects::ENCODER_INCREMENTS.write(transport, slave, parameters.encoder_increments));
        optional("gear ratio", objects::GEAR_RATIO.write(transport, slave, parameters.gear_ratio));

        sleep(self.config.timing.parameter_settle);
        report.mode_display = objects::MODE_DISPLAY.read(transport, slave).ok();
        match report.mode_display {
            Some(mode) if mode == OperationMode::TorqueProfile.raw() => log::info!("slave {} in torque mode", slave),
            Some(mode) => log::warn!("slave {} displays mode {} instead of torque mode", slave, mode),
            None => log::warn!("slave {} mode display unreadable", slave),
        }
        Ok(())
    }

    fn negotiate_mappings(&self, transport: &mut dyn Transport, report: &mut BringupReport) {
        let config = self.config;
        let slave = config.slave;
        if config.mapping.keep_defaults {
            log::info!("slave {} keeps its default PDO mapping", slave);
            return;
        }
        // drives without assignment objects only support their fixed mapping
        if let Err(err) = Sdo::<u8>::complete(config.mapping.rx_assign).read(transport, slave) {
            log::info!("slave {} does not support PDO assignment ({}), using default mapping", slave, err);
            report.rx = MappingOutcome::Unsupported;
            report.tx = MappingOutcome::Unsupported;
            return;
        }
        report.rx = self.negotiate(transport, "rx", config.mapping.rx_pdo(), &config.rx_mapping());
        report.tx = self.negotiate(transport, "tx", config.mapping.tx_pdo(), &config.tx_mapping());
    }

    fn negotiate(&self, transport: &mut dyn Transport, name: &str, pdo: ConfigurablePdo, target: &[PdoEntry]) -> MappingOutcome {
        let slave = self.config.slave;
        let outcome = match mapping::negotiate(transport, slave, pdo, target, None, &self.config.timing) {
            Ok(negotiation) => {
                log::info!("slave {} {} mapping {:?}", slave, name, negotiation);
                MappingOutcome::Negotiated(negotiation)
            },
            Err(err) => {
                log::warn!("slave {} {} mapping failed, using default: {}", slave, name, err);
                MappingOutcome::Failed(err)
            },
        };
        match mapping::describe(transport, slave, pdo.index) {
            Ok(entries) => log::info!("slave {} {} mapping {:#06x}: {:?}", slave, name, pdo.index, entries),
            Err(err) => log::debug!("slave {} {} mapping unreadable: {}", slave, name, err),
        }
        outcome
    }
}

/// request INIT on every slave without waiting for it, then close the transport
pub(crate) fn release(transport: &mut dyn Transport, slaves: u16) {
    for slave in 1 ..= slaves {
        if let Err(err) = transport.set_slave_state(slave, AlState::Init) {
            log::debug!("slave {} cannot be reset to {}: {}", slave, AlState::Init, err);
        }
    }
    transport.close();
}

/// a first exchange, a short pause, then a few quick exchanges so the drive's sync manager watchdog is fed before requesting OPERATIONAL
fn watchdog_burst(transport: &mut dyn Transport, timing: &Timing) {
    fn exchange(transport: &mut dyn Transport) {
        if let Err(err) = transport.exchange_process_data() {
            log::debug!("watchdog exchange failed: {}", err);
        }
    }
    exchange(transport);
    sleep(timing.watchdog_pause);
    for _ in 0 .. timing.watchdog_cycles {
        exchange(transport);
        sleep(timing.watchdog_interval);
    }
}

/**
    run the CiA 402 state machine until the drive reaches operation enabled

    Each attempt reads the statusword from the last received inputs, sends the next command with a null torque, and exchanges once. The decoded state, the statusword and the controlword are published to the register at each attempt, and the last controlword stays in the outputs.
*/
pub fn drive_to_operation_enabled(
        transport: &mut dyn Transport,
        slave: u16,
        layout: &ProcessLayout,
        register: &TelemetryWriter,
        timing: &Timing,
        ) -> Result<(), BringupTimeoutError>
{
    let mut statusword = 0;
    let mut state = Cia402State::NotReady;
    for attempt in 1 ..= timing.enable_attempts {
        statusword = layout.statusword.get(transport.inputs(slave)).unwrap_or(0);
        state = cia402::decode(statusword);
        log::debug!("drive {} attempt {}: {} (statusword {:#06x})", slave, attempt, state, statusword);

        let command = cia402::next_command(state);
        let controlword = command.unwrap_or(ControlwordCommand::EnableOperation).bits();
        register.update(|telemetry| {
            telemetry.statusword = statusword;
            telemetry.cia402_state = state;
            telemetry.controlword = controlword;
            telemetry.enabled = command.is_none();
            });
        let outputs = transport.outputs(slave);
        // the torque field may be out of a minimal image, the controlword cannot
        let _ = layout.target_torque.set(outputs, 0);
        if let Err(err) = layout.controlword.set(outputs, controlword) {
            log::error!("drive {} controlword cannot be written: {}", slave, err);
            break;
        }
        if command.is_none() {
            log::info!("drive {} operation enabled after {} attempts", slave, attempt);
            return Ok(());
        }
        if let Err(err) = transport.exchange_process_data() {
            log::debug!("drive {} exchange failed: {}", slave, err);
        }
        sleep(timing.enable_interval);
    }
    log::error!("drive {} still {} after {} attempts", slave, state, timing.enable_attempts);
    Err(BringupTimeoutError {
        slave,
        attempts: timing.enable_attempts,
        last_state: state,
        statusword,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        register::SharedIoRegister,
        simulation::SimulatedDrive,
        };

    #[test]
    fn fault_is_reset_then_enabled() {
        let timing = Timing::immediate();
        let layout = ProcessLayout::default();
        let mut drive = SimulatedDrive::new(1).starting_in_fault(1);
        drive.init("sim").unwrap();
        drive.discover_slaves().unwrap();
        drive.map_process_image().unwrap();
        drive.set_slave_state(1, AlState::Operational).unwrap();
        drive.exchange_process_data().unwrap();

        let (control, cyclic) = SharedIoRegister::new().split();
        drive_to_operation_enabled(&mut drive, 1, &layout, &cyclic, &timing).unwrap();
        let telemetry = control.telemetry();
        assert_eq!(telemetry.cia402_state, Cia402State::OperationEnabled);
        assert!(telemetry.enabled);
        assert_eq!(telemetry.controlword, 0x000f);
        assert!(drive.controlwords(1).contains(&0x0080));
    }

    #[test]
    fn unresponsive_drive_times_out() {
        let timing = Timing {enable_attempts: 7, .. Timing::immediate()};
        let layout = ProcessLayout::default();
        let mut drive = SimulatedDrive::new(1).frozen(1);
        drive.init("sim").unwrap();
        drive.discover_slaves().unwrap();
        drive.map_process_image().unwrap();
        drive.set_slave_state(1, AlState::Operational).unwrap();

        let (control, cyclic) = SharedIoRegister::new().split();
        let error = drive_to_operation_enabled(&mut drive, 1, &layout, &cyclic, &timing).unwrap_err();
        assert_eq!(error.attempts, 7);
        assert_eq!(error.last_state, Cia402State::NotReady);
        assert!(! control.telemetry().enabled);
    }

    #[test]
    fn release_resets_every_slave_and_closes() {
        let mut drive = SimulatedDrive::new(2);
        drive.init("sim").unwrap();
        drive.discover_slaves().unwrap();
        drive.map_process_image().unwrap();
        for slave in 1 ..= 2 {
            drive.set_slave_state(slave, AlState::Operational).unwrap();
        }
        let probe = drive.probe();
        release(&mut drive, 2);
        assert_eq!(probe.al_state(1), AlState::Init);
        assert_eq!(probe.al_state(2), AlState::Init);
        assert!(probe.closed());
    }
}
