/*!
    The cyclic exchange thread.

    [CyclicExchange] owns the transport once bring-up is done. It goes through the states of [LoopState]:

    - waiting for the master to be ready, it does not touch the transport
    - running, where each tick writes the outputs, exchanges once, checks the working counter and publishes the inputs
    - stopped, after having sent a shutdown command to the drive

    The torque setpoint is only applied while the drive is in [Cia402State::OperationEnabled], a null torque is sent in any other state.
*/

use crate::{
    bringup::drive_to_operation_enabled,
    cia402::{self, Cia402State, ControlwordCommand, OperationMode},
    config::{Config, Timing},
    image::ProcessLayout,
    register::TelemetryWriter,
    registers::AlState,
    transport::Transport,
    };
use core::sync::atomic::{AtomicBool, Ordering::*};
use std::{
    sync::Arc,
    thread::sleep,
    time::Instant,
    };


/// flags sent by the control side to the cyclic thread
#[derive(Debug, Default)]
pub struct CycleControl {
    ready: AtomicBool,
    stop: AtomicBool,
    reenable: AtomicBool,
}
impl CycleControl {
    pub fn new() -> Self {Self::default()}
    /// the master is configured, the cyclic exchange can start
    pub fn set_ready(&self)  {self.ready.store(true, Release)}
    /// ask the cyclic thread to stop at its next tick
    pub fn stop(&self)  {self.stop.store(true, Release)}
    /// ask the cyclic thread to run the enabling sequence again
    pub fn reenable(&self)  {self.reenable.store(true, Release)}

    pub fn is_ready(&self) -> bool  {self.ready.load(Acquire)}
    pub fn is_stopped(&self) -> bool  {self.stop.load(Acquire)}
    fn take_reenable(&self) -> bool  {self.reenable.swap(false, AcqRel)}
}

/// current state of a [CyclicExchange]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopState {
    WaitingForMasterInit,
    Running,
    Stopped,
}

/// periodic exchange of the process data with one drive
pub struct CyclicExchange<T: Transport> {
    transport: T,
    slave: u16,
    layout: ProcessLayout,
    timing: Timing,
    expected_wkc: u16,
    register: TelemetryWriter,
    control: Arc<CycleControl>,

    state: LoopState,
    /// controlword currently in the outputs
    controlword: u16,
    /// drive state decoded from the last valid inputs
    drive: Cia402State,
    /// the enabling sequence must run at the next valid exchange
    enable_pending: bool,
    degraded: bool,
    ticks: u64,
    /// last position and its reception time, for velocity estimation
    last_position: Option<(i32, Instant)>,
    velocity: f32,
}

impl<T: Transport> CyclicExchange<T> {
    pub fn new(
            transport: T,
            config: &Config,
            layout: ProcessLayout,
            expected_wkc: u16,
            register: TelemetryWriter,
            control: Arc<CycleControl>,
            ) -> Self {
        Self {
            transport,
            slave: config.slave,
            layout,
            timing: config.timing.clone(),
            expected_wkc,
            register,
            control,

            state: LoopState::WaitingForMasterInit,
            controlword: ControlwordCommand::Shutdown.bits(),
            drive: Cia402State::NotReady,
            enable_pending: true,
            degraded: false,
            ticks: 0,
            last_position: None,
            velocity: 0.,
        }
    }

    pub fn state(&self) -> LoopState  {self.state}

    /**
        wait for the master ready flag, polling it at the configured interval

        Returns `true` and switches to [LoopState::Running] once ready. Switches to [LoopState::Stopped] when a stop is requested or the poll bound elapses.
    */
    pub fn wait_for_master(&mut self) -> bool {
        for _ in 0 .. self.timing.master_ready_polls {
            if self.control.is_stopped()
                {break}
            if self.control.is_ready() {
                log::info!("cyclic exchange started");
                self.state = LoopState::Running;
                self.register.update(|telemetry| telemetry.slave_operational = true);
                return true;
            }
            sleep(self.timing.master_ready_interval);
        }
        if ! self.control.is_stopped() {
            log::error!("master not ready after {} polls, cyclic exchange not started", self.timing.master_ready_polls);
        }
        self.state = LoopState::Stopped;
        false
    }

    /// one tick of the running state, returns whether the exchange had the expected working counter
    pub fn step(&mut self) -> bool {
        let slave = self.slave;
        let layout = self.layout;
        if self.control.take_reenable() {
            log::info!("drive {} enabling requested", slave);
            self.enable_pending = true;
        }

        // outputs
        let setpoint = self.register.setpoint();
        let torque = if self.drive == Cia402State::OperationEnabled {
            // float to integer conversion saturates
            (setpoint * 1000.) as i16
        } else {0};
        let outputs = self.transport.outputs(slave);
        // fields out of a minimal image are simply not sent
        let _ = layout.controlword.set(outputs, self.controlword);
        let _ = layout.mode.set(outputs, OperationMode::TorqueProfile.raw());
        let _ = layout.target_torque.set(outputs, torque);

        // exchange
        let wkc = match self.transport.exchange_process_data() {
            Ok(wkc) => wkc,
            Err(err) => {
                log::debug!("exchange failed: {}", err);
                0
            },
        };
        self.ticks += 1;
        let ok = wkc >= self.expected_wkc;
        if ok == self.degraded {
            if ok {log::info!("working counter back to {}", wkc)}
            else {log::warn!("working counter too low: {} < {}", wkc, self.expected_wkc)}
            self.degraded = ! ok;
        }

        // inputs
        if ok {
            let inputs = self.transport.inputs(slave);
            let statusword = layout.statusword.get(inputs).unwrap_or(0);
            let mode_display = layout.mode_display.get(inputs).ok();
            let position = layout.position.get(inputs).ok();
            let torque = layout.torque.get(inputs).ok();
            let velocity = layout.velocity.and_then(|field| field.get(inputs).ok());

            self.drive = cia402::decode(statusword);
            self.velocity = match (velocity, position) {
                (Some(velocity), _) => velocity as f32,
                (None, Some(position)) => self.estimate_velocity(position),
                (None, None) => self.velocity,
            };
            let (drive, velocity, controlword) = (self.drive, self.velocity, self.controlword);
            self.register.update(|telemetry| {
                telemetry.statusword = statusword;
                telemetry.cia402_state = drive;
                telemetry.controlword = controlword;
                if let Some(mode) = mode_display {telemetry.mode_display = mode}
                if let Some(position) = position {telemetry.position = position}
                if let Some(torque) = torque {telemetry.torque = torque}
                telemetry.velocity = velocity;
                telemetry.communication_ok = true;
                telemetry.working_counter = wkc;
                telemetry.cycles += 1;
                });
        }
        else {
            self.register.update(|telemetry| {
                telemetry.communication_ok = false;
                telemetry.working_counter = wkc;
                telemetry.cycles += 1;
                telemetry.degraded_cycles += 1;
                });
        }

        // enabling sequence, only once the inputs are trustworthy
        if ok && self.enable_pending {
            self.enable_pending = false;
            if let Err(err) = drive_to_operation_enabled(&mut self.transport, slave, &layout, &self.register, &self.timing) {
                log::error!("{}, torque stays disabled", err);
            }
            let telemetry = self.register.telemetry();
            self.drive = telemetry.cia402_state;
            self.controlword = telemetry.controlword;
        }

        // a null period disables the watch
        if self.ticks.checked_rem(u64::from(self.timing.state_check_period)) == Some(0) {
            self.check_slave_state();
        }
        ok
    }

    /// request OPERATIONAL again if the slave fell out of it, without waiting for it
    fn check_slave_state(&mut self) {
        let slave = self.slave;
        let state = match self.transport.slave_state(slave) {
            Ok(status) => status.state,
            Err(err) => {
                log::debug!("slave {} state unreadable: {}", slave, err);
                None
            },
        };
        let operational = state == Some(AlState::Operational);
        self.register.update(|telemetry| telemetry.slave_operational = operational);
        if ! operational {
            log::warn!("slave {} in {:?} instead of {}, requesting it again", slave, state, AlState::Operational);
            if let Err(err) = self.transport.set_slave_state(slave, AlState::Operational) {
                log::warn!("slave {} state request failed: {}", slave, err);
            }
        }
    }

    fn estimate_velocity(&mut self, position: i32) -> f32 {
        let now = Instant::now();
        let velocity = match self.last_position {
            Some((last, time)) => {
                let elapsed = now.duration_since(time).as_secs_f32();
                if elapsed > 0. {position.wrapping_sub(last) as f32 / elapsed}
                else {self.velocity}
            },
            None => 0.,
        };
        self.last_position = Some((position, now));
        velocity
    }

    /// send a shutdown command with a null torque, then stop
    pub fn stop_drive(&mut self) {
        let slave = self.slave;
        self.controlword = ControlwordCommand::Shutdown.bits();
        let outputs = self.transport.outputs(slave);
        let _ = self.layout.controlword.set(outputs, self.controlword);
        let _ = self.layout.target_torque.set(outputs, 0);
        if let Err(err) = self.transport.exchange_process_data() {
            log::warn!("final exchange failed: {}", err);
        }
        let controlword = self.controlword;
        self.register.update(|telemetry| {
            telemetry.controlword = controlword;
            telemetry.enabled = false;
            });
        self.state = LoopState::Stopped;
        log::info!("cyclic exchange stopped after {} cycles", self.ticks);
    }

    /**
        run until a stop is requested, then give back the transport

        Ticks are scheduled on absolute deadlines so the period does not drift. After an overrun, the next deadline is counted from the current time.
    */
    pub fn run(mut self) -> T {
        if self.wait_for_master() {
            let mut deadline = Instant::now();
            while ! self.control.is_stopped() {
                self.step();
                deadline += self.timing.cycle_period;
                let now = Instant::now();
                if deadline > now {
                    sleep(deadline - now);
                } else {
                    deadline = now;
                }
            }
            self.stop_drive();
        }
        self.transport
    }

    /// the transport, for inspection
    pub fn transport(&mut self) -> &mut T  {&mut self.transport}
    /// give back the transport without running any cycle
    pub fn into_transport(self) -> T  {self.transport}
}
