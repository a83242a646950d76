use crate::{
    bringup::{self, Bringup, BringupReport},
    config::{Config, Timing},
    cyclic::{CycleControl, CyclicExchange},
    error::{BringupError, TransportError},
    image::ProcessLayout,
    realtime,
    register::{SetpointWriter, SharedIoRegister, Telemetry},
    registers::AlState,
    slave::StateController,
    transport::Transport,
    };
use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    };


/**
    This struct brings up one CiA 402 drive and keeps it in torque control from a dedicated cyclic thread.

    The caller's thread only exchanges values with the cyclic thread through [Self::set_target_torque] and [Self::telemetry], which never block on the transport.

    ## Note

    The transport belongs to the cyclic thread while it runs, and is given back to [Self::shutdown] when the thread exits, so nothing else can use it concurrently. Dropping a running master stops the cyclic thread without bringing the slaves back to INIT.

    ## Example

    ```ignore
    let master = DriveMaster::bring_up(transport, "eno1", Config::load(path)?)?;
    while master.telemetry().enabled {
        master.set_target_torque(0.1);
        std::thread::sleep(Duration::from_millis(10));
    }
    master.shutdown()?;
    ```
*/
pub struct DriveMaster<T: Transport + 'static> {
    control: Arc<CycleControl>,
    setpoint: SetpointWriter,
    /// gives `None` when the thread never received the transport
    thread: Option<JoinHandle<Option<T>>>,
    report: BringupReport,
    timing: Timing,
}

impl<T: Transport + 'static> DriveMaster<T> {
    /**
        bring up the drive on the given network interface, then start the cyclic exchange

        On error the slaves have been requested to go back to INIT, the transport is closed and no thread is running.
    */
    pub fn bring_up(mut transport: T, interface: &str, config: Config) -> Result<Self, BringupError> {
        config.validate()?;
        let layout = ProcessLayout::default();
        let report = Bringup::new(&config, &layout).run(&mut transport, interface)?;

        // the transport is only handed to the thread once it exists, so a failed spawn can still release the slaves
        let (handoff, received) = mpsc::sync_channel::<CyclicExchange<T>>(1);
        let promote = config.realtime;
        let spawned = thread::Builder::new()
            .name("etherdrive-cyclic".into())
            .spawn(move || {
                let exchange = received.recv().ok()?;
                if promote {
                    realtime::promote_current_thread();
                }
                Some(exchange.run())
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(err) => {
                log::error!("cannot start cyclic thread: {}", err);
                bringup::release(&mut transport, report.slaves);
                return Err(BringupError::Thread(Arc::new(err)));
            },
        };

        let (setpoint, telemetry) = SharedIoRegister::new().split();
        let control = Arc::new(CycleControl::new());
        let exchange = CyclicExchange::new(transport, &config, layout, report.expected_wkc, telemetry, control.clone());
        if let Err(mpsc::SendError(exchange)) = handoff.send(exchange) {
            log::error!("cyclic thread exited before start");
            bringup::release(&mut exchange.into_transport(), report.slaves);
            return Err(TransportError::Master("cyclic thread exited before start").into());
        }
        control.set_ready();

        Ok(Self {
            control,
            setpoint,
            thread: Some(thread),
            report,
            timing: config.timing,
        })
    }

    /// set the torque to apply, in multiples of the drive's rated torque. It is only applied while operation is enabled.
    pub fn set_target_torque(&self, torque: f32) {
        self.setpoint.set_target_torque(torque)
    }
    /// last values published by the cyclic thread
    pub fn telemetry(&self) -> Telemetry {
        self.setpoint.telemetry()
    }
    /// run the enabling sequence again, typically after a fault has been cleared
    pub fn reenable(&self) {
        self.control.reenable()
    }
    /// non fatal findings of the bring-up
    pub fn report(&self) -> &BringupReport {
        &self.report
    }

    /**
        stop the cyclic exchange, bring the slaves to SAFE-OP then INIT, and close the transport

        State changes are best effort, their failures are only logged. An error is returned if the cyclic thread panicked, in which case the transport is lost.
    */
    pub fn shutdown(mut self) -> Result<(), TransportError> {
        let mut transport = self.stop()
            .ok_or(TransportError::Master("cyclic thread already stopped"))??;
        let states = StateController::new(&self.timing);
        for target in [AlState::SafeOperational, AlState::Init] {
            for slave in 1 ..= self.report.slaves {
                if let Err(err) = states.set_state(&mut transport, slave, target) {
                    log::warn!("{}", err);
                }
            }
        }
        transport.close();
        log::info!("drive master stopped");
        Ok(())
    }

    /// stop and join the cyclic thread, giving back the transport
    fn stop(&mut self) -> Option<Result<T, TransportError>> {
        let thread = self.thread.take()?;
        self.control.stop();
        Some(match thread.join() {
            Ok(Some(transport)) => Ok(transport),
            Ok(None) => Err(TransportError::Master("cyclic thread never received the transport")),
            Err(_) => {
                log::error!("cyclic thread panicked");
                Err(TransportError::Master("cyclic thread panicked"))
            },
        })
    }
}

impl<T: Transport + 'static> Drop for DriveMaster<T> {
    fn drop(&mut self) {
        if self.stop().is_some() {
            log::warn!("drive master dropped without shutdown");
        }
    }
}
