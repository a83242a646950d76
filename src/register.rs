/*!
    Values shared between the control thread and the cyclic exchange thread.

    The register is split in two handles so each field has only one writer:

    - [SetpointWriter] is held by the control side, it writes the torque setpoint and reads telemetry
    - [TelemetryWriter] is held by the cyclic thread, it writes telemetry and reads the setpoint

    Both lock the same mutex, only for copying a few values in or out. No transport call ever happens under the lock.
*/

use crate::cia402::Cia402State;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};


/// last known state of the drive and of the communication, as published by the cyclic thread
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Telemetry {
    /// position actual value, in encoder increments
    pub position: i32,
    /// velocity in encoder increments per second, measured or estimated from successive positions
    pub velocity: f32,
    /// torque actual value, in thousandths of the rated torque
    pub torque: i16,
    /// mode of operation actually running on the drive
    pub mode_display: i8,
    pub statusword: u16,
    /// controlword currently sent to the drive
    pub controlword: u16,
    /// always decoded from [Self::statusword]
    pub cia402_state: Cia402State,
    /// the last exchange had the expected working counter
    pub communication_ok: bool,
    /// the slave was OPERATIONAL at the last check
    pub slave_operational: bool,
    /// the drive reached operation enabled during the last enabling sequence
    pub enabled: bool,
    pub working_counter: u16,
    /// number of exchanges since the cyclic thread started
    pub cycles: u64,
    /// number of exchanges with a working counter lower than expected
    pub degraded_cycles: u64,
}

#[derive(Default)]
struct Shared {
    setpoint: f32,
    telemetry: Telemetry,
}

/// shared storage between the control side and the cyclic thread, split it to use it
#[derive(Clone, Default)]
pub struct SharedIoRegister {
    shared: Arc<Mutex<Shared>>,
}

impl SharedIoRegister {
    pub fn new() -> Self {Self::default()}

    /// split into the control side handle and the cyclic side handle
    pub fn split(self) -> (SetpointWriter, TelemetryWriter) {
        (
            SetpointWriter {shared: self.shared.clone()},
            TelemetryWriter {shared: self.shared},
        )
    }
}

// the shared values stay consistent even if a thread panicked while holding the lock, since every write is a plain copy
fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// control side of a [SharedIoRegister]
pub struct SetpointWriter {
    shared: Arc<Mutex<Shared>>,
}
impl SetpointWriter {
    /// set the torque to apply, in multiples of the rated torque. It only takes effect while operation is enabled.
    pub fn set_target_torque(&self, torque: f32) {
        lock(&self.shared).setpoint = torque;
    }
    pub fn target_torque(&self) -> f32 {
        lock(&self.shared).setpoint
    }
    /// snapshot of the telemetry
    pub fn telemetry(&self) -> Telemetry {
        lock(&self.shared).telemetry
    }
}

/// cyclic side of a [SharedIoRegister]
pub struct TelemetryWriter {
    shared: Arc<Mutex<Shared>>,
}
impl TelemetryWriter {
    /// current torque setpoint
    pub fn setpoint(&self) -> f32 {
        lock(&self.shared).setpoint
    }
    /// snapshot of the telemetry
    pub fn telemetry(&self) -> Telemetry {
        lock(&self.shared).telemetry
    }
    /// write a group of telemetry fields at once
    pub fn update(&self, write: impl FnOnce(&mut Telemetry)) {
        write(&mut lock(&self.shared).telemetry)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_values() {
        let (control, cyclic) = SharedIoRegister::new().split();
        control.set_target_torque(0.25);
        assert_eq!(cyclic.setpoint(), 0.25);
        cyclic.update(|t| {
            t.statusword = 0x0237;
            t.cia402_state = Cia402State::OperationEnabled;
            });
        assert_eq!(control.telemetry().statusword, 0x0237);
        assert_eq!(control.telemetry().cia402_state, Cia402State::OperationEnabled);
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let (control, cyclic) = SharedIoRegister::new().split();
        control.set_target_torque(0.5);
        let _ = std::thread::spawn(move || {
            cyclic.update(|_| panic!("cyclic thread crashed"));
            }).join();
        assert_eq!(control.target_torque(), 0.5);
        control.set_target_torque(0.);
        assert_eq!(control.target_torque(), 0.);
    }
}
