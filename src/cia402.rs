/*!
    CiA 402 device profile: status word decoding and the transitions of the drive application state machine.

    The state of a drive is never stored on its own, it is always recomputed with [decode] from the last status word received. The next command to send is given by [next_command], which is the only place encoding the transition graph.

    ```text
                    NotReady
                       |
                  SwitchOnDisabled  <------------ Fault <--- FaultReactionActive
                       | Shutdown        FaultReset
                  ReadyToSwitchOn
                       | SwitchOn
                   SwitchedOn
                       | EnableOperation
                OperationEnabled
    ```
*/

use crate::data;
use bilge::prelude::*;
use core::fmt;


/**
bit structure of a status word

| Bit |  Meaning | Presence |
|-----|----------|----------|
| 0	| Ready to switch on	| M
| 1	| Switched on	| M
| 2	| Operation enabled	| M
| 3	| Fault	| M
| 4	| Voltage enabled	| O
| 5	| Quick stop	| O
| 6	| Switch on disabled	| M
| 7	| Warning	| O
| 8	| Manufacturer specific	| O
| 9	| Remote	| O
| 10	| Target reached	| O
| 11	| Internal limit active	| C
| 12	| Operation mode specific (Mandatory for csp, csv, cst mode)	| O
| 13	| Operation mode specific	| O
| 14-15	| Manufacturer specific	| O
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct StatusWord {
    pub ready_switch_on: bool,
    pub switched_on: bool,
    pub operation_enabled: bool,
    pub fault: bool,
    pub voltage_enabled: bool,
    pub quick_stop: bool,
    pub switch_on_disabled: bool,
    pub warning: bool,
    reserved: u1,
    pub remote: bool,
    pub target_reached: bool,
    pub limit_active: bool,
    reserved: u4,
}
data::bilge_pdudata!(StatusWord, u16);

impl StatusWord {
    /// bits determining the device state
    pub const STATE_MASK: u16 = 0x006f;

    /// state of the drive this status word reports
    pub fn state(self) -> Cia402State {
        decode(u16::from(self))
    }
}

impl fmt::Display for StatusWord {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "StatusWord{{")?;
		for (active, mark) in [ (self.ready_switch_on(), "rtso"),
								(self.switched_on(), "so"),
								(self.operation_enabled(), "oe"),
								(self.fault(), "f"),
								(self.voltage_enabled(), "ve"),
								(self.quick_stop(), "qs"),
								(self.switch_on_disabled(), "sod"),
								(self.warning(), "w"),
								(self.remote(), "r"),
								(self.target_reached(), "tr"),
								(self.limit_active(), "la"),
								] {
			write!(f, " ")?;
			if active {
				write!(f, "{}", mark)?;
			} else {
				for _ in 0 .. mark.len() {write!(f, " ")?;}
			}
		}
		write!(f, "}}")?;
		Ok(())
	}
}

/**
Control word of a servo drive

| Bit	|	Category	|   Meaning	|
|-------|---------------|-----------|
| 0	|	M	|	Switch on |
| 1	|	M	|	Enable voltage |
| 2	|	O	|	Quick stop |
| 3	|	M	|	Enable operation |
| 4 – 6	|	O	|	Operation mode specific |
| 7	|	M	|	Fault reset |
| 8	|	O	|	Halt |
| 9	|	O	|	Operation mode specific |
| 10	|	O	|	reserved |
| 11 – 15	|	O	|	Manufacturer specific |
*/
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct ControlWord {
    pub switch_on: bool,
    pub enable_voltage: bool,
    pub quick_stop: bool,
    pub enable_operation: bool,
    reserved: u3,
    pub reset_fault: bool,
    pub halt: bool,
    pub specific: bool,
    reserved: u6,
}
data::bilge_pdudata!(ControlWord, u16);

impl fmt::Display for ControlWord {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ControlWord{{") ?;
		for (active, mark) in [ (self.switch_on(), "so"),
								(self.enable_voltage(), "ev"),
								(self.quick_stop(), "qs"),
								(self.enable_operation(), "eo"),
								(self.reset_fault(), "rf"),
								(self.halt(), "h"),
								] {
			write!(f, " ")?;
			if active {
				write!(f, "{}", mark)?;
			} else {
				for _ in 0 .. mark.len() {write!(f, " ")?;}
			}
		}
		write!(f, "}}")?;
		Ok(())
	}
}


/// servodrive control-loop type, object `0x6060`
#[bitsize(8)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum OperationMode {
    #[default]
	Off = 0,
	ProfilePosition = 1,
	Velocity = 2,
	ProfileVelocity = 3,
	TorqueProfile = 4,
	Homing = 6,
	InterpolatedPosition = 7,

	/// CSP
	SynchronousPosition = 8,
	/// CSV
	SynchronousVelocity = 9,
	/// CST
	SynchronousTorque = 10,
	SynchronousTorqueCommutation = 11,
}
data::bilge_pdudata!(OperationMode, u8, try);

impl OperationMode {
    /// signed byte of objects `0x6060` and `0x6061` in a process image
    pub fn raw(self) -> i8 {u8::from(self) as i8}
}


/// state of the CiA 402 application state machine of a drive
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Cia402State {
    #[default]
    NotReady,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
}

impl fmt::Display for Cia402State {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
            Self::NotReady => "NOT_READY",
            Self::SwitchOnDisabled => "SWITCH_ON_DISABLED",
            Self::ReadyToSwitchOn => "READY_TO_SWITCH_ON",
            Self::SwitchedOn => "SWITCHED_ON",
            Self::OperationEnabled => "OPERATION_ENABLED",
            Self::QuickStopActive => "QUICK_STOP_ACTIVE",
            Self::FaultReactionActive => "FAULT_REACTION_ACTIVE",
            Self::Fault => "FAULT",
        })
	}
}

/**
    decode the drive state from a raw status word.

    Only bits `0x6f` are significant. A pattern outside the CiA 402 table decodes to [Cia402State::Fault] if the fault bit is set, and to [Cia402State::NotReady] otherwise. This is defined for every possible status word.
*/
pub fn decode(statusword: u16) -> Cia402State {
    match statusword & StatusWord::STATE_MASK {
        0x00 => Cia402State::NotReady,
        0x40 => Cia402State::SwitchOnDisabled,
        0x21 => Cia402State::ReadyToSwitchOn,
        0x23 => Cia402State::SwitchedOn,
        0x27 => Cia402State::OperationEnabled,
        0x07 => Cia402State::QuickStopActive,
        0x0f => Cia402State::FaultReactionActive,
        0x08 => Cia402State::Fault,
        _ if statusword & 0x0008 != 0 => Cia402State::Fault,
        _ => Cia402State::NotReady,
    }
}


/// commands the master sends through the control word to request a state transition
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum ControlwordCommand {
    /// enable voltage and quick stop, leads to [Cia402State::ReadyToSwitchOn]
    Shutdown = 0x0006,
    /// leads to [Cia402State::SwitchedOn]
    SwitchOn = 0x0007,
    /// leads to [Cia402State::OperationEnabled]
    EnableOperation = 0x000f,
    /// leaves [Cia402State::Fault] for [Cia402State::SwitchOnDisabled]
    FaultReset = 0x0080,
}

impl ControlwordCommand {
    pub fn bits(self) -> u16 {self as u16}
}
impl From<ControlwordCommand> for ControlWord {
    fn from(command: ControlwordCommand) -> Self {
        Self::from(command.bits())
    }
}
impl From<ControlwordCommand> for u16 {
    fn from(command: ControlwordCommand) -> Self {command.bits()}
}

/**
    next command to send to a drive in the given state to bring it to [Cia402State::OperationEnabled]

    Returns `None` once operation is enabled, the caller then stops polling. Any state without a dedicated transition falls back to [ControlwordCommand::Shutdown] which is safe in every state.
*/
pub fn next_command(state: Cia402State) -> Option<ControlwordCommand> {
    use Cia402State::*;
    match state {
        Fault => Some(ControlwordCommand::FaultReset),
        NotReady | SwitchOnDisabled | QuickStopActive => Some(ControlwordCommand::Shutdown),
        ReadyToSwitchOn => Some(ControlwordCommand::SwitchOn),
        SwitchedOn => Some(ControlwordCommand::EnableOperation),
        OperationEnabled => None,
        FaultReactionActive => Some(ControlwordCommand::Shutdown),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: [(u16, Cia402State); 8] = [
        (0x00, Cia402State::NotReady),
        (0x40, Cia402State::SwitchOnDisabled),
        (0x21, Cia402State::ReadyToSwitchOn),
        (0x23, Cia402State::SwitchedOn),
        (0x27, Cia402State::OperationEnabled),
        (0x07, Cia402State::QuickStopActive),
        (0x0f, Cia402State::FaultReactionActive),
        (0x08, Cia402State::Fault),
        ];

    #[test]
    fn decode_whole_domain() {
        for statusword in 0 ..= u16::MAX {
            let state = decode(statusword);
            assert_eq!(state, decode(statusword), "decode must be deterministic");
            let masked = statusword & 0x6f;
            match TABLE.iter().find(|(bits, _)| *bits == masked) {
                Some((_, expected)) => assert_eq!(state, *expected, "statusword {:#06x}", statusword),
                None if statusword & 0x8 != 0 => assert_eq!(state, Cia402State::Fault, "statusword {:#06x}", statusword),
                None => assert_eq!(state, Cia402State::NotReady, "statusword {:#06x}", statusword),
            }
        }
    }

    #[test]
    fn ignored_bits_do_not_change_state() {
        // voltage enabled, warning, remote, target reached, limit active
        assert_eq!(decode(0x0e90 | 0x27), Cia402State::OperationEnabled);
        assert_eq!(decode(0x0231), Cia402State::ReadyToSwitchOn);
    }

    #[test]
    fn ready_to_switch_on_scenario() {
        let state = decode(0x0231);
        assert_eq!(state, Cia402State::ReadyToSwitchOn);
        assert_eq!(next_command(state).map(u16::from), Some(0x07));
    }

    #[test]
    fn fault_scenario() {
        let state = decode(0x0008);
        assert_eq!(state, Cia402State::Fault);
        assert_eq!(next_command(state).map(u16::from), Some(0x80));
    }

    #[test]
    fn canonical_sequence_takes_three_commands() {
        let sequence = [
            Cia402State::NotReady,
            Cia402State::SwitchOnDisabled,
            Cia402State::ReadyToSwitchOn,
            Cia402State::SwitchedOn,
            Cia402State::OperationEnabled,
            ];
        let commands: Vec<_> = sequence.iter()
            .filter_map(|&state| next_command(state))
            .collect();
        // NotReady leaves by itself, the Shutdown it gets is repeated for SwitchOnDisabled
        assert_eq!(commands, [
            ControlwordCommand::Shutdown,
            ControlwordCommand::Shutdown,
            ControlwordCommand::SwitchOn,
            ControlwordCommand::EnableOperation,
            ]);
        let mut distinct = commands.clone();
        distinct.dedup();
        assert_eq!(distinct, [
            ControlwordCommand::Shutdown,
            ControlwordCommand::SwitchOn,
            ControlwordCommand::EnableOperation,
            ]);
        assert_eq!(next_command(Cia402State::OperationEnabled), None);
    }

    #[test]
    fn every_state_has_a_safe_answer() {
        assert_eq!(next_command(Cia402State::QuickStopActive), Some(ControlwordCommand::Shutdown));
        assert_eq!(next_command(Cia402State::FaultReactionActive), Some(ControlwordCommand::Shutdown));
        assert_eq!(next_command(Cia402State::NotReady), Some(ControlwordCommand::Shutdown));
    }

    #[test]
    fn command_bits() {
        let control = ControlWord::from(ControlwordCommand::EnableOperation);
        assert!(control.switch_on() && control.enable_voltage() && control.quick_stop() && control.enable_operation());
        assert!(!control.reset_fault());
        assert!(ControlWord::from(ControlwordCommand::FaultReset).reset_fault());
        assert_eq!(StatusWord::from(0x0027).state(), Cia402State::OperationEnabled);
    }
}
