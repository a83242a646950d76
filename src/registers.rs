/*!
    Application layer (AL) state of a fieldbus slave, and the status codes a slave reports when it refuses a state change.

    Only the states and codes relevant to bringing up a drive are defined here, the registers themselves are accessed by the transport.
*/

use bilge::prelude::*;
use core::fmt;


/**
    the current operation state on one device.

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.

    ETG.1000.6 table 9
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlState {
    /**
        Transitional state meaning the slave is booting up and ready for nothing yet. The slave should normally reach the [Self::Init] state within seconds.

        It cannot be requested, nor changed while it is active.
    */
    Bootstrap = 3,
    /**
        The init mode allows to set many communication registers, like the slave address, the mailbox setup, etc.

        This mode should be used at the beginning of a communication.
    */
    Init = 1,
    /**
        the pre operational mode allows mailbox communication, which is mandatory to configure the drive parameters and PDO mapping before realtime operations.
    */
    PreOperational = 2,
    /**
        Mode allowing realtime operations, except that commands sent to the slaves via its mapping will not be executed.

        Mapping is no more allowed in this state.
    */
    SafeOperational = 4,
    /**
        Realtime operations running

        The master has full access to the slave's effector functions. slaves expect the master to regularly refresh its commands, or their watchdog will drop them back to [Self::SafeOperational]
    */
    Operational = 8,
}

impl AlState {
    /// decode the 4 state bits of an AL status register, `None` for a mixed or undefined state
    pub fn from_code(code: u8) -> Option<Self> {
        if code > 0xf  {return None}
        Self::try_from(u4::new(code)).ok()
    }
    /// 4 bits code of the state in the AL control and status registers
    pub fn code(self) -> u8 {
        u4::from(self).value()
    }
}

impl fmt::Display for AlState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
            Self::Bootstrap => "BOOT",
            Self::Init => "INIT",
            Self::PreOperational => "PRE_OP",
            Self::SafeOperational => "SAFE_OP",
            Self::Operational => "OPERATIONAL",
        })
	}
}

/// ETG.1000.6 table 11, restricted to the codes a drive can report during bring-up
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlError {
    ///  No error Any Current state
    NoError = 0x0000,
    ///  Unspecified error
    Unspecified = 0x0001,
    ///  No Memory
    NoMemory = 0x0002,
    ///  Invalid Device Setup
    InvalidDeviceSetup = 0x0003,
    ///  Invalid requested state change
    InvalidStateRequest = 0x0011,
    ///  Unknown requested state
    UnknownStateRequest = 0x0012,
    ///  Bootstrap not supported
    BootstrapNotSupported = 0x0013,
    ///  No valid firmware
    NoValidFirmware = 0x0014,
    ///  Invalid mailbox configuration for switching to [AlState::Init]
    InvalidMailboxConfigBoot = 0x0015,
    ///  Invalid mailbox configuration for switching to [AlState::PreOperational]
    InvalidMailboxConfigPreop = 0x0016,
    ///  Invalid sync manager configuration
    InvalidSyncConfig = 0x0017,
    ///  No valid inputs available
    NoInputsAvailable = 0x0018,
    ///  No valid outputs
    NoValidInputs = 0x0019,
    ///  Synchronization error
    Synchronization = 0x001A,
    ///  Sync manager watchdog
    SyncWatchdog = 0x001B,
    ///  Invalid Sync Manager Types
    InvalidSyncTypes = 0x001C,
    ///  Invalid Output Configuration
    InvalidOutputConfig = 0x001D,
    ///  Invalid Input Configuration
    InvalidInputConfig = 0x001E,
    ///  Invalid Watchdog Configuration
    InvalidWatchdogConfig = 0x001F,
    ///  Slave needs cold start
    NeedColdStart = 0x0020,
    ///  Slave needs INIT
    NeedInit = 0x0021,
    ///  Slave needs PREOP
    NeedPreop = 0x0022,
    ///  Slave needs SAFEOP
    NeedSafeOp = 0x0023,
    ///  Invalid Input Mapping
    InvalidInputMapping = 0x0024,
    ///  Invalid Output Mapping
    InvalidOutputMapping = 0x0025,
    ///  Inconsistent Settings
    InconsistentSettings = 0x0026,
    ///  FreeRun not supported
    FreeRunNotSupported = 0x0027,
    ///  SyncMode not supported
    SyncModeNotSupported = 0x0028,
    ///  FreeRun needs 3Buffer Mode
    FreeRunNeedsBuffer = 0x0029,
    ///  Background Watchdog
    BackgroundWatchdog = 0x002A,
    ///  No Valid Inputs and Outputs
    NoValidIO = 0x002B,
    ///  Fatal Sync Error
    FatalSync = 0x002C,
    ///  No Sync Error
    NoSync = 0x002D,
    ///  Invalid DC SYNC Configuration
    InvalidDcConfig = 0x0030,
    ///  Invalid DC Latch Configuration
    InvalidLatchConfig = 0x0031,
    ///  Phase Link Lock Error
    PLL = 0x0032,
    ///  Distributed Clock Sync IO Error
    DCSyncIO = 0x0033,
    ///  Distributed Clock Sync Timeout Error
    DCSyncTimeout = 0x0034,
    ///  Distributed Clock Invalid Sync Cycle Time
    DCInvalidPeriod = 0x0035,
    ///  MBX_COE
    MailboxCOE = 0x0043,
    ///  EEPROM Error
    Eeprom = 0x0051,
    ///  Slave restarted locally
    SlaveRestarted = 0x0060,
}

/**
    raw AL status code as reported by a slave, kept raw because vendors are free to use codes above `0x8000`

    It is only meant for diagnostics, its [Display](fmt::Display) names the standard codes.
*/
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AlStatusCode(pub u16);

impl AlStatusCode {
    pub const NONE: Self = Self(0);

    /// the standard error this code stands for, if any
    pub fn error(self) -> Option<AlError> {
        AlError::try_from(self.0).ok()
    }
}
impl fmt::Display for AlStatusCode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.error() {
            Some(error) => write!(f, "0x{:04x} ({:?})", self.0, error),
            None if self.0 >= 0x8000 => write!(f, "0x{:04x} (vendor specific)", self.0),
            None => write!(f, "0x{:04x}", self.0),
        }
	}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes() {
        for state in [AlState::Init, AlState::PreOperational, AlState::Bootstrap, AlState::SafeOperational, AlState::Operational] {
            assert_eq!(AlState::from_code(state.code()), Some(state));
        }
        assert_eq!(AlState::from_code(0), None);
        assert_eq!(AlState::from_code(0x12), None);
        assert_eq!(AlState::Operational.code(), 8);
    }

    #[test]
    fn status_code_display() {
        assert_eq!(AlStatusCode(0x001b).to_string(), "0x001b (SyncWatchdog)");
        assert_eq!(AlStatusCode(0x8001).to_string(), "0x8001 (vendor specific)");
        assert_eq!(AlStatusCode(0x0042).to_string(), "0x0042");
    }
}
