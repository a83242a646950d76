/*!
    error types of the bring-up and cyclic exchange

    Each variant is meant to help finding the cause responsible for the problem and how to deal with it:

    - [TransportError] comes from the fieldbus transport itself
    - [ConfigurationError] means the drive or the process image cannot be used as configured
    - [MappingError] reports which step of a PDO mapping negotiation failed
    - [StateTransitionError] means a slave refused a fieldbus state change
    - [BringupTimeoutError] means the drive never reached operation enabled

    [BringupError] gathers them for [crate::DriveMaster::bring_up]
*/

use std::sync::Arc;
use crate::{
    registers::{AlState, AlStatusCode},
    cia402::Cia402State,
    data::PackingError,
    };


/**
    general object reporting an unexpected result of the transport

    The variants are the same as the ones of an ethercat master, since the transport usually is one.
*/
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    /// error caused by communication support, these errors are exterior to this library
    #[error("io: {0}")]
    Io(Arc<std::io::Error>),

    /// SDO transaction refused by a slave, `abort` is the CoE abort code when the transport knows it
    #[error("sdo {index:#06x}:{sub} on slave {slave} failed (abort code {abort:#010x})")]
    Sdo {slave: u16, index: u16, sub: u8, abort: u32},

    /// error reported by a slave out of any SDO transaction
    #[error("slave {0} reported an error")]
    Slave(u16),

    /// error reported by the master, generally fixed by using the master differently
    #[error("master: {0}")]
    Master(&'static str),

    /// error detected in the communication, the whole communication generally has to be restarted
    #[error("protocol: {0}")]
    Protocol(&'static str),

    /// too much time elapsed, the operation can be retried
    #[error("timeout: {0}")]
    Timeout(&'static str),
}

/// convenient alias to simplify return annotations
pub type TransportResult<T=()> = core::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(src: std::io::Error) -> Self {
        TransportError::Io(Arc::new(src))
    }
}
impl From<PackingError> for TransportError {
    fn from(src: PackingError) -> Self {
        TransportError::Protocol(match src {
            PackingError::BadSize(_, text) => text,
            PackingError::InvalidValue(text) => text,
        })
    }
}


/// direction of process data, from the master point of view
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// master to slave, RxPDO on the slave side
    Output,
    /// slave to master, TxPDO on the slave side
    Input,
}

/// the drive or the process image is not usable as configured
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("no slave found on the segment")]
    NoSlaves,
    #[error("slave {slave} is not on the segment ({count} slaves found)")]
    MissingSlave {slave: u16, count: u16},
    #[error("{direction:?} process image of slave {slave} is {available} bytes, {required} required")]
    UndersizedImage {slave: u16, direction: Direction, required: usize, available: usize},
    /// `state` is `None` when the slave did not answer
    #[error("slave {slave} is in state {} instead of OPERATIONAL",
        .state.map_or(String::from("unknown"), |s| s.to_string()))]
    NotOperational {slave: u16, state: Option<AlState>},
}

/// step of a PDO mapping negotiation, see [crate::mapping::negotiate]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MappingStep {
    ReadCurrent,
    DisableAssignment,
    DisableMapping,
    /// writing the entry at this subindex
    WriteEntry(u8),
    EnableMapping,
    RestoreAssignment,
    Verify,
}

/// PDO mapping negotiation failure, the mapping is left disabled
#[derive(Clone, Debug, thiserror::Error)]
pub enum MappingError {
    #[error("pdo mapping {map:#06x}: step {step:?} failed: {source}")]
    Step {map: u16, step: MappingStep, #[source] source: TransportError},
    #[error("pdo mapping {map:#06x}: {found} entries read back, {expected} written")]
    Verification {map: u16, expected: u8, found: u8},
    #[error("pdo mapping {map:#06x}: {bits} bits exceeds the capacity of {capacity} bits")]
    TooLarge {map: u16, bits: usize, capacity: usize},
}

/// a slave failed to reach a fieldbus state after all retries and escalation
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("slave {slave} failed to reach {target} after {attempts} attempts, stuck in {} with AL status {al_status}",
    .observed.map_or(String::from("unknown state"), |s| s.to_string()))]
pub struct StateTransitionError {
    pub slave: u16,
    pub target: AlState,
    /// last state observed, `None` if the slave never answered
    pub observed: Option<AlState>,
    pub al_status: AlStatusCode,
    pub attempts: u32,
}

/// the CiA 402 state machine did not reach operation enabled in time
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("drive {slave} still in {last_state} (statusword {statusword:#06x}) after {attempts} attempts")]
pub struct BringupTimeoutError {
    pub slave: u16,
    pub attempts: u32,
    pub last_state: Cia402State,
    pub statusword: u16,
}

/// fatal error of [crate::DriveMaster::bring_up], no cyclic exchange runs after it
#[derive(Clone, Debug, thiserror::Error)]
pub enum BringupError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),
    #[error(transparent)]
    Timeout(#[from] BringupTimeoutError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("cannot start cyclic thread: {0}")]
    Thread(Arc<std::io::Error>),
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_transport_errors() {
        let io = TransportError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "no such interface"));
        assert_eq!(io.to_string(), "io: no such interface");
        let sdo = TransportError::Sdo {slave: 1, index: 0x1c12, sub: 0, abort: 0x0601_0002};
        assert_eq!(sdo.to_string(), "sdo 0x1c12:0 on slave 1 failed (abort code 0x06010002)");
    }

    #[test]
    fn display_state_transition() {
        let error = StateTransitionError {
            slave: 1,
            target: AlState::Operational,
            observed: Some(AlState::PreOperational),
            al_status: AlStatusCode(0x001d),
            attempts: 5,
            };
        assert_eq!(error.to_string(),
            "slave 1 failed to reach OPERATIONAL after 5 attempts, stuck in PRE_OP with AL status 0x001d (InvalidOutputConfig)");
    }
}
