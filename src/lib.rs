/*!
    Bring-up and cyclic torque control of a CiA 402 servodrive over an EtherCAT-like fieldbus.

    The fieldbus itself is reached through the [Transport] trait, this crate handles what comes above it:

    - the CiA 402 state machine of the drive ([cia402])
    - the PDO mapping negotiation over SDO ([mapping])
    - the fieldbus state changes with retries ([slave])
    - the bring-up pipeline ([bringup])
    - the realtime cyclic exchange thread ([cyclic]) and the values it shares with the control thread ([register])

    [DriveMaster] puts all of this together.
*/

pub mod data;
pub mod registers;
pub mod cia402;
pub mod sdo;
pub mod error;
pub mod transport;
pub mod image;
pub mod config;
pub mod mapping;
pub mod slave;
pub mod register;
pub mod bringup;
pub mod cyclic;
pub mod realtime;
pub mod master;
pub mod simulation;

pub use crate::data::{PduData, Field};
pub use crate::cia402::{Cia402State, ControlwordCommand, StatusWord, ControlWord};
pub use crate::registers::AlState;
pub use crate::error::*;
pub use crate::transport::Transport;
pub use crate::config::Config;
pub use crate::register::Telemetry;
pub use crate::master::DriveMaster;
