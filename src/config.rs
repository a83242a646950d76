/*!
    configuration of a drive bring-up and its cyclic exchange

    Every value has a default matching a Synapticon-like drive on a 1 kHz loop, so an empty TOML file is a valid configuration. Durations are written in microseconds in TOML.

    ```toml
    slave = 1
    realtime = true

    [parameters]
    rated_current = 3000
    max_torque = 1000

    [mapping]
    rx = [0x60400010, 0x60600008, 0x60710010, 0x607a0020]

    [timing]
    cycle_period_us = 1000
    ```
*/

use crate::sdo::{self, PdoEntry, PdoMapping, MAX_PDO_ENTRIES};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};


/// error of configuration loading
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// configuration file cannot be read
    #[error("cannot read configuration file {path}: {reason}")]
    Read {path: String, reason: String},
    /// TOML syntax or type error
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// values are consistent with the format but not usable
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// complete configuration of a [crate::DriveMaster]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// position of the drive on the segment, starting from 1
    pub slave: u16,
    /// promote the cyclic thread to realtime scheduling, see [crate::realtime]
    pub realtime: bool,
    /// minimum number of bits the mapped process image must provide in each direction
    pub min_process_bits: usize,
    pub parameters: DriveParameters,
    pub mapping: MappingConfig,
    pub timing: Timing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slave: 1,
            realtime: false,
            min_process_bits: 13,
            parameters: DriveParameters::default(),
            mapping: MappingConfig::default(),
            timing: Timing::default(),
        }
    }
}

impl Config {
    /// parse and validate a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
    /// read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
                })?;
        Self::from_toml_str(&text)
    }

    /// check values that deserialization cannot reject
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slave == 0 {
            return Err(ConfigError::Validation("slave index starts from 1".into()));
        }
        if self.min_process_bits == 0 {
            return Err(ConfigError::Validation("min_process_bits cannot be 0".into()));
        }
        for (name, list) in [("mapping.rx", &self.mapping.rx), ("mapping.tx", &self.mapping.tx)] {
            if list.is_empty() || list.len() > MAX_PDO_ENTRIES {
                return Err(ConfigError::Validation(format!(
                    "{} must have between 1 and {} entries, got {}",
                    name, MAX_PDO_ENTRIES, list.len())));
            }
            if let Some(entry) = list.iter().find(|entry| entry.bits() == 0) {
                return Err(ConfigError::Validation(format!("{} entry {:?} has no length", name, entry)));
            }
        }
        let timing = &self.timing;
        for (name, value) in [
                ("timing.state_attempts", timing.state_attempts),
                ("timing.state_polls", timing.state_polls),
                ("timing.enable_attempts", timing.enable_attempts),
                ("timing.master_ready_polls", timing.master_ready_polls),
                ("timing.state_check_period", timing.state_check_period),
                ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} cannot be 0", name)));
            }
        }
        Ok(())
    }

    /// receive PDO mapping to negotiate
    pub fn rx_mapping(&self) -> PdoMapping {
        self.mapping.rx.iter().copied().take(MAX_PDO_ENTRIES).collect()
    }
    /// transmit PDO mapping to negotiate
    pub fn tx_mapping(&self) -> PdoMapping {
        self.mapping.tx.iter().copied().take(MAX_PDO_ENTRIES).collect()
    }
}

/// drive parameters written in PRE-OP, each is optional from the drive's point of view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriveParameters {
    /// motor rated current in mA, object `0x6075`
    pub rated_current: u32,
    /// torque limit in thousandths of the rated torque, object `0x6072`
    pub max_torque: u16,
    /// torque slope in thousandths of the rated torque per second, object `0x6087`
    pub torque_slope: u32,
    /// interpolation period mantissa, object `0x60c2:1`
    pub interpolation_period: u8,
    /// interpolation period power of ten exponent, object `0x60c2:2`
    pub interpolation_index: i8,
    /// encoder increments, object `0x608f:1`
    pub encoder_increments: u32,
    /// motor revolutions, object `0x608f:2`
    pub gear_ratio: u32,
}

impl Default for DriveParameters {
    fn default() -> Self {
        Self {
            rated_current: 3000,
            max_torque: 1000,
            torque_slope: 10000,
            interpolation_period: 1,
            interpolation_index: -3,
            encoder_increments: 4096,
            gear_ratio: 1,
        }
    }
}

/// PDO mappings requested to the drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingConfig {
    /// skip negotiation and keep the drive's current mapping
    pub keep_defaults: bool,
    /// receive PDO mapping object and its assignment object
    pub rx_index: u16,
    pub rx_assign: u16,
    /// transmit PDO mapping object and its assignment object
    pub tx_index: u16,
    pub tx_assign: u16,
    /// entries of the receive PDO, master to drive
    pub rx: Vec<PdoEntry>,
    /// entries of the transmit PDO, drive to master
    pub tx: Vec<PdoEntry>,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            keep_defaults: false,
            rx_index: sdo::objects::RX_PDO.index,
            rx_assign: sdo::objects::RX_PDO.assign,
            tx_index: sdo::objects::TX_PDO.index,
            tx_assign: sdo::objects::TX_PDO.assign,
            rx: sdo::objects::rx_mapping().to_vec(),
            tx: sdo::objects::tx_mapping().to_vec(),
        }
    }
}

impl MappingConfig {
    pub fn rx_pdo(&self) -> sdo::ConfigurablePdo {
        sdo::ConfigurablePdo {index: self.rx_index, assign: self.rx_assign}
    }
    pub fn tx_pdo(&self) -> sdo::ConfigurablePdo {
        sdo::ConfigurablePdo {index: self.tx_index, assign: self.tx_assign}
    }
}

/// every delay and attempt bound of the bring-up and cyclic exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timing {
    /// attempts of a slave state change before giving up
    pub state_attempts: u32,
    /// delay between a state request and its first poll
    #[serde(rename = "state_settle_us", with = "micros")]
    pub state_settle: Duration,
    /// delay between state requests during SAFE-OP escalation
    #[serde(rename = "escalation_settle_us", with = "micros")]
    pub escalation_settle: Duration,
    /// delay between two failed attempts
    #[serde(rename = "state_retry_us", with = "micros")]
    pub state_retry: Duration,
    /// polls of the slave state per attempt, doubled during escalation
    pub state_polls: u32,
    #[serde(rename = "state_poll_interval_us", with = "micros")]
    pub state_poll_interval: Duration,

    /// delay after writing drive parameters, before reading the mode back
    #[serde(rename = "parameter_settle_us", with = "micros")]
    pub parameter_settle: Duration,
    /// delay after each step of a PDO mapping negotiation
    #[serde(rename = "mapping_step_delay_us", with = "micros")]
    pub mapping_step_delay: Duration,
    /// delay after writing each PDO mapping entry
    #[serde(rename = "mapping_entry_delay_us", with = "micros")]
    pub mapping_entry_delay: Duration,

    /// pause after the first exchange of the watchdog burst
    #[serde(rename = "watchdog_pause_us", with = "micros")]
    pub watchdog_pause: Duration,
    /// exchanges following the pause, to feed the drive's watchdog before requesting OPERATIONAL
    pub watchdog_cycles: u32,
    #[serde(rename = "watchdog_interval_us", with = "micros")]
    pub watchdog_interval: Duration,

    /// attempts to reach operation enabled
    pub enable_attempts: u32,
    #[serde(rename = "enable_interval_us", with = "micros")]
    pub enable_interval: Duration,

    /// polls of the master ready flag before the cyclic thread gives up
    pub master_ready_polls: u32,
    #[serde(rename = "master_ready_interval_us", with = "micros")]
    pub master_ready_interval: Duration,

    /// period of the cyclic exchange
    #[serde(rename = "cycle_period_us", with = "micros")]
    pub cycle_period: Duration,
    /// number of cycles between two checks of the slave state
    pub state_check_period: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            state_attempts: 5,
            state_settle: Duration::from_millis(20),
            escalation_settle: Duration::from_millis(200),
            state_retry: Duration::from_millis(50),
            state_polls: 200,
            state_poll_interval: Duration::from_millis(10),

            parameter_settle: Duration::from_millis(100),
            mapping_step_delay: Duration::from_millis(50),
            mapping_entry_delay: Duration::from_millis(20),

            watchdog_pause: Duration::from_millis(10),
            watchdog_cycles: 10,
            watchdog_interval: Duration::from_millis(1),

            enable_attempts: 50,
            enable_interval: Duration::from_millis(5),

            master_ready_polls: 500,
            master_ready_interval: Duration::from_millis(10),

            cycle_period: Duration::from_millis(1),
            state_check_period: 100,
        }
    }
}

impl Timing {
    /// no delay at all and small polling bounds, for simulated transports
    pub fn immediate() -> Self {
        Self {
            state_settle: Duration::ZERO,
            escalation_settle: Duration::ZERO,
            state_retry: Duration::ZERO,
            state_polls: 2,
            state_poll_interval: Duration::ZERO,
            parameter_settle: Duration::ZERO,
            mapping_step_delay: Duration::ZERO,
            mapping_entry_delay: Duration::ZERO,
            watchdog_pause: Duration::ZERO,
            watchdog_interval: Duration::ZERO,
            enable_interval: Duration::ZERO,
            master_ready_interval: Duration::ZERO,
            cycle_period: Duration::from_micros(100),
            .. Self::default()
        }
    }
}

/// durations as an integer number of microseconds
mod micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.slave, 1);
        assert_eq!(config.min_process_bits, 13);
        assert_eq!(config.timing.state_attempts, 5);
        assert_eq!(config.timing.enable_attempts, 50);
        assert_eq!(config.parameters.interpolation_index, -3);
    }

    #[test]
    fn partial_sections() {
        let config = Config::from_toml_str(r#"
            slave = 2
            [parameters]
            max_torque = 500
            [mapping]
            tx = [0x60410010, 0x60640020]
            [timing]
            cycle_period_us = 2000
            "#).unwrap();
        assert_eq!(config.slave, 2);
        assert_eq!(config.parameters.max_torque, 500);
        assert_eq!(config.parameters.rated_current, 3000);
        assert_eq!(config.mapping.tx, vec![PdoEntry(0x6041_0010), PdoEntry(0x6064_0020)]);
        assert_eq!(config.mapping.rx, sdo::objects::rx_mapping().to_vec());
        assert_eq!(config.timing.cycle_period, Duration::from_millis(2));
        assert_eq!(config.timing.state_settle, Duration::from_millis(20));
    }

    #[test]
    fn invalid_values() {
        assert!(matches!(Config::from_toml_str("slave = 0"), Err(ConfigError::Validation(_))));
        assert!(matches!(Config::from_toml_str("[mapping]\nrx = []"), Err(ConfigError::Validation(_))));
        assert!(matches!(
            Config::from_toml_str("[mapping]\nrx = [1, 2, 3, 4, 5, 6, 7, 8, 9]"),
            Err(ConfigError::Validation(_))));
        assert!(matches!(Config::from_toml_str("[timing]\nstate_attempts = 0"), Err(ConfigError::Validation(_))));
        assert!(matches!(Config::from_toml_str("slave = \"one\""), Err(ConfigError::Parse(_))));
        assert!(matches!(Config::from_toml_str("unknown = 1"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file() {
        let error = Config::load(Path::new("/nonexistent/etherdrive.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Read {..}));
    }
}
