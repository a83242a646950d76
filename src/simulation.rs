/*!
    In-memory transport emulating CiA 402 drives, to run the bring-up and the cyclic exchange without hardware.

    Each simulated slave has
    - an AL state machine accepting any request, unless told to refuse some
    - an object dictionary with the mapping objects `0x1600`, `0x1a00`, their assignment objects `0x1c12`, `0x1c13`, and the drive parameters. Mapping objects follow the CiA 301 rules: entries are only writable while the mapping and its assignment are disabled, and only in PRE-OP.
    - a process image packed according to its current mappings
    - a CiA 402 state machine reacting to the controlword at each exchange while OPERATIONAL, and applying the target torque once operation is enabled

    Faults can be injected: refused states, SDO failures, missing objects, a degraded working counter, an undersized image.

    A [SimulationProbe] keeps access to the simulation once the drive is moved to the cyclic thread.
*/

use crate::{
    cia402::{Cia402State, ControlwordCommand},
    error::{TransportError, TransportResult},
    registers::{AlState, AlStatusCode},
    sdo::{objects, PdoEntry},
    transport::{ImageMap, SlaveImage, SlaveStatus, Transport},
    };
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    };


/// CoE abort codes returned by the simulated dictionary
mod abort {
    pub const OBJECT_MISSING: u32 = 0x0602_0000;
    pub const SUBINDEX_MISSING: u32 = 0x0609_0011;
    pub const GENERAL: u32 = 0x0800_0000;
    pub const DEVICE_STATE: u32 = 0x0800_0022;
}

/// one SDO transaction seen by the simulation
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SdoRecord {
    pub slave: u16,
    pub index: u16,
    pub sub: u8,
    /// bytes written, or bytes answered to a read
    pub data: Vec<u8>,
    pub write: bool,
}

struct SimSlave {
    al: AlState,
    al_status: AlStatusCode,
    dictionary: BTreeMap<(u16, u8), Vec<u8>>,
    /// states refused with the given code
    refused: BTreeMap<u8, AlStatusCode>,
    /// remaining OPERATIONAL requests ignored while in PRE-OP
    stuck_in_preop: u32,
    image_override: Option<SlaveImage>,

    drive: Cia402State,
    frozen: bool,
    position: i32,
    torque: i16,
    /// controlwords received at each exchange in OPERATIONAL
    controlwords: Vec<u16>,
    /// last target torque received while operation enabled
    applied_torque: i16,
}

impl SimSlave {
    fn new() -> Self {
        let mut dictionary = BTreeMap::new();
        for (pdo, mapping) in [(objects::RX_PDO, objects::rx_mapping()), (objects::TX_PDO, objects::tx_mapping())] {
            dictionary.insert((pdo.assign, 0), vec![1]);
            dictionary.insert((pdo.assign, 1), pdo.index.to_le_bytes().to_vec());
            dictionary.insert((pdo.index, 0), vec![mapping.len() as u8]);
            for sub in 1 ..= 8 {
                let entry = mapping.get(usize::from(sub) - 1).copied().unwrap_or_default();
                dictionary.insert((pdo.index, sub), entry.0.to_le_bytes().to_vec());
            }
        }
        for (index, sub, size) in [
                (0x6060, 0, 1),
                (0x6061, 0, 1),
                (0x6072, 0, 2),
                (0x6075, 0, 4),
                (0x6087, 0, 4),
                (0x608f, 1, 4),
                (0x608f, 2, 4),
                (0x60c2, 1, 1),
                (0x60c2, 2, 1),
                ] {
            dictionary.insert((index, sub), vec![0; size]);
        }
        Self {
            al: AlState::Init,
            al_status: AlStatusCode::NONE,
            dictionary,
            refused: BTreeMap::new(),
            stuck_in_preop: 0,
            image_override: None,
            drive: Cia402State::NotReady,
            frozen: false,
            position: 0,
            torque: 0,
            controlwords: Vec::new(),
            applied_torque: 0,
        }
    }

    fn get_u8(&self, index: u16, sub: u8) -> u8 {
        self.dictionary.get(&(index, sub)).and_then(|data| data.first()).copied().unwrap_or(0)
    }

    /// entries of a mapping object, according to its current count
    fn mapping(&self, index: u16) -> Vec<PdoEntry> {
        (1 ..= self.get_u8(index, 0).min(8))
            .map(|sub| {
                let mut raw = [0; 4];
                if let Some(data) = self.dictionary.get(&(index, sub)) {
                    let len = data.len().min(4);
                    raw[.. len].copy_from_slice(&data[.. len]);
                }
                PdoEntry(u32::from_le_bytes(raw))
            })
            .collect()
    }

    /// entries of the PDOs assigned to a sync manager
    fn assigned(&self, assign: u16) -> Vec<PdoEntry> {
        (1 ..= self.get_u8(assign, 0))
            .filter_map(|sub| self.dictionary.get(&(assign, sub)))
            .flat_map(|data| {
                let index = u16::from_le_bytes([data.first().copied().unwrap_or(0), data.get(1).copied().unwrap_or(0)]);
                self.mapping(index)
            })
            .collect()
    }

    fn image(&self) -> SlaveImage {
        self.image_override.unwrap_or_else(|| {
            let bytes = |entries: Vec<PdoEntry>| (entries.iter().map(|e| usize::from(e.bits())).sum::<usize>() + 7) / 8;
            SlaveImage {
                output_bytes: bytes(self.assigned(objects::RX_PDO.assign)),
                input_bytes: bytes(self.assigned(objects::TX_PDO.assign)),
            }
        })
    }

    fn statusword(&self) -> u16 {
        // remote bit always set, voltage enabled once switched on
        0x0200 | match self.drive {
            Cia402State::NotReady => 0x0000,
            Cia402State::SwitchOnDisabled => 0x0040,
            Cia402State::ReadyToSwitchOn => 0x0021,
            Cia402State::SwitchedOn => 0x0033,
            Cia402State::OperationEnabled => 0x0037,
            Cia402State::QuickStopActive => 0x0017,
            Cia402State::FaultReactionActive => 0x001f,
            Cia402State::Fault => 0x0008,
        }
    }

    /// react to a controlword as a CiA 402 drive does, one transition per exchange
    fn command(&mut self, controlword: u16) {
        use Cia402State::*;
        if self.frozen
            {return}
        let voltage = controlword & 0x0002 != 0;
        let command = controlword & 0x008f;
        self.drive = match self.drive {
            NotReady => SwitchOnDisabled,
            Fault | FaultReactionActive => if controlword & ControlwordCommand::FaultReset.bits() != 0 {SwitchOnDisabled} else {Fault},
            _ if ! voltage => SwitchOnDisabled,
            SwitchOnDisabled | QuickStopActive => if command == 0x0006 {ReadyToSwitchOn} else {self.drive},
            ReadyToSwitchOn => match command {
                0x0007 => SwitchedOn,
                0x000f => OperationEnabled,
                _ => ReadyToSwitchOn,
            },
            SwitchedOn => match command {
                0x000f => OperationEnabled,
                0x0006 => ReadyToSwitchOn,
                _ => SwitchedOn,
            },
            OperationEnabled => match command {
                0x0007 => SwitchedOn,
                0x0006 => ReadyToSwitchOn,
                _ => OperationEnabled,
            },
        };
    }

    fn read_outputs(&mut self, outputs: &[u8]) {
        let mut controlword = None;
        let mut target = None;
        let mut offset = 0;
        for entry in self.assigned(objects::RX_PDO.assign) {
            let len = usize::from(entry.bits()) / 8;
            let field = outputs.get(offset .. offset + len);
            match (entry.index(), field) {
                (0x6040, Some(&[a, b])) => controlword = Some(u16::from_le_bytes([a, b])),
                (0x6071, Some(&[a, b])) => target = Some(i16::from_le_bytes([a, b])),
                _ => {},
            }
            offset += len;
        }
        if let Some(controlword) = controlword {
            self.controlwords.push(controlword);
            self.command(controlword);
        }
        if self.drive == Cia402State::OperationEnabled {
            self.applied_torque = target.unwrap_or(0);
        } else {
            self.applied_torque = 0;
        }
        self.torque = self.applied_torque;
        self.position = self.position.wrapping_add(i32::from(self.torque) / 10);
    }

    fn write_inputs(&self, inputs: &mut [u8]) {
        let mut offset = 0;
        for entry in self.assigned(objects::TX_PDO.assign) {
            let len = usize::from(entry.bits()) / 8;
            let value = match entry.index() {
                0x6041 => self.statusword().to_le_bytes().to_vec(),
                0x6061 => vec![self.get_u8(0x6060, 0)],
                0x6064 => self.position.to_le_bytes().to_vec(),
                0x606c => (i32::from(self.torque) * 100).to_le_bytes().to_vec(),
                0x6077 => self.torque.to_le_bytes().to_vec(),
                _ => vec![0; len],
            };
            if let Some(field) = inputs.get_mut(offset .. offset + len) {
                let copied = len.min(value.len());
                field[.. copied].copy_from_slice(&value[.. copied]);
            }
            offset += len;
        }
    }
}

struct Simulation {
    slaves: Vec<SimSlave>,
    interface: Option<String>,
    discovered: bool,
    mapped: bool,
    closed: bool,
    distributed_clocks: bool,
    exchanges: u64,
    degraded_exchanges: u32,
    failing_writes: Vec<(u16, u8)>,
    sdo_log: Vec<SdoRecord>,
    state_requests: Vec<(u16, AlState)>,
}

impl Simulation {
    fn slave(&mut self, slave: u16) -> TransportResult<&mut SimSlave> {
        if ! self.discovered
            {return Err(TransportError::Master("slaves not discovered"))}
        usize::from(slave).checked_sub(1)
            .and_then(|index| self.slaves.get_mut(index))
            .ok_or(TransportError::Slave(slave))
    }
}

fn lock(simulation: &Mutex<Simulation>) -> MutexGuard<'_, Simulation> {
    simulation.lock().unwrap_or_else(PoisonError::into_inner)
}

/// simulated segment of CiA 402 drives, implementing [Transport]
pub struct SimulatedDrive {
    simulation: Arc<Mutex<Simulation>>,
    outputs: Vec<Vec<u8>>,
    inputs: Vec<Vec<u8>>,
}

impl SimulatedDrive {
    /// segment of the given number of drives, all with the default mapping and powered up in [Cia402State::NotReady]
    pub fn new(slaves: u16) -> Self {
        Self {
            simulation: Arc::new(Mutex::new(Simulation {
                slaves: (0 .. slaves).map(|_| SimSlave::new()).collect(),
                interface: None,
                discovered: false,
                mapped: false,
                closed: false,
                distributed_clocks: true,
                exchanges: 0,
                degraded_exchanges: 0,
                failing_writes: Vec::new(),
                sdo_log: Vec::new(),
                state_requests: Vec::new(),
            })),
            outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn with<R>(&self, slave: u16, edit: impl FnOnce(&mut SimSlave) -> R) -> R {
        let mut simulation = lock(&self.simulation);
        let index = usize::from(slave).checked_sub(1).expect("slaves are numbered from 1");
        edit(&mut simulation.slaves[index])
    }

    /// the drive powers up in [Cia402State::Fault]
    pub fn starting_in_fault(self, slave: u16) -> Self {
        self.with(slave, |s| s.drive = Cia402State::Fault);
        self
    }
    /// the drive ignores every controlword and stays in [Cia402State::NotReady]
    pub fn frozen(self, slave: u16) -> Self {
        self.with(slave, |s| s.frozen = true);
        self
    }
    /// the drive does not support distributed clocks
    pub fn without_distributed_clocks(self) -> Self {
        lock(&self.simulation).distributed_clocks = false;
        self
    }
    /// remove all subitems of an object from the drive's dictionary
    pub fn without_object(self, slave: u16, index: u16) -> Self {
        self.with(slave, |s| s.dictionary.retain(|&(i, _), _| i != index));
        self
    }
    /// force the process image size, whatever the mapping
    pub fn with_image(self, slave: u16, output_bytes: usize, input_bytes: usize) -> Self {
        self.with(slave, |s| s.image_override = Some(SlaveImage {output_bytes, input_bytes}));
        self
    }

    /// set a mapping object's entries directly, bypassing the mapping rules
    pub fn set_mapping(&mut self, slave: u16, index: u16, entries: &[PdoEntry]) {
        self.with(slave, |s| {
            s.dictionary.insert((index, 0), vec![entries.len() as u8]);
            for sub in 1 ..= 8u8 {
                let entry = entries.get(usize::from(sub) - 1).copied().unwrap_or_default();
                s.dictionary.insert((index, sub), entry.0.to_le_bytes().to_vec());
            }
        })
    }
    /// current entries of a mapping object
    pub fn mapping(&self, slave: u16, index: u16) -> Vec<PdoEntry> {
        self.with(slave, |s| s.mapping(index))
    }
    /// refuse every request for the given state, reporting the given AL status code
    pub fn refuse_state(&mut self, slave: u16, state: AlState, code: AlStatusCode) {
        self.with(slave, |s| s.refused.insert(state.code(), code));
    }
    /// ignore the given number of OPERATIONAL requests received in PRE-OP
    pub fn stuck_in_preop(&mut self, slave: u16, requests: u32) {
        self.with(slave, |s| s.stuck_in_preop = requests);
    }
    /// make SDO writes to this subitem fail
    pub fn fail_sdo_write(&mut self, index: u16, sub: u8) {
        lock(&self.simulation).failing_writes.push((index, sub));
    }

    pub fn probe(&self) -> SimulationProbe {
        SimulationProbe {simulation: self.simulation.clone()}
    }
    // shortcuts to the probe
    pub fn degrade_wkc(&mut self, exchanges: u32)  {self.probe().degrade_wkc(exchanges)}
    pub fn fault(&mut self, slave: u16)  {self.probe().fault(slave)}
    pub fn sdo_log(&self) -> Vec<SdoRecord>  {self.probe().sdo_log()}
    pub fn sdo_writes(&self) -> Vec<SdoRecord>  {self.probe().sdo_writes()}
    pub fn state_requests(&self) -> Vec<(u16, AlState)>  {self.probe().state_requests()}
    pub fn controlwords(&self, slave: u16) -> Vec<u16>  {self.probe().controlwords(slave)}
    pub fn clear_logs(&mut self)  {self.probe().clear_logs()}
}

impl Transport for SimulatedDrive {
    fn init(&mut self, interface: &str) -> TransportResult {
        let mut simulation = lock(&self.simulation);
        if simulation.closed
            {return Err(TransportError::Master("transport closed"))}
        simulation.interface = Some(interface.to_owned());
        Ok(())
    }
    fn discover_slaves(&mut self) -> TransportResult<u16> {
        let mut simulation = lock(&self.simulation);
        if simulation.interface.is_none()
            {return Err(TransportError::Master("transport not initialized"))}
        simulation.discovered = true;
        Ok(simulation.slaves.len() as u16)
    }
    fn configure_distributed_clocks(&mut self) -> TransportResult {
        if lock(&self.simulation).distributed_clocks {Ok(())}
        else {Err(TransportError::Master("no slave supporting distributed clocks"))}
    }
    fn map_process_image(&mut self) -> TransportResult<ImageMap> {
        let mut simulation = lock(&self.simulation);
        if ! simulation.discovered
            {return Err(TransportError::Master("slaves not discovered"))}
        let slaves: Vec<SlaveImage> = simulation.slaves.iter().map(SimSlave::image).collect();
        self.outputs = slaves.iter().map(|image| vec![0; image.output_bytes]).collect();
        self.inputs = slaves.iter().map(|image| vec![0; image.input_bytes]).collect();
        simulation.mapped = true;
        let count = slaves.len() as u16;
        Ok(ImageMap {slaves, outputs_wkc: count, inputs_wkc: count})
    }

    fn set_slave_state(&mut self, slave: u16, target: AlState) -> TransportResult {
        let mut simulation = lock(&self.simulation);
        simulation.state_requests.push((slave, target));
        let mapped = simulation.mapped;
        let s = simulation.slave(slave)?;
        if let Some(&code) = s.refused.get(&target.code()) {
            s.al_status = code;
            return Ok(());
        }
        if target == AlState::Operational && s.al == AlState::PreOperational && s.stuck_in_preop > 0 {
            s.stuck_in_preop -= 1;
            s.al_status = AlStatusCode(0x0011);
            return Ok(());
        }
        if matches!(target, AlState::SafeOperational | AlState::Operational) && ! mapped {
            s.al_status = AlStatusCode(0x001d);
            return Ok(());
        }
        if target == AlState::Bootstrap
            {return Err(TransportError::Protocol("bootstrap cannot be requested"))}
        s.al = target;
        Ok(())
    }
    fn slave_state(&mut self, slave: u16) -> TransportResult<SlaveStatus> {
        let mut simulation = lock(&self.simulation);
        let s = simulation.slave(slave)?;
        Ok(SlaveStatus {state: Some(s.al), al_status: s.al_status})
    }
    fn clear_al_status(&mut self, slave: u16) {
        if let Ok(s) = lock(&self.simulation).slave(slave) {
            s.al_status = AlStatusCode::NONE;
        }
    }

    fn exchange_process_data(&mut self) -> TransportResult<u16> {
        let mut simulation = lock(&self.simulation);
        if ! simulation.mapped
            {return Err(TransportError::Master("process image not mapped"))}
        simulation.exchanges += 1;
        let mut wkc: u16 = 0;
        for (index, s) in simulation.slaves.iter_mut().enumerate() {
            match s.al {
                AlState::Operational => {
                    s.read_outputs(&self.outputs[index]);
                    s.write_inputs(&mut self.inputs[index]);
                    wkc += 3;
                },
                AlState::SafeOperational => {
                    s.write_inputs(&mut self.inputs[index]);
                    wkc += 1;
                },
                _ => {},
            }
        }
        if simulation.degraded_exchanges > 0 {
            simulation.degraded_exchanges -= 1;
            wkc = wkc.saturating_sub(1);
        }
        Ok(wkc)
    }

    fn sdo_read(&mut self, slave: u16, index: u16, sub: u8, data: &mut [u8]) -> TransportResult<usize> {
        let mut simulation = lock(&self.simulation);
        let s = simulation.slave(slave)?;
        if s.al == AlState::Init
            {return Err(TransportError::Master("mailbox unavailable in INIT"))}
        let value = match s.dictionary.get(&(index, sub)) {
            // mode display follows the requested mode
            Some(_) if index == 0x6061 => vec![s.get_u8(0x6060, 0)],
            Some(value) => value.clone(),
            None => {
                let abort = if s.dictionary.keys().any(|&(i, _)| i == index) {abort::SUBINDEX_MISSING} else {abort::OBJECT_MISSING};
                return Err(TransportError::Sdo {slave, index, sub, abort});
            },
        };
        let len = value.len().min(data.len());
        data[.. len].copy_from_slice(&value[.. len]);
        simulation.sdo_log.push(SdoRecord {slave, index, sub, data: value, write: false});
        Ok(len)
    }

    fn sdo_write(&mut self, slave: u16, index: u16, sub: u8, data: &[u8]) -> TransportResult {
        let mut simulation = lock(&self.simulation);
        simulation.sdo_log.push(SdoRecord {slave, index, sub, data: data.to_vec(), write: true});
        if simulation.failing_writes.contains(&(index, sub))
            {return Err(TransportError::Sdo {slave, index, sub, abort: abort::GENERAL})}
        let s = simulation.slave(slave)?;
        if s.al == AlState::Init
            {return Err(TransportError::Master("mailbox unavailable in INIT"))}
        if ! s.dictionary.contains_key(&(index, sub))
            {return Err(TransportError::Sdo {slave, index, sub, abort: abort::OBJECT_MISSING})}

        let refused = TransportError::Sdo {slave, index, sub, abort: abort::DEVICE_STATE};
        let assign = match index {
            0x1600 ..= 0x17ff => Some(objects::RX_PDO.assign),
            0x1a00 ..= 0x1bff => Some(objects::TX_PDO.assign),
            _ => None,
        };
        if let Some(assign) = assign {
            // mappings are only editable while disabled and unassigned
            if s.al != AlState::PreOperational || s.get_u8(assign, 0) != 0
                {return Err(refused)}
            if sub != 0 && s.get_u8(index, 0) != 0
                {return Err(refused)}
        }
        if matches!(index, 0x1c12 | 0x1c13) && s.al != AlState::PreOperational
            {return Err(refused)}

        s.dictionary.insert((index, sub), data.to_vec());
        Ok(())
    }

    fn outputs(&mut self, slave: u16) -> &mut [u8] {
        match usize::from(slave).checked_sub(1).and_then(|index| self.outputs.get_mut(index)) {
            Some(outputs) => outputs.as_mut_slice(),
            None => &mut [],
        }
    }
    fn inputs(&self, slave: u16) -> &[u8] {
        match usize::from(slave).checked_sub(1).and_then(|index| self.inputs.get(index)) {
            Some(inputs) => inputs.as_slice(),
            None => &[],
        }
    }

    fn close(&mut self) {
        let mut simulation = lock(&self.simulation);
        simulation.closed = true;
        simulation.mapped = false;
        simulation.interface = None;
    }
}

/// shared access to a [SimulatedDrive], for inspection and fault injection while it is used by another thread
#[derive(Clone)]
pub struct SimulationProbe {
    simulation: Arc<Mutex<Simulation>>,
}

impl SimulationProbe {
    fn with<R>(&self, slave: u16, read: impl FnOnce(&mut SimSlave) -> R) -> R {
        let mut simulation = lock(&self.simulation);
        let index = usize::from(slave).checked_sub(1).expect("slaves are numbered from 1");
        read(&mut simulation.slaves[index])
    }

    /// number of process data exchanges so far
    pub fn exchanges(&self) -> u64  {lock(&self.simulation).exchanges}
    pub fn closed(&self) -> bool  {lock(&self.simulation).closed}
    pub fn al_state(&self, slave: u16) -> AlState  {self.with(slave, |s| s.al)}
    pub fn cia402_state(&self, slave: u16) -> Cia402State  {self.with(slave, |s| s.drive)}
    /// torque applied by the drive at the last exchange
    pub fn applied_torque(&self, slave: u16) -> i16  {self.with(slave, |s| s.applied_torque)}
    /// controlwords received by the drive, one per exchange in OPERATIONAL
    pub fn controlwords(&self, slave: u16) -> Vec<u16>  {self.with(slave, |s| s.controlwords.clone())}
    pub fn sdo_log(&self) -> Vec<SdoRecord>  {lock(&self.simulation).sdo_log.clone()}
    pub fn sdo_writes(&self) -> Vec<SdoRecord> {
        lock(&self.simulation).sdo_log.iter().filter(|record| record.write).cloned().collect()
    }
    pub fn state_requests(&self) -> Vec<(u16, AlState)>  {lock(&self.simulation).state_requests.clone()}
    pub fn clear_logs(&self) {
        let mut simulation = lock(&self.simulation);
        simulation.sdo_log.clear();
        simulation.state_requests.clear();
        for s in simulation.slaves.iter_mut() {
            s.controlwords.clear();
        }
    }

    /// the next exchanges report a working counter one below the nominal one
    pub fn degrade_wkc(&self, exchanges: u32)  {lock(&self.simulation).degraded_exchanges = exchanges}
    /// the drive goes to [Cia402State::Fault]
    pub fn fault(&self, slave: u16)  {self.with(slave, |s| s.drive = Cia402State::Fault)}
    /// the slave falls back to the given state, as after a watchdog expiry
    pub fn drop_to(&self, slave: u16, state: AlState) {
        self.with(slave, |s| {
            s.al = state;
            s.al_status = AlStatusCode(0x001b);
        })
    }
}
