/*!
    Negotiation of a drive's PDO mapping through SDO transactions.

    A PDO mapping object (`0x1600` for the first receive PDO) lists the objects packed in that PDO, and a sync manager assignment object (`0x1c12` for outputs) lists the PDOs exchanged in the process image. CiA 301 only allows rewriting a mapping while it is disabled (its subindex 0 is null), and many drives additionally refuse it while the PDO is assigned. Hence a rewrite goes:

    1. disable the assignment (`assign:0 = 0`)
    2. disable the mapping (`map:0 = 0`)
    3. write the entries (`map:1 ..= map:N`)
    4. enable the mapping (`map:0 = N`)
    5. restore the assignment
    6. read back `map:0`

    The slave must be in PRE-OP. When the drive already holds the requested mapping, nothing is written.

    ## Example

    ```ignore
    let rx = mapping::negotiate(transport, 1, objects::RX_PDO, &objects::rx_mapping(), None, &timing)?;
    log::info!("rx mapping {:?}", mapping::describe(transport, 1, objects::RX_PDO.index)?);
    ```
*/

use crate::{
    sdo::{Sdo, PdoEntry, PdoMapping, ConfigurablePdo, MAX_PDO_ENTRIES, mapping_bits},
    transport::Transport,
    config::Timing,
    error::{MappingError, MappingStep, TransportError},
    };
use std::thread::sleep;


/// outcome of a successful [negotiate]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Negotiation {
    /// the mapping has been rewritten and verified
    Applied,
    /// the drive already had the requested mapping, nothing was written
    Unchanged,
}

const fn count(index: u16) -> Sdo<u8> {Sdo::complete(index)}
const fn entry(index: u16, slot: u8) -> Sdo<PdoEntry> {Sdo::sub(index, slot + 1)}

/**
    set the given PDO mapping on a slave, unless it already has it

    `capacity` is the number of bits available for this PDO in the process image, when the caller knows it. A `target` exceeding it is rejected before any SDO transaction.

    A failure after the first write leaves the mapping or its assignment disabled, the slave will then refuse to go to SAFE-OP with this PDO until it is reconfigured or power cycled.
*/
pub fn negotiate(
        transport: &mut dyn Transport,
        slave: u16,
        pdo: ConfigurablePdo,
        target: &[PdoEntry],
        capacity: Option<usize>,
        timing: &Timing,
        ) -> Result<Negotiation, MappingError>
{
    let map = pdo.index;
    let bits = mapping_bits(target);
    if target.len() > MAX_PDO_ENTRIES
        {return Err(MappingError::TooLarge {map, bits, capacity: capacity.unwrap_or(bits)})}
    if let Some(capacity) = capacity {
        if bits > capacity
            {return Err(MappingError::TooLarge {map, bits, capacity})}
    }
    let len = target.len() as u8;

    // skip if the slave already has the requested mapping
    match count(map).read(transport, slave) {
        Ok(current) if current == len => {
            let mut matching = true;
            for (i, &expected) in target.iter().enumerate() {
                match entry(map, i as u8).read(transport, slave) {
                    Ok(found) if found == expected => {},
                    Ok(found) => {
                        log::debug!("slave {} mapping {:#06x}:{} is {:?} instead of {:?}", slave, map, i+1, found, expected);
                        matching = false;
                        break;
                    },
                    Err(err) => {
                        log::debug!("slave {} mapping {:#06x}:{} unreadable: {}", slave, map, i+1, err);
                        matching = false;
                        break;
                    },
                }
            }
            if matching {
                log::debug!("slave {} mapping {:#06x} already set", slave, map);
                return Ok(Negotiation::Unchanged);
            }
        },
        Ok(current) => log::debug!("slave {} mapping {:#06x} has {} entries, {} requested", slave, map, current, len),
        Err(err) => log::debug!("slave {} mapping {:#06x} count unreadable: {}", slave, map, err),
    }

    let step = |step| move |source: TransportError| MappingError::Step {map, step, source};

    // the assignment is restored as it was, a null or unreadable one is assumed to contain only this PDO
    let assignment = match count(pdo.assign).read(transport, slave) {
        Ok(0) | Err(_) => 1,
        Ok(assignment) => assignment,
        };
    log::debug!("slave {} rewriting mapping {:#06x} with {} entries", slave, map, len);

    count(pdo.assign).write(transport, slave, 0)
        .map_err(step(MappingStep::DisableAssignment))?;
    sleep(timing.mapping_step_delay);

    count(map).write(transport, slave, 0)
        .map_err(step(MappingStep::DisableMapping))?;
    sleep(timing.mapping_step_delay);

    for (i, &value) in target.iter().enumerate() {
        log::trace!("slave {} mapping {:#06x}:{} = {:?}", slave, map, i+1, value);
        entry(map, i as u8).write(transport, slave, value)
            .map_err(step(MappingStep::WriteEntry(i as u8 + 1)))?;
        sleep(timing.mapping_entry_delay);
    }

    count(map).write(transport, slave, len)
        .map_err(step(MappingStep::EnableMapping))?;
    sleep(timing.mapping_step_delay);

    count(pdo.assign).write(transport, slave, assignment)
        .map_err(step(MappingStep::RestoreAssignment))?;
    sleep(timing.mapping_step_delay);

    let found = count(map).read(transport, slave)
        .map_err(step(MappingStep::Verify))?;
    if found != len
        {return Err(MappingError::Verification {map, expected: len, found})}

    Ok(Negotiation::Applied)
}

/// read back the current entries of a PDO mapping object
pub fn describe(transport: &mut dyn Transport, slave: u16, map: u16) -> Result<PdoMapping, MappingError> {
    let len = count(map).read(transport, slave)
        .map_err(|source| MappingError::Step {map, step: MappingStep::ReadCurrent, source})?;
    let mut entries = PdoMapping::new();
    for i in 0 .. len.min(MAX_PDO_ENTRIES as u8) {
        let value = entry(map, i).read(transport, slave)
            .map_err(|source| MappingError::Step {map, step: MappingStep::ReadCurrent, source})?;
        // cannot overflow since the loop is bounded by the capacity
        let _ = entries.push(value);
    }
    Ok(entries)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sdo::objects,
        registers::AlState,
        simulation::SimulatedDrive,
        };

    fn timing() -> Timing {Timing::immediate()}

    fn preop(drive: &mut SimulatedDrive) {
        drive.init("sim").unwrap();
        drive.discover_slaves().unwrap();
        drive.set_slave_state(1, AlState::PreOperational).unwrap();
    }

    #[test]
    fn too_large_rejected_before_any_transaction() {
        let mut drive = SimulatedDrive::new(1);
        let result = negotiate(&mut drive, 1, objects::RX_PDO, &objects::rx_mapping(), Some(64), &timing());
        assert!(matches!(result, Err(MappingError::TooLarge {bits: 72, capacity: 64, ..})));
        assert!(drive.sdo_log().is_empty());
    }

    #[test]
    fn rewrite_follows_step_order() {
        let mut drive = SimulatedDrive::new(1);
        preop(&mut drive);
        drive.set_mapping(1, objects::RX_PDO.index, &[PdoEntry(0x6040_0010)]);
        drive.clear_logs();

        let target = objects::rx_mapping();
        assert!(matches!(negotiate(&mut drive, 1, objects::RX_PDO, &target, None, &timing()), Ok(Negotiation::Applied)));

        let writes = drive.sdo_writes();
        assert_eq!(writes.first().map(|w| (w.index, w.sub, w.data.clone())), Some((0x1c12, 0, vec![0])));
        assert_eq!(writes.get(1).map(|w| (w.index, w.sub, w.data.clone())), Some((0x1600, 0, vec![0])));
        assert_eq!(writes.iter().filter(|w| w.index == 0x1600 && w.sub > 0).count(), 4);
        assert_eq!(writes.iter().rev().nth(1).map(|w| (w.index, w.sub, w.data.clone())), Some((0x1600, 0, vec![4])));
        assert_eq!(writes.last().map(|w| (w.index, w.sub, w.data.clone())), Some((0x1c12, 0, vec![1])));
        assert_eq!(describe(&mut drive, 1, 0x1600).unwrap(), target);
    }

    #[test]
    fn failed_step_is_named() {
        let mut drive = SimulatedDrive::new(1);
        preop(&mut drive);
        drive.set_mapping(1, objects::TX_PDO.index, &[]);
        drive.fail_sdo_write(objects::TX_PDO.index, 3);
        let result = negotiate(&mut drive, 1, objects::TX_PDO, &objects::tx_mapping(), None, &timing());
        assert!(matches!(result, Err(MappingError::Step {map: 0x1a00, step: MappingStep::WriteEntry(3), ..})));
    }
}
