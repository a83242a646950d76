/*!
    This module provides the trait [Transport], the only way this crate talks to the fieldbus.

    A transport is typically an ethercat master: it owns the network interface, discovers slaves, builds frames, maps the process image and runs SDO transactions. This crate only drives it through the operations below, so any master implementation can be plugged in. [crate::simulation::SimulatedDrive] implements it without any hardware.

    Slaves are numbered from `1` in topological order, as most masters do.
*/

use crate::{
    registers::{AlState, AlStatusCode},
    error::TransportResult,
    };


/// fieldbus state of one slave, as read back from the slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlaveStatus {
    /// current state, `None` when the slave reports an undefined or mixed state
    pub state: Option<AlState>,
    /// last AL status code, only meaningful for diagnostics
    pub al_status: AlStatusCode,
}

/// process image size of one slave after mapping
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SlaveImage {
    /// bytes written by the master (RxPDO)
    pub output_bytes: usize,
    /// bytes read by the master (TxPDO)
    pub input_bytes: usize,
}

/// result of mapping slaves process data to the process image
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageMap {
    /// image of each slave, index `0` is slave `1`
    pub slaves: Vec<SlaveImage>,
    /// number of datagrams incrementing the working counter when writing outputs
    pub outputs_wkc: u16,
    /// number of datagrams incrementing the working counter when reading inputs
    pub inputs_wkc: u16,
}

impl ImageMap {
    /// image of the given slave
    pub fn slave(&self, slave: u16) -> Option<&SlaveImage> {
        usize::from(slave).checked_sub(1)
            .and_then(|index| self.slaves.get(index))
    }
    /// working counter of a cycle where every slave processed its data
    ///
    /// outputs are counted twice since a read-write datagram increments the counter by 2 for each slave writing
    pub fn expected_wkc(&self) -> u16 {
        self.outputs_wkc.saturating_mul(2).saturating_add(self.inputs_wkc)
    }
}

/**
    operations needed from the fieldbus master

    Implementors are responsible for frame encoding, retries at the datagram level, and the memory of the process image. Every method is blocking, and none is called concurrently: during bring-up the transport is used by one thread, then it is moved to the cyclic exchange thread.
*/
pub trait Transport: Send {
    /// open the given network interface
    fn init(&mut self, interface: &str) -> TransportResult;
    /// enumerate the slaves on the segment, returns their number
    fn discover_slaves(&mut self) -> TransportResult<u16>;
    /// configure distributed clocks on the slaves supporting it
    fn configure_distributed_clocks(&mut self) -> TransportResult;
    /// map all slaves process data in the process image, according to their current PDO assignment
    fn map_process_image(&mut self) -> TransportResult<ImageMap>;

    /// send a state change request to the slave, does not wait for the change
    fn set_slave_state(&mut self, slave: u16, target: AlState) -> TransportResult;
    /// read the current state of the slave
    fn slave_state(&mut self, slave: u16) -> TransportResult<SlaveStatus>;
    /// forget the last AL status code of the slave, so the next refusal is not confused with an older one
    fn clear_al_status(&mut self, slave: u16);

    /// send the outputs and receive the inputs of the whole process image once, returns the working counter
    fn exchange_process_data(&mut self) -> TransportResult<u16>;

    /// read an SDO into the given buffer, returns the number of bytes received
    fn sdo_read(&mut self, slave: u16, index: u16, sub: u8, data: &mut [u8]) -> TransportResult<usize>;
    /// write an SDO with the given bytes
    fn sdo_write(&mut self, slave: u16, index: u16, sub: u8, data: &[u8]) -> TransportResult;

    /// output bytes of the slave in the process image, empty before mapping
    fn outputs(&mut self, slave: u16) -> &mut [u8];
    /// input bytes of the slave in the process image, as received by the last exchange, empty before mapping
    fn inputs(&self, slave: u16) -> &[u8];

    /// release the network interface, the transport cannot be used afterward
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn init(&mut self, interface: &str) -> TransportResult {(**self).init(interface)}
    fn discover_slaves(&mut self) -> TransportResult<u16> {(**self).discover_slaves()}
    fn configure_distributed_clocks(&mut self) -> TransportResult {(**self).configure_distributed_clocks()}
    fn map_process_image(&mut self) -> TransportResult<ImageMap> {(**self).map_process_image()}
    fn set_slave_state(&mut self, slave: u16, target: AlState) -> TransportResult {(**self).set_slave_state(slave, target)}
    fn slave_state(&mut self, slave: u16) -> TransportResult<SlaveStatus> {(**self).slave_state(slave)}
    fn clear_al_status(&mut self, slave: u16) {(**self).clear_al_status(slave)}
    fn exchange_process_data(&mut self) -> TransportResult<u16> {(**self).exchange_process_data()}
    fn sdo_read(&mut self, slave: u16, index: u16, sub: u8, data: &mut [u8]) -> TransportResult<usize> {(**self).sdo_read(slave, index, sub, data)}
    fn sdo_write(&mut self, slave: u16, index: u16, sub: u8, data: &[u8]) -> TransportResult {(**self).sdo_write(slave, index, sub, data)}
    fn outputs(&mut self, slave: u16) -> &mut [u8] {(**self).outputs(slave)}
    fn inputs(&self, slave: u16) -> &[u8] {(**self).inputs(slave)}
    fn close(&mut self) {(**self).close()}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_working_counter() {
        let map = ImageMap {
            slaves: vec![SlaveImage {output_bytes: 9, input_bytes: 9}],
            outputs_wkc: 1,
            inputs_wkc: 1,
            };
        assert_eq!(map.expected_wkc(), 3);
        assert_eq!(map.slave(1), Some(&SlaveImage {output_bytes: 9, input_bytes: 9}));
        assert_eq!(map.slave(0), None);
        assert_eq!(map.slave(2), None);
    }
}
