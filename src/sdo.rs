/*!
Convenient structures to read/write the slave's dictionnary objects (SDO) and describe PDO mappings.

# Example

```ignore
// the SDOs are declared first somewhere
let mode = Sdo::<OperationMode>::complete(0x6060);
let interpolation = Sdo::<u8>::sub(0x60c2, 1);

// then read/written during configuration, while the slave is in PRE-OP
mode.write(transport, slave, OperationMode::TorqueProfile)?;
let period = interpolation.read(transport, slave)?;
```
*/

use crate::{
	data::{PduData, Storage, PackingResult},
	cia402::{OperationMode, StatusWord, ControlWord},
	transport::Transport,
	error::TransportResult,
	};
use core::{fmt, marker::PhantomData};


/// description of an SDO's subitem, not a SDO itself
pub struct Sdo<T: PduData> {
	/// index of the item in the slave's dictionnary of objects
	pub index: u16,
	/// subindex in the item
	pub sub: u8,
	extracted: PhantomData<T>,
}
impl<T: PduData> Sdo<T> {
	/// address an sdo subitem
	pub const fn sub(index: u16, sub: u8) -> Self {
		Self{index, sub, extracted: PhantomData}
	}
	/// address a complete sdo at the given index, with `sub=0`
	pub const fn complete(index: u16) -> Self {
		Self::sub(index, 0)
	}

	/// retreive the current subitem value from the given slave
	pub fn read(&self, transport: &mut dyn Transport, slave: u16) -> TransportResult<T> {
		let mut data = T::Packed::zeroed();
		// slaves may answer with less bytes than the nominal size, the remaining bytes stay zero
		transport.sdo_read(slave, self.index, self.sub, data.as_mut())?;
		Ok(T::unpack(data.as_ref())?)
	}
	/// set the subitem value on the given slave
	pub fn write(&self, transport: &mut dyn Transport, slave: u16, value: T) -> TransportResult {
		let data = value.packed()?;
		transport.sdo_write(slave, self.index, self.sub, data.as_ref())
	}
}
impl<T: PduData> fmt::Debug for Sdo<T> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Sdo {{index: {:#x}, sub: {}}}", self.index, self.sub)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a sdo pointing to a type which does not implement this operation
impl<T: PduData> Clone for Sdo<T> {
	fn clone(&self) -> Self {*self}
}
impl<T: PduData> Copy for Sdo<T> {}


/**
	entry of a PDO mapping, packing the mapped object index, subindex and bit length as the 32 bits value written in the mapping object

	| bits | content |
	|------|---------|
	| 31-16 | object index |
	| 15-8 | subindex |
	| 7-0 | bit length |
*/
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(from = "u32", into = "u32")]
pub struct PdoEntry(pub u32);

impl PdoEntry {
	pub const fn new(index: u16, sub: u8, bits: u8) -> Self {
		Self(((index as u32) << 16) | ((sub as u32) << 8) | bits as u32)
	}
	/// entry mapping the given sdo, with its nominal bit size
	pub fn of<T: PduData>(sdo: Sdo<T>) -> Self {
		Self::new(sdo.index, sdo.sub, T::packed_bitsize() as u8)
	}
	pub const fn index(self) -> u16 {(self.0 >> 16) as u16}
	pub const fn sub(self) -> u8 {(self.0 >> 8) as u8}
	pub const fn bits(self) -> u8 {self.0 as u8}
}
impl From<u32> for PdoEntry {
	fn from(raw: u32) -> Self {Self(raw)}
}
impl From<PdoEntry> for u32 {
	fn from(entry: PdoEntry) -> Self {entry.0}
}
impl fmt::Debug for PdoEntry {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:#06x}:{:02x} ({} bits)", self.index(), self.sub(), self.bits())
	}
}
impl PduData for PdoEntry {
	type Packed = [u8; 4];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {self.0.pack(dst)}
	fn unpack(src: &[u8]) -> PackingResult<Self> {u32::unpack(src).map(Self)}
}

/// maximum number of entries in one PDO mapping object supported here
pub const MAX_PDO_ENTRIES: usize = 8;

/// ordered list of entries of a PDO mapping object
pub type PdoMapping = heapless::Vec<PdoEntry, MAX_PDO_ENTRIES>;

/// total bit length of a mapping
pub fn mapping_bits(mapping: &[PdoEntry]) -> usize {
	mapping.iter().map(|entry| usize::from(entry.bits())).sum()
}


/// description of SDO configuring a PDO, assumed to follow the CiA 301 specifications for PDO mapping objects
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConfigurablePdo {
	/// index of the SDO that configures the PDO (`0x1600` or `0x1a00` for the first ones)
	pub index: u16,
	/// index of the sync manager assignment object listing this PDO (`0x1c12` or `0x1c13`)
	pub assign: u16,
}

/// standard objects of CiA 301 and CiA 402 used to bring up a drive
pub mod objects {
	use super::*;

	/// first receive PDO (master to slave) mapping
	pub const RX_PDO: ConfigurablePdo = ConfigurablePdo {index: 0x1600, assign: 0x1c12};
	/// first transmit PDO (slave to master) mapping
	pub const TX_PDO: ConfigurablePdo = ConfigurablePdo {index: 0x1a00, assign: 0x1c13};

	pub const CONTROLWORD: Sdo<ControlWord> = Sdo::complete(0x6040);
	pub const STATUSWORD: Sdo<StatusWord> = Sdo::complete(0x6041);
	pub const MODE_OF_OPERATION: Sdo<OperationMode> = Sdo::complete(0x6060);
	pub const MODE_DISPLAY: Sdo<i8> = Sdo::complete(0x6061);
	pub const POSITION_ACTUAL: Sdo<i32> = Sdo::complete(0x6064);
	pub const VELOCITY_ACTUAL: Sdo<i32> = Sdo::complete(0x606c);
	pub const TARGET_TORQUE: Sdo<i16> = Sdo::complete(0x6071);
	pub const MAX_TORQUE: Sdo<u16> = Sdo::complete(0x6072);
	pub const RATED_CURRENT: Sdo<u32> = Sdo::complete(0x6075);
	pub const TORQUE_ACTUAL: Sdo<i16> = Sdo::complete(0x6077);
	pub const TARGET_POSITION: Sdo<i32> = Sdo::complete(0x607a);
	pub const TORQUE_SLOPE: Sdo<u32> = Sdo::complete(0x6087);
	pub const ENCODER_INCREMENTS: Sdo<u32> = Sdo::sub(0x608f, 1);
	pub const GEAR_RATIO: Sdo<u32> = Sdo::sub(0x608f, 2);
	pub const INTERPOLATION_PERIOD: Sdo<u8> = Sdo::sub(0x60c2, 1);
	pub const INTERPOLATION_INDEX: Sdo<i8> = Sdo::sub(0x60c2, 2);

	/// default receive mapping: controlword, mode, target torque, target position
	pub fn rx_mapping() -> PdoMapping {
		[
			PdoEntry::of(CONTROLWORD),
			PdoEntry::of(MODE_OF_OPERATION),
			PdoEntry::of(TARGET_TORQUE),
			PdoEntry::of(TARGET_POSITION),
		].into_iter().collect()
	}
	/// default transmit mapping: statusword, mode display, position, torque
	pub fn tx_mapping() -> PdoMapping {
		[
			PdoEntry::of(STATUSWORD),
			PdoEntry::of(MODE_DISPLAY),
			PdoEntry::of(POSITION_ACTUAL),
			PdoEntry::of(TORQUE_ACTUAL),
		].into_iter().collect()
	}
}
