//! Traits and impls used to read/write values to/from process images and SDO payloads.

use core::{
	marker::PhantomData,
	fmt,
	};

/**
	trait for data types than can be packed/unpacked to/from a byte sequence exchanged with a slave,
	either in the cyclic process image or in an SDO transaction.

	All implementors use little endian, as every CoE object does.
*/
pub trait PduData: Sized {
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_bitsize() -> usize {Self::Packed::LEN*8}

    /// pack into a fresh storage
    fn packed(&self) -> PackingResult<Self::Packed> {
        let mut buffer = Self::Packed::zeroed();
        self.pack(buffer.as_mut())?;
        Ok(buffer)
    }
}

/// error raised when a value cannot be packed or unpacked
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PackingError {
    #[error("bad size {0}: {1}")]
    BadSize(usize, &'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// byte storage of a packed [PduData], it is always a fixed size array
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

/**
    macro implementing [PduData] for a struct or enum generated with `bilge`, `$id` is its underlying integer type.

    Use the `try` form for types deriving `TryFromBits`, the default form is for `FromBits`.
*/
macro_rules! bilge_pdudata {
    ($t: ty, $id: ident) => { impl crate::data::PduData for $t {
        type Packed = [u8; core::mem::size_of::<$id>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            <$id as crate::data::PduData>::pack(&$id::from(*self), dst)
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            Ok(Self::from(<$id as crate::data::PduData>::unpack(src)?))
        }
    }};
    ($t: ty, $id: ident, try) => { impl crate::data::PduData for $t {
        type Packed = [u8; core::mem::size_of::<$id>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            <$id as crate::data::PduData>::pack(&$id::from(*self), dst)
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            Self::try_from(<$id as crate::data::PduData>::unpack(src)?)
                .map_err(|_|  crate::data::PackingError::InvalidValue(stringify!($t)))
        }
    }};
}
pub(crate) use bilge_pdudata;

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty) => { impl crate::data::PduData for $t {
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                let size = core::mem::size_of::<$t>();
                if dst.len() < size
                    {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for number"))}
				dst[.. size].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
                let size = core::mem::size_of::<$t>();
                if src.len() < size
                    {return Err(crate::data::PackingError::BadSize(src.len(), "not enough bytes for number"))}
                let mut bytes = [0; core::mem::size_of::<$t>()];
                bytes.copy_from_slice(&src[.. size]);
				Ok(Self::from_le_bytes(bytes))
			}
		}};
}

num_pdudata!(u8);
num_pdudata!(u16);
num_pdudata!(u32);
num_pdudata!(i8);
num_pdudata!(i16);
num_pdudata!(i32);



/**
	locate some data in a process image by its byte position and length, which must be extracted to type `T` to be processed in rust

	It acts like a getter/setter of a value in a byte sequence. One can think of it as an offset to a data location because it does not actually point the data but only its offset in the byte sequence, it also contains its length to dynamically check memory bounds.

	This is how the cyclic exchange reads and writes the transport-owned process image without keeping any pointer into it.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    /// this is only here to mark that T is actually used
	extracted: PhantomData<T>,
	/// start byte index of the object
	pub byte: usize,
	/// byte length of the object
	pub len: usize,
}
impl<T: PduData> Field<T>
{
	/// build a Field from its byte offset and byte length
	pub const fn new(byte: usize, len: usize) -> Self {
		Self{extracted: PhantomData, byte, len}
	}
	/// build a Field from its byte offset, infering its length from the data nominal size
	pub const fn simple(byte: usize) -> Self {
        Self{extracted: PhantomData, byte, len: T::Packed::LEN}
	}
	/// first byte after the field
	pub const fn end(&self) -> usize {self.byte + self.len}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T> {
        let range = data.get(self.byte .. self.end())
            .ok_or(PackingError::BadSize(data.len(), "field out of image bounds"))?;
		T::unpack(range)
	}
	/// dump the given value to the place pointed by the field in the byte array
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        let size = data.len();
        let range = data.get_mut(self.byte .. self.end())
            .ok_or(PackingError::BadSize(size, "field out of image bounds"))?;
        value.pack(range)
	}
}
impl<T: PduData> fmt::Debug for Field<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Field{{0x{:x}, {}}}", self.byte, self.len)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a field pointing to a type which does not implement this operation
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self   {*self}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}
