use bytes::Bytes;
use data_encoding::HEXLOWER;
use thiserror::Error;

/// The width of a [Pointer] in bytes (a BLAKE3 digest).
pub const POINTER_LEN: usize = 32;

const ZERO: [u8; POINTER_LEN] = [0; POINTER_LEN];

/// An opaque fixed-width key naming a byte region in a blob store.
///
/// Pointers are content hashes: the pointer of a stored object is the BLAKE3
/// digest of the bytes as stored. They compare by value; the zero pointer
/// denotes "absent" and never names a stored object.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer(Bytes);

#[derive(Debug, Error, PartialEq)]
pub enum PointerError {
    #[error("invalid pointer length: {0}")]
    InvalidLen(usize),
    #[error("invalid pointer hex: {0:?}")]
    InvalidHex(String),
}

impl Pointer {
    /// The distinguished "absent" pointer.
    pub fn zero() -> Self {
        Self(Bytes::from_static(&ZERO))
    }

    pub fn is_zero(&self) -> bool {
        self.0[..] == ZERO
    }

    /// The pointer of a byte region, i.e. its content hash.
    pub fn of(data: &[u8]) -> Self {
        Self::from(blake3::hash(data).as_bytes())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Leading eight hex digits, for human-facing summaries.
    pub fn short(&self) -> String {
        HEXLOWER.encode(&self.0[..4])
    }

    pub fn from_hex(s: &str) -> Result<Self, PointerError> {
        let raw = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| PointerError::InvalidHex(s.to_string()))?;
        raw.try_into()
    }
}

impl From<&[u8; POINTER_LEN]> for Pointer {
    fn from(value: &[u8; POINTER_LEN]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl TryFrom<Vec<u8>> for Pointer {
    type Error = PointerError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != POINTER_LEN {
            Err(PointerError::InvalidLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<Bytes> for Pointer {
    type Error = PointerError;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if value.len() != POINTER_LEN {
            Err(PointerError::InvalidLen(value.len()))
        } else {
            Ok(Self(value))
        }
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

impl std::fmt::Debug for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}
