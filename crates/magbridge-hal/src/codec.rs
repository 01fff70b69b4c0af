//! Bitfield codec for the TLV493D register images.
//!
//! The sensor exposes a 10-byte read image and accepts a 4-byte
//! configuration image.  Both are described by static tables mapping a field
//! to its `(byte index, mask, shift)` triple.  Field names are enums, so an
//! unknown field cannot be looked up.
//!
//! # Example
//!
//! ```rust
//! use magbridge_hal::codec::{self, ReadField, WriteField};
//!
//! let mut image = [0u8; codec::READ_LEN];
//! image[7] = 0b0001_1000;
//! assert_eq!(codec::get(&image, ReadField::Res1), 0b11);
//!
//! let mut config = [0u8; codec::WRITE_LEN];
//! codec::set(&mut config, WriteField::Fast, 1);
//! assert_eq!(config[1], 0b0000_0010);
//! ```

/// Length of the read image.  Always refreshed in full.
pub const READ_LEN: usize = 10;

/// Length of the configuration image.
pub const WRITE_LEN: usize = 4;

/// Full-scale sensitivity: microtesla per least-significant bit.
pub const SENSITIVITY_UT_PER_LSB: f64 = 98.0;

pub type ReadBuffer = [u8; READ_LEN];
pub type WriteBuffer = [u8; WRITE_LEN];

/// Location of a named bitfield inside a register image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMask {
    pub byte: usize,
    pub mask: u8,
    pub shift: u8,
}

impl FieldMask {
    const fn new(byte: usize, mask: u8, shift: u8) -> Self {
        Self { byte, mask, shift }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Read table
// ─────────────────────────────────────────────────────────────────────────────

/// Fields of the 10-byte read image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadField {
    /// X axis, bits 11..4.
    Bx1,
    /// X axis, bits 3..0 (high nibble of byte 4).
    Bx2,
    By1,
    By2,
    Bz1,
    Bz2,
    Temp1,
    Temp2,
    FrameCounter,
    Channel,
    PowerDownFlag,
    /// Factory bits echoed back into the configuration image.
    Res1,
    Res2,
    Res3,
}

impl ReadField {
    pub const ALL: [ReadField; 14] = [
        ReadField::Bx1,
        ReadField::Bx2,
        ReadField::By1,
        ReadField::By2,
        ReadField::Bz1,
        ReadField::Bz2,
        ReadField::Temp1,
        ReadField::Temp2,
        ReadField::FrameCounter,
        ReadField::Channel,
        ReadField::PowerDownFlag,
        ReadField::Res1,
        ReadField::Res2,
        ReadField::Res3,
    ];

    pub const fn mask(self) -> FieldMask {
        match self {
            ReadField::Bx1 => FieldMask::new(0, 0xFF, 0),
            ReadField::Bx2 => FieldMask::new(4, 0xF0, 4),
            ReadField::By1 => FieldMask::new(1, 0xFF, 0),
            ReadField::By2 => FieldMask::new(4, 0x0F, 0),
            ReadField::Bz1 => FieldMask::new(2, 0xFF, 0),
            ReadField::Bz2 => FieldMask::new(5, 0x0F, 0),
            ReadField::Temp1 => FieldMask::new(3, 0xF0, 4),
            ReadField::Temp2 => FieldMask::new(6, 0xFF, 0),
            ReadField::FrameCounter => FieldMask::new(3, 0x0C, 2),
            ReadField::Channel => FieldMask::new(3, 0x03, 0),
            ReadField::PowerDownFlag => FieldMask::new(5, 0x10, 4),
            ReadField::Res1 => FieldMask::new(7, 0x18, 3),
            ReadField::Res2 => FieldMask::new(8, 0xFF, 0),
            ReadField::Res3 => FieldMask::new(9, 0x1F, 0),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write table
// ─────────────────────────────────────────────────────────────────────────────

/// Fields of the 4-byte configuration image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteField {
    Parity,
    /// Address-select bits.
    Addr,
    Int,
    Fast,
    LowPower,
    TempDisable,
    LpPeriod,
    PowerDown,
    Res1,
    Res2,
    Res3,
}

impl WriteField {
    pub const ALL: [WriteField; 11] = [
        WriteField::Parity,
        WriteField::Addr,
        WriteField::Int,
        WriteField::Fast,
        WriteField::LowPower,
        WriteField::TempDisable,
        WriteField::LpPeriod,
        WriteField::PowerDown,
        WriteField::Res1,
        WriteField::Res2,
        WriteField::Res3,
    ];

    pub const fn mask(self) -> FieldMask {
        match self {
            WriteField::Parity => FieldMask::new(1, 0x80, 7),
            WriteField::Addr => FieldMask::new(1, 0x60, 5),
            WriteField::Int => FieldMask::new(1, 0x04, 2),
            WriteField::Fast => FieldMask::new(1, 0x02, 1),
            WriteField::LowPower => FieldMask::new(1, 0x01, 0),
            WriteField::TempDisable => FieldMask::new(3, 0x80, 7),
            WriteField::LpPeriod => FieldMask::new(3, 0x40, 6),
            WriteField::PowerDown => FieldMask::new(3, 0x20, 5),
            WriteField::Res1 => FieldMask::new(1, 0x18, 3),
            WriteField::Res2 => FieldMask::new(2, 0xFF, 0),
            WriteField::Res3 => FieldMask::new(3, 0x1F, 0),
        }
    }
}

/// Reserved fields that must be copied verbatim from the read image into the
/// configuration image.
pub const RESERVED_FIELDS: [(ReadField, WriteField); 3] = [
    (ReadField::Res1, WriteField::Res1),
    (ReadField::Res2, WriteField::Res2),
    (ReadField::Res3, WriteField::Res3),
];

// ─────────────────────────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────────────────────────

/// Extract `field` from the read image, right-aligned.
pub fn get(buffer: &ReadBuffer, field: ReadField) -> u8 {
    let FieldMask { byte, mask, shift } = field.mask();
    (buffer[byte] & mask) >> shift
}

/// Store `value` into `field` of the configuration image.
///
/// Bits outside the field's mask are preserved.  `value` is not range
/// checked; excess bits are discarded by the mask.
pub fn set(buffer: &mut WriteBuffer, field: WriteField, value: u8) {
    let FieldMask { byte, mask, shift } = field.mask();
    buffer[byte] = (buffer[byte] & !mask) | ((value << shift) & mask);
}

/// Decode one axis from its top byte and a bottom byte carrying the low
/// nibble in its high half.
///
/// The sensor reports a 12-bit two's-complement value; read as a big-endian
/// `i16` it is left-justified, so an arithmetic shift by 4 recovers the sign.
pub fn decode_axis(top: u8, bottom: u8) -> f64 {
    let raw = i16::from_be_bytes([top, bottom]) >> 4;
    f64::from(raw) * SENSITIVITY_UT_PER_LSB
}

/// Gather the two component bytes of an axis from the read image and decode
/// them.
pub fn axis(buffer: &ReadBuffer, high: ReadField, low_nibble: ReadField) -> f64 {
    let top = get(buffer, high);
    let bottom = get(buffer, low_nibble) << 4;
    decode_axis(top, bottom)
}
