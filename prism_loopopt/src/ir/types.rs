//! Primitive data types of the loop IR.
//!
//! The type set mirrors what a managed-runtime method compiler sees after
//! type inference: sized signed and unsigned integrals, two float widths,
//! references and void. Narrow integral values are always held in their
//! *normalized* form, i.e. truncated to the type width and then sign- or
//! zero-extended to 64 bits, so that arithmetic on a wider type implicitly
//! widens them:
//!
//! ```text
//!   Int8   0xff  ->  -1        Uint8   0xff  ->  255
//!   Int16  0x8000 -> -32768    Uint16  0x8000 -> 32768
//! ```

use std::fmt;

// =============================================================================
// Data Type
// =============================================================================

/// Primitive type of an instruction result or array component.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DataType {
    Bool = 0,
    Uint8 = 1,
    Int8 = 2,
    Uint16 = 3,
    Int16 = 4,
    Int32 = 5,
    Int64 = 6,
    Float32 = 7,
    Float64 = 8,
    Reference = 9,
    Void = 10,
}

impl DataType {
    /// Size in bytes of one element of this type.
    #[inline]
    pub const fn size(self) -> u32 {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Reference => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Void => 0,
        }
    }

    /// log2 of [`size`](Self::size).
    #[inline]
    pub const fn size_shift(self) -> u32 {
        match self.size() {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => 0,
        }
    }

    /// Width in bits.
    #[inline]
    pub const fn bit_width(self) -> u32 {
        self.size() * 8
    }

    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            DataType::Bool
                | DataType::Uint8
                | DataType::Int8
                | DataType::Uint16
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
        )
    }

    #[inline]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    #[inline]
    pub const fn is_unsigned(self) -> bool {
        matches!(self, DataType::Bool | DataType::Uint8 | DataType::Uint16)
    }

    /// Signed counterpart of a narrow unsigned type; identity otherwise.
    #[inline]
    pub const fn to_signed(self) -> DataType {
        match self {
            DataType::Bool | DataType::Uint8 => DataType::Int8,
            DataType::Uint16 => DataType::Int16,
            other => other,
        }
    }

    /// Unsigned counterpart of a narrow signed type; identity otherwise.
    #[inline]
    pub const fn to_unsigned(self) -> DataType {
        match self {
            DataType::Bool | DataType::Int8 => DataType::Uint8,
            DataType::Int16 => DataType::Uint16,
            other => other,
        }
    }

    /// Pick the signed or unsigned flavor of a narrow type.
    #[inline]
    pub const fn to_proper(self, is_unsigned: bool) -> DataType {
        if is_unsigned {
            self.to_unsigned()
        } else {
            self.to_signed()
        }
    }

    /// Normalize a raw integral bit pattern to this type's value range.
    pub fn normalize(self, value: i64) -> i64 {
        match self {
            DataType::Bool => (value != 0) as i64,
            DataType::Uint8 => value as u8 as i64,
            DataType::Int8 => value as i8 as i64,
            DataType::Uint16 => value as u16 as i64,
            DataType::Int16 => value as i16 as i64,
            DataType::Int32 => value as i32 as i64,
            _ => value,
        }
    }

    /// True if `value` is representable in this integral type without change.
    pub fn fits(self, value: i64) -> bool {
        self.normalize(value) == value
    }

    /// Smallest and largest value of an integral type.
    pub fn range(self) -> (i64, i64) {
        match self {
            DataType::Bool => (0, 1),
            DataType::Uint8 => (0, u8::MAX as i64),
            DataType::Int8 => (i8::MIN as i64, i8::MAX as i64),
            DataType::Uint16 => (0, u16::MAX as i64),
            DataType::Int16 => (i16::MIN as i64, i16::MAX as i64),
            DataType::Int32 => (i32::MIN as i64, i32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Uint8 => "u8",
            DataType::Int8 => "i8",
            DataType::Uint16 => "u16",
            DataType::Int16 => "i16",
            DataType::Int32 => "i32",
            DataType::Int64 => "i64",
            DataType::Float32 => "f32",
            DataType::Float64 => "f64",
            DataType::Reference => "ref",
            DataType::Void => "void",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_and_shifts() {
        assert_eq!(DataType::Int8.size(), 1);
        assert_eq!(DataType::Uint16.size_shift(), 1);
        assert_eq!(DataType::Float64.size_shift(), 3);
        assert_eq!(DataType::Int32.bit_width(), 32);
    }

    #[test]
    fn test_normalize_narrow_types() {
        assert_eq!(DataType::Int8.normalize(0xff), -1);
        assert_eq!(DataType::Uint8.normalize(-1), 255);
        assert_eq!(DataType::Int16.normalize(0x8000), -32768);
        assert_eq!(DataType::Uint16.normalize(0x1_0001), 1);
        assert_eq!(DataType::Int32.normalize(i64::from(u32::MAX)), -1);
        assert!(DataType::Int8.fits(-128));
        assert!(!DataType::Int8.fits(128));
    }

    #[test]
    fn test_signedness_flip() {
        assert_eq!(DataType::Uint8.to_signed(), DataType::Int8);
        assert_eq!(DataType::Int16.to_unsigned(), DataType::Uint16);
        assert_eq!(DataType::Int32.to_unsigned(), DataType::Int32);
        assert_eq!(DataType::Int8.to_proper(true), DataType::Uint8);
        assert_eq!(DataType::Uint16.to_proper(false), DataType::Int16);
    }
}
