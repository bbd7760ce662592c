//! Wire protocol constants
//!
//! Every record opens with a lead byte. Bytes below 200 are the first
//! byte of a varint integer; bytes 200 and up name a record kind. The
//! assignments are part of the exchange format and never move.

use crate::error::MarshalError;
use num_enum::TryFromPrimitive;

/// Recursion bound for the writer and the reader.
///
/// Depth is carried in the low 16 bits of the flags word threaded through
/// every recursive call; pathological nesting fails cleanly instead of
/// exhausting the native stack.
pub const RECURSION_GUARD: i32 = 1024;

/// Lead bytes of the marshaling protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Lead {
    /// 8-byte little-endian IEEE-754 double
    Real = 200,
    Nil = 201,
    False = 202,
    True = 203,
    Fiber = 204,
    /// 4-byte big-endian integer, also the long varint form
    Integer = 205,
    Str = 206,
    Symbol = 207,
    Keyword = 208,
    Array = 209,
    Tuple = 210,
    Table = 211,
    TableProto = 212,
    Struct = 213,
    Buffer = 214,
    Function = 215,
    Registry = 216,
    Abstract = 217,
    Reference = 218,
    FuncEnvRef = 219,
    FuncDefRef = 220,
}

pub(crate) fn check_depth(flags: i32) -> Result<(), MarshalError> {
    if (flags & 0xFFFF) > RECURSION_GUARD {
        Err(MarshalError::StackOverflow)
    } else {
        Ok(())
    }
}

/// The integer fast path: a double that is exactly a 32-bit integer.
///
/// The cast saturates out-of-range values and maps NaN to zero, and the
/// round-trip comparison rejects both, so this is exactly the
/// `[-2^31, 2^31 - 1]` integral range. Negative zero collapses to zero.
pub(crate) fn int_from_double(x: f64) -> Option<i32> {
    let i = x as i32;
    if i as f64 == x { Some(i) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_guard() {
        assert!(check_depth(0).is_ok());
        assert!(check_depth(RECURSION_GUARD).is_ok());
        assert!(check_depth(RECURSION_GUARD + 1).is_err());
    }

    #[test]
    fn test_int_fast_path_range() {
        assert_eq!(int_from_double(0.0), Some(0));
        assert_eq!(int_from_double(-0.0), Some(0));
        assert_eq!(int_from_double(2147483647.0), Some(i32::MAX));
        assert_eq!(int_from_double(-2147483648.0), Some(i32::MIN));
        assert_eq!(int_from_double(2147483648.0), None);
        assert_eq!(int_from_double(-2147483649.0), None);
        assert_eq!(int_from_double(0.5), None);
        assert_eq!(int_from_double(f64::NAN), None);
        assert_eq!(int_from_double(f64::INFINITY), None);
    }

    #[test]
    fn test_lead_byte_decoding() {
        assert!(matches!(Lead::try_from(201u8), Ok(Lead::Nil)));
        assert!(matches!(Lead::try_from(220u8), Ok(Lead::FuncDefRef)));
        assert!(Lead::try_from(221u8).is_err());
        assert!(Lead::try_from(199u8).is_err());
    }
}
