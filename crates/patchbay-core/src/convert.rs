//! The type-conversion service: stateless string-to-target conversion used
//! by the binding engine for present values and declared defaults.
//!
//! Rules, value → target:
//! - numerics and the big-number target parse decimal text; malformed or
//!   out-of-range text fails
//! - booleans accept exactly the `true`/`false` literals, case-insensitive
//! - characters take the first code point; an empty string fails
//! - enums match declared variant names case-sensitively
//! - string lists split a single joined value on the literal comma, keeping
//!   segments verbatim (no trimming)

use crate::error::ConvertError;
use crate::params::{BoundValue, TargetType};

macro_rules! parse_numeric {
    ($raw:expr, $target:expr, $ty:ty, $variant:ident) => {
        $raw.parse::<$ty>()
            .map(BoundValue::$variant)
            .map_err(|_| ConvertError::new($raw, $target))
    };
}

/// Convert one raw string into the target type.
pub fn convert(raw: &str, target: TargetType) -> Result<BoundValue, ConvertError> {
    match target {
        TargetType::Str => Ok(BoundValue::Str(raw.to_owned())),
        TargetType::I8 => parse_numeric!(raw, target, i8, I8),
        TargetType::I16 => parse_numeric!(raw, target, i16, I16),
        TargetType::I32 => parse_numeric!(raw, target, i32, I32),
        TargetType::I64 => parse_numeric!(raw, target, i64, I64),
        TargetType::U8 => parse_numeric!(raw, target, u8, U8),
        TargetType::U16 => parse_numeric!(raw, target, u16, U16),
        TargetType::U32 => parse_numeric!(raw, target, u32, U32),
        TargetType::U64 => parse_numeric!(raw, target, u64, U64),
        TargetType::BigInt => parse_numeric!(raw, target, i128, BigInt),
        TargetType::F32 => parse_numeric!(raw, target, f32, F32),
        TargetType::F64 => parse_numeric!(raw, target, f64, F64),
        TargetType::Bool => parse_bool(raw),
        TargetType::Char => raw
            .chars()
            .next()
            .map(BoundValue::Char)
            .ok_or_else(|| ConvertError::new(raw, target)),
        TargetType::Enum(spec) => spec
            .matches(raw)
            .map(|variant| BoundValue::Enum { type_name: spec.name, variant })
            .ok_or_else(|| ConvertError::new(raw, target)),
        TargetType::StrList => Ok(BoundValue::StrList(split_joined(raw))),
    }
}

/// Split one comma-joined value into list elements, verbatim.
pub fn split_joined(raw: &str) -> Vec<String> {
    raw.split(',').map(str::to_owned).collect()
}

/// The intrinsic zero value bound when a parameter is absent, optional, and
/// has no default: numeric zero, `false`, `'\0'` — or [`BoundValue::Absent`]
/// for reference-shaped targets (strings, lists, enums, big numbers), which
/// have no intrinsic zero.
pub fn zero_value(target: TargetType) -> BoundValue {
    match target {
        TargetType::I8 => BoundValue::I8(0),
        TargetType::I16 => BoundValue::I16(0),
        TargetType::I32 => BoundValue::I32(0),
        TargetType::I64 => BoundValue::I64(0),
        TargetType::U8 => BoundValue::U8(0),
        TargetType::U16 => BoundValue::U16(0),
        TargetType::U32 => BoundValue::U32(0),
        TargetType::U64 => BoundValue::U64(0),
        TargetType::F32 => BoundValue::F32(0.0),
        TargetType::F64 => BoundValue::F64(0.0),
        TargetType::Bool => BoundValue::Bool(false),
        TargetType::Char => BoundValue::Char('\0'),
        TargetType::Str | TargetType::StrList | TargetType::Enum(_) | TargetType::BigInt => {
            BoundValue::Absent
        }
    }
}

fn parse_bool(raw: &str) -> Result<BoundValue, ConvertError> {
    if raw.eq_ignore_ascii_case("true") {
        Ok(BoundValue::Bool(true))
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(BoundValue::Bool(false))
    } else {
        Err(ConvertError::new(raw, TargetType::Bool))
    }
}
