//! Kubernetes resource quantity parsing.
//!
//! Quantities are converted to integer milli-units with exact arithmetic,
//! rounding fractional milli-units up the way the API server does. CPU is
//! compared in millicores; memory is read back in whole bytes.

use crate::error::{OperatorError, Result};

/// Parse a quantity (`500m`, `2`, `1.5`, `4Gi`, `128974848`, `1e3`) into
/// milli-units.
pub fn parse_quantity(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    let invalid = |reason: &str| OperatorError::InvalidQuantity {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty quantity"));
    }
    if trimmed.starts_with('-') {
        return Err(invalid("negative quantities are not allowed"));
    }

    let number_end = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(number_end);
    let number = number.strip_prefix('+').unwrap_or(number);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid("missing digits"));
    }
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid("malformed number"));
    }

    let mut mantissa: i128 = 0;
    for digit in int_part.chars().chain(frac_part.chars()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(i128::from(digit as u8 - b'0')))
            .ok_or_else(|| invalid("value out of range"))?;
    }

    let (binary_shift, decimal_exp) = parse_suffix(suffix).ok_or_else(|| invalid("unknown suffix"))?;

    let scaled = mantissa
        .checked_mul(1i128 << binary_shift)
        .ok_or_else(|| invalid("value out of range"))?;

    // milli-units: shift the decimal point three places right
    let frac_len = i32::try_from(frac_part.len()).map_err(|_| invalid("value out of range"))?;
    let exp = decimal_exp + 3 - frac_len;
    let millis = if exp >= 0 {
        10i128
            .checked_pow(exp.unsigned_abs())
            .and_then(|p| scaled.checked_mul(p))
            .ok_or_else(|| invalid("value out of range"))?
    } else {
        match 10i128.checked_pow(exp.unsigned_abs()) {
            Some(divisor) => scaled
                .checked_add(divisor - 1)
                .map(|v| v / divisor)
                .ok_or_else(|| invalid("value out of range"))?,
            // too small to register, but non-zero values still round up
            None => i128::from(scaled > 0),
        }
    };

    i64::try_from(millis).map_err(|_| invalid("value out of range"))
}

/// Parse a memory quantity into bytes, rounding up
pub fn parse_bytes(value: &str) -> Result<i64> {
    let millis = parse_quantity(value)?;
    Ok(millis / 1000 + i64::from(millis % 1000 != 0))
}

/// Returns `(binary shift, decimal exponent)` for a quantity suffix
fn parse_suffix(suffix: &str) -> Option<(u32, i32)> {
    let parsed = match suffix {
        "" => (0, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        other => {
            let exponent = other
                .strip_prefix('e')
                .or_else(|| other.strip_prefix('E'))?;
            (0, exponent.parse::<i32>().ok().filter(|e| e.abs() <= 30)?)
        }
    };
    Some(parsed)
}
