#![allow(unused)]

use anyhow::{anyhow, Result};

use s390_boot::PAGE_SIZE;

/// Align @n down to @align
pub fn align_down(n: u64, align: u64) -> u64 {
    n & !(align - 1)
}

/// Align @n up to @align
pub fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// Return true if @n is aligned on @align
pub fn is_aligned(n: u64, align: u64) -> bool {
    (n & (align - 1)) == 0
}

pub fn page_align(n: u64) -> u64 {
    align_up(n, PAGE_SIZE)
}

pub fn is_page_aligned(n: u64) -> bool {
    is_aligned(n, PAGE_SIZE)
}

/// Parse a string as a hexadecimal u64, with or without a `0x` prefix.
/// Used for the control-flag and PSW overrides.
pub fn parse_hex_u64(s: &str) -> Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.starts_with('+') {
        return Err(anyhow!(
            "invalid value: '{s}' (must be a hexadecimal value, e.g. '0xcfe')"
        ));
    }

    u64::from_str_radix(digits, 16)
        .map_err(|_| anyhow!("invalid value: '{s}' (must be a hexadecimal value, e.g. '0xcfe')"))
}

pub fn buf_to_hex_str(b: &[u8]) -> String {
    b.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<String>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
        assert!(is_page_aligned(0x10000));
        assert!(!is_page_aligned(0x10001));
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u64("0x10000").unwrap(), 0x10000);
        assert_eq!(parse_hex_u64("cfe").unwrap(), 0xcfe);
        assert_eq!(parse_hex_u64("0xffffffffffffffff").unwrap(), u64::MAX);
        assert!(parse_hex_u64("").is_err());
        assert!(parse_hex_u64("0x").is_err());
        assert!(parse_hex_u64("1z").is_err());
        assert!(parse_hex_u64("+1").is_err());
        assert!(parse_hex_u64("0x10000000000000000").is_err());
    }

    #[test]
    fn test_hex_str() {
        assert_eq!(buf_to_hex_str(&[0xde, 0xad, 0x01]), "dead01");
    }
}
