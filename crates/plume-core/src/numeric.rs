//! Byte-string helpers shared by the config layer and the protocol plugins.

/// Lenient decimal conversion.
///
/// An optional leading `-` is honoured, digits are accumulated until the
/// first non-digit byte and the rest is ignored. Empty or non-numeric
/// input yields 0. Overflow wraps, like the C conversions it mirrors.
pub fn str2i(s: &[u8]) -> i64 {
    let (neg, digits) = match s.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, s),
    };

    let mut value: i64 = 0;
    for &c in digits {
        if !c.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add(i64::from(c - b'0'));
    }

    if neg {
        value.wrapping_neg()
    } else {
        value
    }
}

/// Hex conversion with an optional `0x` prefix. `-1` is accepted as the
/// all-ones tag.
pub fn hex2i(s: &str) -> Option<u32> {
    let s = s.trim();
    if s == "-1" {
        return Some(u32::MAX);
    }
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).ok()
}

/// Bit string such as `"0101"` to a mask. The rightmost character is bit 0;
/// anything other than `'1'` counts as a clear bit.
pub fn bitset2u64(s: &str) -> Option<u64> {
    let bits = s.trim().as_bytes();
    if bits.is_empty() || bits.len() > 64 {
        return None;
    }
    let mut v = 0u64;
    for (i, &c) in bits.iter().rev().enumerate() {
        if c == b'1' {
            v |= 1 << i;
        }
    }
    Some(v)
}

/// Fold one byte for header comparison. Only `A-Z` is touched.
#[inline]
pub fn fold(c: u8) -> u8 {
    c.to_ascii_lowercase()
}

/// Case-insensitive equality over ASCII letters, exact elsewhere.
#[inline]
pub fn fold_eq(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// FNV-1a over the folded bytes, so keys that compare equal hash equal.
pub fn fold_hash(s: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &c in s {
        h ^= u32::from(fold(c));
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// Strip ASCII spaces from both ends.
pub fn trim_spaces(mut s: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' '] = s {
        s = rest;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str2i_lenient() {
        assert_eq!(str2i(b"1234"), 1234);
        assert_eq!(str2i(b"12ab34"), 12);
        assert_eq!(str2i(b"-42"), -42);
        assert_eq!(str2i(b""), 0);
        assert_eq!(str2i(b"abc"), 0);
        assert_eq!(str2i(b"-"), 0);
        assert_eq!(str2i(b" 7"), 0);
    }

    #[test]
    fn test_hex2i() {
        assert_eq!(hex2i("0xEFEFABCD"), Some(0xEFEF_ABCD));
        assert_eq!(hex2i("ff"), Some(0xff));
        assert_eq!(hex2i("-1"), Some(u32::MAX));
        assert_eq!(hex2i("0xZZ"), None);
    }

    #[test]
    fn test_bitset2u64() {
        assert_eq!(bitset2u64("0001"), Some(1));
        assert_eq!(bitset2u64("0110"), Some(6));
        assert_eq!(bitset2u64("1"), Some(1));
        assert_eq!(bitset2u64(""), None);
    }

    #[test]
    fn test_fold() {
        assert!(fold_eq(b"Content-Length", b"content-length"));
        assert!(!fold_eq(b"Host", b"Hos"));
        // '[' and '{' differ by 0x20 but are not letters
        assert!(!fold_eq(b"[", b"{"));
        assert_eq!(fold_hash(b"HOST"), fold_hash(b"host"));
        assert_ne!(fold_hash(b"host"), fold_hash(b"hosts"));
    }

    #[test]
    fn test_trim_spaces() {
        assert_eq!(trim_spaces(b"  a b  "), b"a b");
        assert_eq!(trim_spaces(b"   "), b"");
        assert_eq!(trim_spaces(b"x"), b"x");
    }
}
