//! Number parsing shared by the database and settings front ends

/// Parse a non-negative integer with an optional base prefix
///
/// Accepts `0x`/`0X` (hex), `0o` (octal), `0b` (binary), or plain decimal. Underscores between
/// digits are allowed.
pub(crate) fn parse_nonneg_int(text: &str) -> Option<u64> {
    let text = text.trim().strip_prefix('+').unwrap_or(text.trim());
    let (digits, radix) = match text.get(..2) {
        Some("0x" | "0X") => (&text[2..], 16),
        Some("0o" | "0O") => (&text[2..], 8),
        Some("0b" | "0B") => (&text[2..], 2),
        _ => (text, 10),
    };
    if digits.is_empty() || digits.starts_with('_') {
        return None;
    }
    u64::from_str_radix(&digits.replace('_', ""), radix).ok()
}

#[test]
fn parse_nonneg_int_works() {
    assert_eq!(parse_nonneg_int("0x28"), Some(0x28));
    assert_eq!(parse_nonneg_int("0XFF"), Some(0xff));
    assert_eq!(parse_nonneg_int("0x5D"), Some(0x5d));
    assert_eq!(parse_nonneg_int("+0x10"), Some(0x10));
    assert_eq!(parse_nonneg_int("0b1010"), Some(10));
    assert_eq!(parse_nonneg_int("0o17"), Some(15));
    assert_eq!(parse_nonneg_int("42"), Some(42));
    assert_eq!(parse_nonneg_int(" 0xdead_beef "), Some(0xdead_beef));
    assert_eq!(parse_nonneg_int("0x"), None);
    assert_eq!(parse_nonneg_int("-1"), None);
    assert_eq!(parse_nonneg_int("twelve"), None);
}
