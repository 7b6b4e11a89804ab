//! Decimal text for log fields, without `core::fmt`.
//!
//! The digit count is found by integer division, so powers of ten and the top
//! of the `u64` range size correctly.

/// Longest rendering: `-9223372036854775808` or `18446744073709551615`.
pub const MAX_DIGITS: usize = 20;

/// A rendered number, most significant digit first.
#[derive(Clone, Copy)]
pub struct Digits {
    buf: [u8; MAX_DIGITS + 1],
    len: u8,
}

impl Digits {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..usize::from(self.len)]
    }

    pub fn as_str(&self) -> &str {
        // Only ASCII digits and '-' are ever written.
        core::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub const fn len(&self) -> usize {
        self.len as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl core::fmt::Debug for Digits {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of decimal digits in `value`. Zero has one digit.
pub const fn digit_count(mut value: u64) -> usize {
    let mut count = 1;
    while value >= 10 {
        value /= 10;
        count += 1;
    }
    count
}

/// Render a second count as decimal digits.
pub fn encode(seconds: u64) -> Digits {
    let mut digits = Digits {
        buf: [0; MAX_DIGITS + 1],
        len: 0,
    };
    write_unsigned(&mut digits.buf, 0, seconds);
    digits.len = digit_count(seconds) as u8;
    digits
}

/// Render a signed value, with a leading `-` when negative.
pub fn encode_signed(value: i64) -> Digits {
    let mut digits = Digits {
        buf: [0; MAX_DIGITS + 1],
        len: 0,
    };
    let magnitude = value.unsigned_abs();
    let sign = usize::from(value < 0);
    if sign == 1 {
        digits.buf[0] = b'-';
    }
    write_unsigned(&mut digits.buf, sign, magnitude);
    digits.len = (sign + digit_count(magnitude)) as u8;
    digits
}

/// Fill `buf[start..start + digit_count(value)]`, least significant digit last.
fn write_unsigned(buf: &mut [u8], start: usize, mut value: u64) {
    let end = start + digit_count(value);
    for slot in buf[start..end].iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
}

/// Why a digit string was rejected by [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    Empty,
    LeadingZero,
    NotADigit,
    Overflow,
}

/// Parse the canonical form produced by [`encode`].
pub fn decode(text: &[u8]) -> Result<u64, DecodeError> {
    match text {
        [] => return Err(DecodeError::Empty),
        [b'0', _, ..] => return Err(DecodeError::LeadingZero),
        _ => {}
    }

    text.iter().try_fold(0u64, |acc, &byte| {
        if !byte.is_ascii_digit() {
            return Err(DecodeError::NotADigit);
        }
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(u64::from(byte - b'0')))
            .ok_or(DecodeError::Overflow)
    })
}
