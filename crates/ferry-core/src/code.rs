//! Human-shareable transfer codes
//!
//! A code is six decimal digits shown as `NNN-NNN`; nine-digit
//! `NNN-NNN-NNN` codes from other generators are accepted too.

/// Generate a random six-digit code (e.g. `"123-456"`).
///
/// # Panics
/// Panics if the system random number generator fails.
pub fn generate() -> String {
    loop {
        let mut bytes = [0u8; 4];
        getrandom::getrandom(&mut bytes).expect("RNG failed - system entropy source unavailable");
        let n = u32::from_le_bytes(bytes) % 1_000_000;
        if n == 0 {
            continue;
        }
        return format!("{:03}-{:03}", n / 1000, n % 1000);
    }
}

/// Whether `code` matches `NNN-NNN` or `NNN-NNN-NNN`.
pub fn validate(code: &str) -> bool {
    let groups: Vec<&str> = code.split('-').collect();
    if groups.len() != 2 && groups.len() != 3 {
        return false;
    }
    groups
        .iter()
        .all(|g| g.len() == 3 && g.bytes().all(|b| b.is_ascii_digit()))
}

/// Strip separators and whitespace: `"123-456"` becomes `"123456"`.
pub fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}
