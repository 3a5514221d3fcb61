//! Parsing for CPU and memory quantities (`100m`, `0.5`, `128Mi`, `1G`).

/// Largest CPU request accepted, in millicores (1024 cores).
pub const MAX_CPU_MILLIS: u64 = 1024 * 1000;

/// Largest memory request accepted, in bytes (1 TiB).
pub const MAX_MEMORY_BYTES: u64 = 1 << 40;

/// Parse a CPU quantity into millicores. `"100m"` → 100, `"1.5"` → 1500.
///
/// Values above [`MAX_CPU_MILLIS`] are rejected.
pub fn parse_cpu_millis(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .ok()
            .filter(|m| (1..=MAX_CPU_MILLIS).contains(m));
    }
    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };
    if frac.len() > 3 || (whole.is_empty() && frac.is_empty()) {
        return None;
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_millis: u64 = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<3}");
        padded.parse().ok()?
    };
    let millis = whole.checked_mul(1000)?.checked_add(frac_millis)?;
    (1..=MAX_CPU_MILLIS).contains(&millis).then_some(millis)
}

/// Parse a memory quantity into bytes. Binary (`Ki`, `Mi`, `Gi`, `Ti`) and
/// decimal (`K`, `M`, `G`, `T`) suffixes are accepted; no suffix means bytes.
/// Values above [`MAX_MEMORY_BYTES`] are rejected.
pub fn parse_memory_bytes(raw: &str) -> Option<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];

    let raw = raw.trim();
    let (digits, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| raw.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((raw, 1));
    let value: u64 = digits.parse().ok()?;
    value
        .checked_mul(multiplier)
        .filter(|b| (1..=MAX_MEMORY_BYTES).contains(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_cpu_millis("100m"), Some(100));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis(".25"), Some(250));
        assert_eq!(parse_cpu_millis("1.0005"), None);
        assert_eq!(parse_cpu_millis("0"), None);
        assert_eq!(parse_cpu_millis("fast"), None);
        assert_eq!(parse_cpu_millis(""), None);
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_memory_bytes("128Mi"), Some(128 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1Gi"), Some(1 << 30));
        assert_eq!(parse_memory_bytes("512Ki"), Some(512 * 1024));
        assert_eq!(parse_memory_bytes("2M"), Some(2_000_000));
        assert_eq!(parse_memory_bytes("1000000"), Some(1_000_000));
        assert_eq!(parse_memory_bytes("12MB"), None);
        assert_eq!(parse_memory_bytes("0Mi"), None);
    }

    #[test]
    fn test_oversized_quantities_rejected() {
        assert_eq!(parse_cpu_millis("1024"), Some(MAX_CPU_MILLIS));
        assert_eq!(parse_cpu_millis("1025"), None);
        assert_eq!(parse_cpu_millis("20000000000000m"), None);
        assert_eq!(parse_memory_bytes("1Ti"), Some(MAX_MEMORY_BYTES));
        assert_eq!(parse_memory_bytes("2Ti"), None);
        assert_eq!(parse_memory_bytes("16000000T"), None);
    }
}
