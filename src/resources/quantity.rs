//! Kubernetes resource quantity parsing and formatting
//!
//! The canonical numeric representation is fractional cores for CPU and
//! bytes for memory. Parsing is deterministic: a string either maps to a
//! number or to None, and callers fall back to configured defaults with a
//! logged warning.

/// Parse a CPU quantity into fractional cores.
///
/// Accepts millicore notation ("2000m" -> 2.0) and plain core counts
/// ("2" -> 2.0, "0.5" -> 0.5).
pub fn parse_cpu(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(millis) = value.strip_suffix('m') {
        let parsed: f64 = millis.parse().ok()?;
        if parsed < 0.0 {
            return None;
        }
        return Some(parsed / 1000.0);
    }

    let parsed: f64 = value.parse().ok()?;
    if parsed < 0.0 || !parsed.is_finite() {
        return None;
    }
    Some(parsed)
}

/// Parse a memory (or storage) quantity into bytes.
///
/// Accepts binary suffixes (Ki, Mi, Gi, Ti, Pi), decimal suffixes
/// (k, K, M, G, T, P), and plain byte counts.
pub fn parse_memory(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    const BINARY: &[(&str, f64)] = &[
        ("Pi", 1125899906842624.0),
        ("Ti", 1099511627776.0),
        ("Gi", 1073741824.0),
        ("Mi", 1048576.0),
        ("Ki", 1024.0),
    ];
    const DECIMAL: &[(&str, f64)] = &[
        ("P", 1e15),
        ("T", 1e12),
        ("G", 1e9),
        ("M", 1e6),
        ("K", 1e3),
        ("k", 1e3),
    ];

    for (suffix, factor) in BINARY.iter().chain(DECIMAL) {
        if let Some(number) = value.strip_suffix(suffix) {
            let parsed: f64 = number.parse().ok()?;
            if parsed < 0.0 || !parsed.is_finite() {
                return None;
            }
            return Some(parsed * factor);
        }
    }

    let parsed: f64 = value.parse().ok()?;
    if parsed < 0.0 || !parsed.is_finite() {
        return None;
    }
    Some(parsed)
}

/// Format fractional cores as a millicore quantity string.
///
/// Rounds to whole millicores so equal envelopes always serialize
/// identically.
pub fn format_cpu(cores: f64) -> String {
    format!("{}m", (cores * 1000.0).round() as i64)
}

/// Format bytes as a Kubernetes memory quantity string.
///
/// Uses the largest binary suffix that divides the value exactly, falling
/// back to a plain byte count.
pub fn format_memory(bytes: f64) -> String {
    let bytes = bytes.round() as i64;
    const UNITS: &[(&str, i64)] = &[
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];

    for (suffix, factor) in UNITS {
        if bytes > 0 && bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    format!("{bytes}")
}
