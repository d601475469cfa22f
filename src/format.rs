//! Human-readable formatting of variable values.
//!
//! Raw values stay f64 everywhere; formatting is applied only at the read
//! surface so evaluations always see the numbers they were scored with.

use crate::types::{is_unset, VariableFormat};

/// Format a variable value per its declared presentation.
pub fn format_value(format: VariableFormat, value: f64) -> String {
    if is_unset(value) {
        return "unset".to_string();
    }

    match format {
        VariableFormat::Float => format!("{value:.2}"),
        VariableFormat::Bool => {
            if value != 0.0 {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        VariableFormat::Percent => format!("{:.1}%", value * 100.0),
        VariableFormat::Bytes => format_bytes(value),
        VariableFormat::Duration => format_duration(value),
    }
}

fn format_bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = value;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.round() as i64;
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, secs) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{secs}s")
    } else if minutes > 0 {
        format!("{minutes}m{secs}s")
    } else {
        format!("{secs}s")
    }
}
