//! InfluxDB line protocol encoding

use crate::domain::models::{FieldValue, Fields, Reading};
use std::fmt::Write;

/// One line-protocol point
#[derive(Debug, Clone)]
pub struct Point<'a> {
    pub measurement: &'a str,
    pub tags: Vec<(&'a str, &'a str)>,
    pub fields: &'a Fields,
    /// Nanoseconds since the Unix epoch; omitted lets the server stamp it
    pub timestamp: Option<i64>,
}

impl<'a> Point<'a> {
    /// `measurement,address=<addr> <fields> <timestamp>`
    pub fn from_reading(measurement: &'a str, reading: &'a Reading) -> Self {
        Self {
            measurement,
            tags: vec![("address", reading.address.as_str())],
            fields: &reading.fields,
            timestamp: Some(reading.timestamp_ns),
        }
    }

    pub fn to_line(&self) -> String {
        let mut line = escape(self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', ' ', '=']),
                escape(value, &[',', ' ', '='])
            );
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, &[',', ' ', '=']), field_value(value)))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));
        if let Some(ts) = self.timestamp {
            let _ = write!(line, " {ts}");
        }
        line
    }
}

/// Backslash-escapes every char in `special`
fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format_float(*v),
        FieldValue::Int(v) => format!("{v}i"),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Text(s) => format!("\"{}\"", escape(s, &['"', '\\'])),
    }
}

/// Shortest general float form with six significant digits, matching C `%g`
pub fn format_float(v: f64) -> String {
    const PRECISION: i32 = 6;
    if v == 0.0 || !v.is_finite() {
        return v.to_string();
    }
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, v);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= PRECISION {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp) as usize;
        trim_fraction(&format!("{v:.decimals$}")).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// One datagram payload, lines separated by `\n`
pub fn join_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    lines.into_iter().collect::<Vec<_>>().join("\n")
}
