//! NDJSON telemetry record parsing.
//!
//! Each line of `kinfer_log.ndjson` is one JSON object describing a control
//! step. The joint arrays are positional and named by `joint_order`:
//!
//! ```text
//! {"step_id": 12, "timestamp": 1760353266.51,
//!  "joint_order": ["hip", "knee"],
//!  "joint_angles": [0.12, -0.40], "joint_velocities": [0.0, 0.3],
//!  "joint_torques": [1.2, 0.8]}
//! ```
//!
//! Fields beyond the five required ones are preserved in
//! [`TelemetryRecord::extra`] so a parsed record re-serializes to an
//! equivalent line.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ParseError;

/// One validated control step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub step_id: i64,
    pub timestamp: f64,
    pub joint_angles: Vec<f64>,
    pub joint_velocities: Vec<f64>,
    pub joint_order: Vec<String>,
    /// Remaining top-level fields, untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TelemetryRecord {
    /// Number of joints described by this record.
    pub fn joint_count(&self) -> usize {
        self.joint_order.len()
    }

    /// Serialize back to a single NDJSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse one line (newline already stripped) into a record.
///
/// Pure: no I/O and no state; the same input always yields the same result.
pub fn parse(line: &str) -> Result<TelemetryRecord, ParseError> {
    let value: Value = serde_json::from_str(line).map_err(|e| ParseError::MalformedJson {
        message: e.to_string(),
    })?;

    let Value::Object(mut obj) = value else {
        return Err(ParseError::schema("<root>", "expected a JSON object"));
    };

    let step_id = take_step_id(&mut obj)?;
    let timestamp = take_number(&mut obj, "timestamp")?;
    let joint_angles = take_number_array(&mut obj, "joint_angles")?;
    let joint_velocities = take_number_array(&mut obj, "joint_velocities")?;
    let joint_order = take_string_array(&mut obj, "joint_order")?;

    if joint_order.len() != joint_angles.len() {
        return Err(ParseError::schema(
            "joint_order",
            format!(
                "length {} != joint_angles length {}",
                joint_order.len(),
                joint_angles.len()
            ),
        ));
    }
    if joint_order.len() != joint_velocities.len() {
        return Err(ParseError::schema(
            "joint_order",
            format!(
                "length {} != joint_velocities length {}",
                joint_order.len(),
                joint_velocities.len()
            ),
        ));
    }

    Ok(TelemetryRecord {
        step_id,
        timestamp,
        joint_angles,
        joint_velocities,
        joint_order,
        extra: obj,
    })
}

/// Parse one raw line as read from the log.
///
/// JSON text must be UTF-8, so undecodable bytes make the line
/// [`ParseError::MalformedJson`].
pub fn parse_bytes(line: &[u8]) -> Result<TelemetryRecord, ParseError> {
    let text = std::str::from_utf8(line).map_err(|e| ParseError::MalformedJson {
        message: format!("invalid UTF-8: {}", e),
    })?;
    parse(text)
}

fn take(obj: &mut Map<String, Value>, field: &'static str) -> Result<Value, ParseError> {
    match obj.remove(field) {
        None | Some(Value::Null) => Err(ParseError::schema(field, "missing")),
        Some(v) => Ok(v),
    }
}

/// Integers, integral floats, and integer strings are all accepted.
fn take_step_id(obj: &mut Map<String, Value>) -> Result<i64, ParseError> {
    const FIELD: &str = "step_id";
    match take(obj, FIELD)? {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => Err(ParseError::schema(FIELD, format!("{} is not an integer", n))),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::schema(FIELD, format!("'{}' is not an integer", s))),
        other => Err(ParseError::schema(
            FIELD,
            format!("expected integer, got {}", type_name(&other)),
        )),
    }
}

fn take_number(obj: &mut Map<String, Value>, field: &'static str) -> Result<f64, ParseError> {
    match take(obj, field)? {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ParseError::schema(field, "number out of range")),
        other => Err(ParseError::schema(
            field,
            format!("expected number, got {}", type_name(&other)),
        )),
    }
}

fn take_number_array(
    obj: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Vec<f64>, ParseError> {
    let Value::Array(items) = take(obj, field)? else {
        return Err(ParseError::schema(field, "expected array of numbers"));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64().ok_or_else(|| {
                ParseError::schema(
                    field,
                    format!("element {} is {}, expected number", i, type_name(v)),
                )
            })
        })
        .collect()
}

fn take_string_array(
    obj: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, ParseError> {
    let Value::Array(items) = take(obj, field)? else {
        return Err(ParseError::schema(field, "expected array of strings"));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::String(s) => Ok(s),
            other => Err(ParseError::schema(
                field,
                format!("element {} is {}, expected string", i, type_name(&other)),
            )),
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
