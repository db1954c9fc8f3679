//! Flattening records into named numeric series for plotting.
//!
//! Naming scheme:
//!
//! | field shape                          | series name            |
//! |--------------------------------------|------------------------|
//! | numeric scalar                       | `timestamp`            |
//! | array under a jointed key            | `joint_angles.knee`    |
//! | any other numeric array              | `imu_accel[2]`         |
//! | object with numeric members          | `command.vx`           |
//!
//! Jointed arrays are named through the record's `joint_order`; positions
//! beyond it fall back to `idx<i>`. Booleans, strings, and nulls are skipped.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::query::IndexedRecord;
use crate::record::TelemetryRecord;

/// Array fields whose positions correspond to `joint_order`.
pub const JOINTED_KEYS: &[&str] = &[
    "joint_angles",
    "joint_velocities",
    "joint_amps",
    "joint_torques",
    "joint_temps",
    "output",
    "action",
];

/// `(x, y)` points of one named series; `x` is the (offset) step id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesPoints {
    pub x: Vec<i64>,
    pub y: Vec<f64>,
}

fn joint_name(joint_order: &[String], idx: usize) -> String {
    joint_order
        .get(idx)
        .cloned()
        .unwrap_or_else(|| format!("idx{}", idx))
}

fn push_array(
    out: &mut BTreeMap<String, f64>,
    key: &str,
    values: impl Iterator<Item = Option<f64>>,
    joint_order: &[String],
) {
    let jointed = JOINTED_KEYS.contains(&key);
    for (idx, value) in values.enumerate() {
        let Some(v) = value else { continue };
        let name = if jointed {
            format!("{}.{}", key, joint_name(joint_order, idx))
        } else {
            format!("{}[{}]", key, idx)
        };
        out.insert(name, v);
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// All numeric values of one record, keyed by series name.
pub fn extract_series(record: &TelemetryRecord) -> BTreeMap<String, f64> {
    let joints = record.joint_order.as_slice();
    let mut out = BTreeMap::new();

    out.insert("timestamp".to_string(), record.timestamp);
    push_array(
        &mut out,
        "joint_angles",
        record.joint_angles.iter().copied().map(Some),
        joints,
    );
    push_array(
        &mut out,
        "joint_velocities",
        record.joint_velocities.iter().copied().map(Some),
        joints,
    );

    for (key, value) in &record.extra {
        match value {
            Value::Number(_) => {
                if let Some(v) = as_number(value) {
                    out.insert(key.clone(), v);
                }
            }
            Value::Array(items) => push_array(&mut out, key, items.iter().map(as_number), joints),
            Value::Object(members) => {
                for (sub, v) in members {
                    if let Some(v) = as_number(v) {
                        out.insert(format!("{}.{}", key, sub), v);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Group records into per-name series, shifting x by `step_offset`.
///
/// Points are ordered by x; records sharing a step keep their input order.
pub fn collect_named_series(
    records: &[IndexedRecord],
    step_offset: i64,
) -> BTreeMap<String, SeriesPoints> {
    let mut points: BTreeMap<String, Vec<(i64, f64)>> = BTreeMap::new();
    for indexed in records {
        let x = indexed.record.step_id.saturating_add(step_offset);
        for (name, y) in extract_series(&indexed.record) {
            points.entry(name).or_default().push((x, y));
        }
    }

    points
        .into_iter()
        .map(|(name, mut pts)| {
            pts.sort_by_key(|(x, _)| *x);
            let (x, y) = pts.into_iter().unzip();
            (name, SeriesPoints { x, y })
        })
        .collect()
}
