//! Report envelope exchanged between a child and the parent.
//!
//! A child sends exactly one report, tagged with its own pid, as a wire
//! [`Value::Object`]. Optional fields are encoded as `Null`, durations as
//! fractional seconds and timestamps as microseconds since the epoch.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use nix::unistd::Pid;

use crate::wire::{Value, WireError};
use crate::work::Outcome;

const ID: &str = "id";
const NAME: &str = "name";
const PARENT_PID: &str = "parent_pid";
const PID: &str = "pid";
const EXIT_CODE: &str = "exit_code";
const SUCCESS: &str = "success";
const ERROR: &str = "error";
const RESULT: &str = "result";
const DURATION: &str = "duration";
const MEMORY_USAGE: &str = "memory_usage";
const TIMEOUT: &str = "timeout";
const STARTED_AT: &str = "started_at";

/// Channel tag a child reports under.
pub fn report_tag(pid: Pid) -> i64 {
    i64::from(pid.as_raw())
}

/// Encode an outcome as a report.
pub fn to_value(outcome: &Outcome) -> Value {
    let pid = |p: Option<Pid>| p.map(|p| Value::Int(i64::from(p.as_raw())));
    let mut fields = BTreeMap::new();
    fields.insert(ID.into(), outcome.id.map(|id| id as i64).into());
    fields.insert(NAME.into(), outcome.name.clone().into());
    fields.insert(PARENT_PID.into(), pid(outcome.parent_pid).into());
    fields.insert(PID.into(), pid(outcome.pid).into());
    fields.insert(EXIT_CODE.into(), outcome.exit_code.into());
    fields.insert(SUCCESS.into(), outcome.success.into());
    fields.insert(ERROR.into(), outcome.error.clone().into());
    fields.insert(RESULT.into(), outcome.result.clone());
    fields.insert(DURATION.into(), outcome.duration.as_secs_f64().into());
    fields.insert(
        MEMORY_USAGE.into(),
        Value::Int(i64::try_from(outcome.memory_usage).unwrap_or(i64::MAX)),
    );
    fields.insert(TIMEOUT.into(), outcome.timeout.map(|t| t.as_secs_f64()).into());
    fields.insert(
        STARTED_AT.into(),
        outcome.started_at.map(|t| t.timestamp_micros()).into(),
    );
    Value::Object(fields)
}

/// Decode a report back into an outcome.
pub fn from_value(value: Value) -> Result<Outcome, WireError> {
    let Value::Object(mut fields) = value else {
        return Err(malformed("report is not an object"));
    };
    let mut take = |key: &'static str| fields.remove(key).unwrap_or(Value::Null);

    let name = match take(NAME) {
        Value::String(s) => s,
        Value::Null => String::new(),
        _ => return Err(malformed("name is not a string")),
    };
    let mut outcome = Outcome::new(name);

    outcome.id = optional_int(take(ID), ID)?
        .map(|id| usize::try_from(id).map_err(|_| malformed("id is negative")))
        .transpose()?;
    outcome.parent_pid = optional_pid(take(PARENT_PID), PARENT_PID)?;
    outcome.pid = optional_pid(take(PID), PID)?;
    outcome.exit_code = optional_int(take(EXIT_CODE), EXIT_CODE)?
        .map(|code| i32::try_from(code).map_err(|_| malformed("exit_code out of range")))
        .transpose()?;
    outcome.success = take(SUCCESS)
        .as_bool()
        .ok_or_else(|| malformed("success is not a bool"))?;
    outcome.error = match take(ERROR) {
        Value::Null => None,
        Value::String(s) => Some(s),
        _ => return Err(malformed("error is not a string")),
    };
    outcome.result = take(RESULT);
    outcome.duration = seconds(take(DURATION), DURATION)?.unwrap_or_default();
    outcome.memory_usage = optional_int(take(MEMORY_USAGE), MEMORY_USAGE)?
        .map_or(0, |m| m.max(0) as u64);
    outcome.timeout = seconds(take(TIMEOUT), TIMEOUT)?;
    outcome.started_at = optional_int(take(STARTED_AT), STARTED_AT)?
        .map(|micros| {
            DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| malformed("started_at out of range"))
        })
        .transpose()?;

    Ok(outcome)
}

fn malformed(reason: &str) -> WireError {
    WireError::Malformed(reason.to_string())
}

fn optional_int(value: Value, field: &str) -> Result<Option<i64>, WireError> {
    match value {
        Value::Null => Ok(None),
        Value::Int(i) => Ok(Some(i)),
        _ => Err(malformed(&format!("{} is not an integer", field))),
    }
}

fn optional_pid(value: Value, field: &str) -> Result<Option<Pid>, WireError> {
    optional_int(value, field)?
        .map(|raw| {
            i32::try_from(raw)
                .map(Pid::from_raw)
                .map_err(|_| malformed(&format!("{} out of range", field)))
        })
        .transpose()
}

fn seconds(value: Value, field: &str) -> Result<Option<Duration>, WireError> {
    match value {
        Value::Null => Ok(None),
        other => {
            let secs = other
                .as_f64()
                .ok_or_else(|| malformed(&format!("{} is not a number", field)))?;
            Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|_| malformed(&format!("{} out of range", field)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use chrono::Utc;

    fn sample() -> Outcome {
        let mut outcome = Outcome::new("lorem".to_string());
        outcome.id = Some(3);
        outcome.parent_pid = Some(Pid::from_raw(100));
        outcome.pid = Some(Pid::from_raw(101));
        outcome.exit_code = Some(0);
        outcome.result = Value::object([("words", 42)]);
        outcome.duration = Duration::from_millis(1250);
        outcome.memory_usage = 8 * 1024 * 1024;
        outcome.timeout = Some(Duration::from_secs(2));
        // Whole microseconds survive the trip exactly
        outcome.started_at = DateTime::from_timestamp_micros(Utc::now().timestamp_micros());
        outcome
    }

    #[test]
    fn test_report_survives_the_wire() {
        let outcome = sample();
        let bytes = wire::encode(&to_value(&outcome), true).unwrap();
        let decoded = from_value(wire::decode(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, outcome);
    }

    #[test]
    fn test_failed_report_keeps_error() {
        let mut outcome = sample();
        outcome.fail("Fatal error: boom on line 7 in file src/job.rs");
        outcome.exit_code = Some(255);
        let decoded = from_value(to_value(&outcome)).unwrap();
        assert!(!decoded.success);
        assert_eq!(decoded.error.as_deref(), outcome.error.as_deref());
        assert_eq!(decoded.exit_code, Some(255));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let report = Value::object([("success", Value::Bool(true))]);
        let outcome = from_value(report).unwrap();
        assert_eq!(outcome.pid, None);
        assert_eq!(outcome.duration, Duration::ZERO);
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn test_rejects_malformed_reports() {
        assert!(from_value(Value::Int(1)).is_err());
        assert!(from_value(Value::object([("success", "yes")])).is_err());
        assert!(
            from_value(Value::object([
                ("success", Value::Bool(true)),
                ("pid", Value::from("abc")),
            ]))
            .is_err()
        );
    }

    #[test]
    fn test_report_tag_is_pid() {
        assert_eq!(report_tag(Pid::from_raw(4321)), 4321);
    }
}
