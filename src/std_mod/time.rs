use once_cell::sync::Lazy;
use std::time::Instant;

use crate::objects::object_native_function::NativeObject;
use crate::value::Value;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// The `clock()` native: seconds elapsed since the VM started, as a number.
pub struct ClockTime;

impl ClockTime {
    pub fn new() -> ClockTime {
        // Pin the epoch at registration, not at the first call.
        Lazy::force(&PROCESS_START);
        ClockTime
    }
}

impl NativeObject for ClockTime {
    fn call(&self, _args: &[Value]) -> Result<Value, String> {
        Ok(Value::Number(PROCESS_START.elapsed().as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = ClockTime::new();
        let first = match clock.call(&[]) {
            Ok(Value::Number(seconds)) => seconds,
            other => panic!("clock() returned {:?}", other),
        };
        let second = match clock.call(&[]) {
            Ok(Value::Number(seconds)) => seconds,
            other => panic!("clock() returned {:?}", other),
        };
        assert!(second >= first);
        assert!(first >= 0.0);
    }
}
