//! Last-resort channel for failures on the capture write path.
//!
//! Writes go straight to the process stderr handle. Nothing here may call
//! `tracing` or capture, or a failing store would feed itself. Reports are
//! best effort: if stderr is gone too, the report is dropped.

use std::fmt::Display;
use std::io::Write;

pub fn report(operation: &str, err: &dyn Display) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", format_report(operation, err));
}

pub fn format_report(operation: &str, err: &dyn Display) -> String {
    format!("hostlink capture: {operation} failed: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_format_names_operation() {
        assert_eq!(
            format_report("side_channel_put", &"disk full"),
            "hostlink capture: side_channel_put failed: disk full"
        );
        report("side_channel_put", &"disk full");
    }
}
