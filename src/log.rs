//! Verifier log (§6 Output): free-form UTF-8 trace output at one of three
//! verbosity levels, mirroring `fuel-vm`'s structured `tracing` output but
//! addressed as its own buffer since consumers (bpftool et al.) expect a
//! flat log string rather than a subscriber.

use std::fmt::Write as _;

/// Verbosity level requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// No logging at all.
    Off,
    /// One line per rejected or accepted instruction.
    Basic,
    /// `Basic` plus a full per-register/per-stack-slot state dump at every
    /// recorded join point.
    Verbose,
}

/// Accumulates the verifier's trace as a single buffer, truncated at a
/// fixed cap so a pathological program can't OOM the caller (§6: "bounded
/// log buffer").
pub struct VerifierLog {
    level: LogLevel,
    buf: String,
    cap: usize,
    truncated: bool,
}

/// Default cap on the log buffer, matching the reference implementation's
/// `BPF_LOG_BUF` default.
pub const DEFAULT_LOG_CAP: usize = 64 * 1024;

impl VerifierLog {
    pub fn new(level: LogLevel) -> Self {
        VerifierLog { level, buf: String::new(), cap: DEFAULT_LOG_CAP, truncated: false }
    }

    pub fn with_capacity(level: LogLevel, cap: usize) -> Self {
        VerifierLog { level, buf: String::new(), cap, truncated: false }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn push(&mut self, line: &str) {
        if self.buf.len() + line.len() + 1 > self.cap {
            self.truncated = true;
            return;
        }
        self.buf.push_str(line);
        self.buf.push('\n');
    }

    /// Emit at [`LogLevel::Basic`] or above.
    pub fn basic(&mut self, args: std::fmt::Arguments<'_>) {
        if self.level >= LogLevel::Basic {
            let mut line = String::new();
            let _ = line.write_fmt(args);
            self.push(&line);
        }
    }

    /// Emit at [`LogLevel::Verbose`] only.
    pub fn verbose(&mut self, args: std::fmt::Arguments<'_>) {
        if self.level >= LogLevel::Verbose {
            let mut line = String::new();
            let _ = line.write_fmt(args);
            self.push(&line);
        }
    }

    /// One line describing an instruction's register/stack-slot state, used
    /// at [`LogLevel::Verbose`] join points (§6).
    pub fn trace_register(&mut self, insn_idx: usize, reg_id: u8, kind: &str) {
        if self.level >= LogLevel::Verbose {
            let line = format!("{insn_idx}: R{reg_id}={kind}");
            self.push(&line);
        }
    }
}

impl Default for VerifierLog {
    fn default() -> Self {
        VerifierLog::new(LogLevel::Off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_level_emits_nothing() {
        let mut log = VerifierLog::new(LogLevel::Off);
        log.basic(format_args!("insn 0: accepted"));
        assert_eq!(log.as_str(), "");
    }

    #[test]
    fn basic_level_records_basic_lines_only() {
        let mut log = VerifierLog::new(LogLevel::Basic);
        log.basic(format_args!("insn 0: accepted"));
        log.verbose(format_args!("R0=scalar"));
        assert_eq!(log.as_str(), "insn 0: accepted\n");
    }

    #[test]
    fn buffer_truncates_past_cap() {
        let mut log = VerifierLog::with_capacity(LogLevel::Basic, 8);
        log.basic(format_args!("0123456789"));
        assert!(log.truncated());
        assert_eq!(log.as_str(), "");
    }
}
