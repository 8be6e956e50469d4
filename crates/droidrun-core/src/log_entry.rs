//! Logcat line parsing
//!
//! The device log stream arrives in `brief` format, one entry per line:
//! `<SEV>/<source>(<pid>): <message>`. Parsing is pure; classification of
//! entries (process lifecycle, crash signals, console echo) happens in the
//! device crate.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Severity of a single log entry
///
/// Warning and above belong on the error stream when a sketch's console
/// output is echoed back to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'V' => Some(Severity::Verbose),
            'D' => Some(Severity::Debug),
            'I' => Some(Severity::Info),
            'W' => Some(Severity::Warning),
            'E' => Some(Severity::Error),
            'F' => Some(Severity::Fatal),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Severity::Verbose => 'V',
            Severity::Debug => 'D',
            Severity::Info => 'I',
            Severity::Warning => 'W',
            Severity::Error => 'E',
            Severity::Fatal => 'F',
        }
    }

    /// Whether console output at this severity is echoed to stderr
    pub fn uses_error_stream(&self) -> bool {
        matches!(self, Severity::Warning | Severity::Error | Severity::Fatal)
    }
}

/// One parsed line of device log output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub severity: Severity,
    /// Source tag, e.g. "ActivityManager" or "System.out"
    pub source: String,
    /// Process id the line was emitted by
    pub pid: u32,
    pub message: String,
}

// I/ActivityManager(  585): Start proc 29318:sketchbook.test001/u0a403 ...
static PARSER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([VDIWEF])/([^\(\s]+)\s*\(\s*(\d+)\): (.+)$").expect("invalid log entry regex")
});

impl LogEntry {
    /// Parse one raw logcat line.
    ///
    /// Device vendors inject all sorts of non-conforming lines into the
    /// stream, so a mismatch is a recoverable [`Error::LogParse`] -- callers
    /// skip the line and keep draining.
    pub fn parse(line: &str) -> Result<Self> {
        let caps = PARSER
            .captures(line)
            .ok_or_else(|| Error::log_parse(line))?;

        let sev_char = caps[1].chars().next().ok_or_else(|| Error::log_parse(line))?;
        let severity = Severity::from_char(sev_char).ok_or_else(|| Error::log_parse(line))?;
        let pid = caps[3].parse().map_err(|_| Error::log_parse(line))?;

        Ok(LogEntry {
            severity,
            source: caps[2].to_string(),
            pid,
            message: caps[4].to_string(),
        })
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}({}): {}",
            self.severity.as_char(),
            self.source,
            self.pid,
            self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_entry() {
        let entry = LogEntry::parse("I/MyApp(1234): hello").unwrap();
        assert_eq!(entry.severity, Severity::Info);
        assert_eq!(entry.source, "MyApp");
        assert_eq!(entry.pid, 1234);
        assert_eq!(entry.message, "hello");
    }

    #[test]
    fn test_parse_padded_pid() {
        // logcat pads the pid column with spaces
        let entry = LogEntry::parse("E/AndroidRuntime(  648): FATAL EXCEPTION: main").unwrap();
        assert_eq!(entry.severity, Severity::Error);
        assert_eq!(entry.source, "AndroidRuntime");
        assert_eq!(entry.pid, 648);
        assert_eq!(entry.message, "FATAL EXCEPTION: main");
    }

    #[test]
    fn test_parse_all_severities() {
        for (c, sev) in [
            ('V', Severity::Verbose),
            ('D', Severity::Debug),
            ('I', Severity::Info),
            ('W', Severity::Warning),
            ('E', Severity::Error),
            ('F', Severity::Fatal),
        ] {
            let line = format!("{}/Tag(1): msg", c);
            assert_eq!(LogEntry::parse(&line).unwrap().severity, sev);
        }
    }

    #[test]
    fn test_parse_message_with_colons() {
        let entry = LogEntry::parse("I/Process ( 9213): Sending signal. PID: 9213 SIG: 9").unwrap();
        assert_eq!(entry.source, "Process");
        assert_eq!(entry.pid, 9213);
        assert_eq!(entry.message, "Sending signal. PID: 9213 SIG: 9");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            LogEntry::parse("--------- beginning of main"),
            Err(Error::LogParse { .. })
        ));
        assert!(LogEntry::parse("").is_err());
        assert!(LogEntry::parse("X/Tag(1): unknown severity").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_message() {
        assert!(LogEntry::parse("I/Tag(1): ").is_err());
    }

    #[test]
    fn test_error_stream_classification() {
        assert!(!Severity::Verbose.uses_error_stream());
        assert!(!Severity::Debug.uses_error_stream());
        assert!(!Severity::Info.uses_error_stream());
        assert!(Severity::Warning.uses_error_stream());
        assert!(Severity::Error.uses_error_stream());
        assert!(Severity::Fatal.uses_error_stream());
    }

    #[test]
    fn test_display_round_trip() {
        let entry = LogEntry::parse("W/System.err(555): something bad").unwrap();
        assert_eq!(entry.to_string(), "W/System.err(555): something bad");
    }
}
