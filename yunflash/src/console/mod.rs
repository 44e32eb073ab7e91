//! Expect-style automation over a serial console.
//!
//! A [`ConsoleSession`] owns a serial port and a growing text buffer. Device
//! output is appended to the buffer as it arrives; [`Console::expect`] scans
//! the buffer for a set of named regular expressions and consumes everything
//! up to and including the first match. Text consumed by a match is gone, so
//! successive expectations always look at fresh output.
//!
//! The [`Console`] trait is the seam for tests: the flashing engine is
//! written against the trait and exercised with a scripted double instead of
//! real hardware.

mod script;
#[cfg(test)]
pub(crate) mod testing;

pub use script::{Step, Transaction, TransactionError, TransactionOutput};

use std::io::Read;
use std::time::{Duration, Instant};

use log::{debug, trace};
use regex::Regex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::{Error, Result, is_interrupted_requested};

/// Baud rate of the bridge console exposed by the serial agent sketch.
pub const AGENT_BAUD: u32 = 115_200;

/// How long a single blocking read on the port may stall before the expect
/// loop re-checks its deadline and the interrupt flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A named regular expression the console can wait for.
///
/// The name identifies the pattern in logs, timeout errors and
/// [`TransactionOutput::match_for`] lookups. Dynamic values captured from
/// device output are exposed through named capture groups only.
#[derive(Debug, Clone)]
pub struct ExpectPattern {
    name: &'static str,
    regex: Regex,
}

impl ExpectPattern {
    /// Compiles `pattern` as a regular expression.
    pub fn new(name: &'static str, pattern: &str) -> Result<Self> {
        Ok(Self {
            name,
            regex: Regex::new(pattern)?,
        })
    }

    /// Builds a pattern that matches `text` verbatim.
    pub fn literal(name: &'static str, text: &str) -> Result<Self> {
        Self::new(name, &regex::escape(text))
    }

    /// The identifier this pattern was registered under.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The outcome of a successful [`Console::expect`] call.
#[derive(Debug, Clone)]
pub struct ExpectMatch {
    pattern: &'static str,
    text: String,
    groups: Vec<(String, String)>,
    consumed: String,
}

impl ExpectMatch {
    /// Name of the [`ExpectPattern`] that matched.
    #[must_use]
    pub fn pattern(&self) -> &'static str {
        self.pattern
    }

    /// The full text matched by the pattern.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Value of a named capture group, if the group participated in the
    /// match.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(group, _)| group == name)
            .map(|(_, value)| value.as_str())
    }

    /// Everything consumed from the buffer by this match, including the
    /// matched text itself. Useful for diagnostics.
    #[must_use]
    pub fn consumed(&self) -> &str {
        &self.consumed
    }
}

/// Scans `buffer` for the first pattern that matches, in declaration order.
///
/// Returns the byte offset just past the match (the amount of buffer to
/// consume) together with the match description.
pub(crate) fn find_match(
    buffer: &str,
    patterns: &[ExpectPattern],
) -> Option<(usize, ExpectMatch)> {
    for pattern in patterns {
        if let Some(captures) = pattern.regex.captures(buffer) {
            let overall = captures.get(0)?;
            let groups = pattern
                .regex
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|value| (name.to_string(), value.as_str().to_string()))
                })
                .collect();
            let end = overall.end();
            return Some((
                end,
                ExpectMatch {
                    pattern: pattern.name,
                    text: overall.as_str().to_string(),
                    groups,
                    consumed: buffer[..end].to_string(),
                },
            ));
        }
    }
    None
}

fn pattern_names(patterns: &[ExpectPattern]) -> String {
    patterns
        .iter()
        .map(ExpectPattern::name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Something that behaves like an interactive serial console.
pub trait Console {
    /// Writes `text` to the device exactly as given.
    fn send(&mut self, text: &str) -> Result<()>;

    /// Waits until one of `patterns` matches buffered device output.
    ///
    /// Output up to and including the match is consumed. Patterns are tried
    /// in order on every new chunk of output, so an earlier pattern wins when
    /// several could match.
    fn expect(&mut self, patterns: &[ExpectPattern], timeout: Duration) -> Result<ExpectMatch>;

    /// Takes whatever unmatched output is currently buffered.
    fn drain_output(&mut self) -> String;

    /// Gives the device time to finish printing between exchanges.
    fn settle(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A live expect session over a serial port.
///
/// The underlying port handle is released when the session is dropped.
pub struct ConsoleSession {
    port: Box<dyn SerialPort>,
    port_name: String,
    /// Raw bytes read from the port that do not yet form complete UTF-8.
    pending: Vec<u8>,
    /// Decoded device output not yet consumed by a match.
    buffer: String,
}

impl ConsoleSession {
    /// Opens `port_name` at `baud` with the 8N1 framing U-Boot consoles use.
    pub fn open(port_name: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud)
            .timeout(POLL_INTERVAL)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;
        debug!("opened console on {port_name} at {baud} baud");
        Ok(Self {
            port,
            port_name: port_name.to_string(),
            pending: Vec::new(),
            buffer: String::new(),
        })
    }

    /// Name of the port this session talks to.
    #[must_use]
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Reads one chunk from the port into the text buffer.
    ///
    /// Returns `true` if new text arrived. A read timeout is not an error, it
    /// just means the device was quiet for one poll interval.
    fn pump(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 1024];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                let text = drain_utf8_lossy(&mut self.pending);
                if text.is_empty() {
                    return Ok(false);
                }
                trace!("<- {text:?}");
                self.buffer.push_str(&text);
                Ok(true)
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(false)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Console for ConsoleSession {
    fn send(&mut self, text: &str) -> Result<()> {
        trace!("-> {text:?}");
        self.port.write_all(text.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn expect(&mut self, patterns: &[ExpectPattern], timeout: Duration) -> Result<ExpectMatch> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((end, matched)) = find_match(&self.buffer, patterns) {
                trace!("matched {:?}: {:?}", matched.pattern(), matched.text());
                self.buffer.drain(..end);
                return Ok(matched);
            }
            if is_interrupted_requested() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "interrupted by user",
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(pattern_names(patterns)));
            }
            self.pump()?;
        }
    }

    fn drain_output(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

/// Drains all complete UTF-8 from `buf`, leaving a trailing incomplete
/// sequence (if any) in place for the next read to finish.
fn drain_utf8_lossy(buf: &mut Vec<u8>) -> String {
    if buf.is_empty() {
        return String::new();
    }
    let keep = incomplete_suffix_len(buf);
    let take = buf.len() - keep;
    let out = String::from_utf8_lossy(&buf[..take]).into_owned();
    buf.drain(..take);
    out
}

/// Length of a trailing byte sequence that could still become valid UTF-8
/// once more bytes arrive. Invalid sequences are not protected; they get
/// replaced by `drain_utf8_lossy`.
fn incomplete_suffix_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=3.min(len) {
        let byte = buf[len - back];
        if byte & 0b1100_0000 == 0b1100_0000 {
            // Found a leading byte `back` positions from the end.
            let need = if byte & 0b1110_0000 == 0b1100_0000 {
                2
            } else if byte & 0b1111_0000 == 0b1110_0000 {
                3
            } else if byte & 0b1111_1000 == 0b1111_0000 {
                4
            } else {
                return 0;
            };
            return if need > back { back } else { 0 };
        }
        if byte & 0b1100_0000 != 0b1000_0000 {
            // ASCII or stray byte, nothing to wait for.
            return 0;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> ExpectPattern {
        ExpectPattern::new("prompt", r"(?P<shell>[0-9a-zA-Z]+)>").unwrap()
    }

    #[test]
    fn match_consumes_through_end() {
        let buffer = "U-Boot 1.1.4\r\narduino> tail";
        let (end, matched) = find_match(buffer, &[prompt()]).unwrap();
        assert_eq!(&buffer[end..], " tail");
        assert_eq!(matched.text(), "arduino>");
        assert_eq!(matched.group("shell"), Some("arduino"));
        assert!(matched.consumed().starts_with("U-Boot"));
    }

    #[test]
    fn earlier_pattern_wins() {
        let banners = [
            ExpectPattern::literal("autoboot", "autoboot in").unwrap(),
            prompt(),
        ];
        let (_, matched) = find_match("autoboot in 4 seconds\r\nlinino>", &banners).unwrap();
        assert_eq!(matched.pattern(), "autoboot");
    }

    #[test]
    fn absent_group_is_none() {
        let pattern =
            ExpectPattern::new("stop", r"stop with '(?P<keyword>[a-z]*)'").unwrap();
        let (_, matched) = find_match("stop with ''", &[pattern]).unwrap();
        assert_eq!(matched.group("keyword"), Some(""));
        assert_eq!(matched.group("missing"), None);
    }

    #[test]
    fn no_match_returns_none() {
        assert!(find_match("Loading: T T T", &[prompt()]).is_none());
    }

    #[test]
    fn literal_escapes_metacharacters() {
        let pattern = ExpectPattern::literal("ip", "serverip=10.0.1.2").unwrap();
        assert!(find_match("serverip=10a0b1c2", &[pattern.clone()]).is_none());
        assert!(find_match("serverip=10.0.1.2\r\n", &[pattern]).is_some());
    }

    #[test]
    fn drain_keeps_incomplete_utf8_tail() {
        // "é" is 0xC3 0xA9; give only the first byte.
        let mut buf = b"abc\xc3".to_vec();
        assert_eq!(drain_utf8_lossy(&mut buf), "abc");
        assert_eq!(buf, vec![0xc3]);
        buf.push(0xa9);
        assert_eq!(drain_utf8_lossy(&mut buf), "é");
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_replaces_invalid_bytes() {
        let mut buf = vec![0xff, b'o', b'k'];
        assert_eq!(drain_utf8_lossy(&mut buf), "\u{fffd}ok");
        assert!(buf.is_empty());
    }
}
