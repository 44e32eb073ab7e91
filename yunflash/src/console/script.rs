//! Send/expect transactions.
//!
//! A [`Transaction`] is an ordered list of steps run against a [`Console`]:
//! lines to send and pattern sets to wait for. Every expectation within the
//! transaction gets the same timeout budget. On failure the output consumed
//! so far is returned alongside the error so callers can show what the
//! device actually printed.

use std::time::Duration;

use super::{Console, ExpectMatch, ExpectPattern};
use crate::Error;

/// One step of a console transaction.
#[derive(Debug, Clone)]
pub enum Step {
    /// Send a line to the device. A newline is appended on the wire.
    Send(String),
    /// Wait until one of the patterns matches device output.
    Expect(Vec<ExpectPattern>),
}

impl Step {
    /// Convenience constructor for a [`Step::Send`].
    pub fn send(line: impl Into<String>) -> Self {
        Self::Send(line.into())
    }

    /// Convenience constructor for a single-pattern [`Step::Expect`].
    #[must_use]
    pub fn expect(pattern: ExpectPattern) -> Self {
        Self::Expect(vec![pattern])
    }

    /// Convenience constructor for a multi-pattern [`Step::Expect`].
    #[must_use]
    pub fn expect_any(patterns: Vec<ExpectPattern>) -> Self {
        Self::Expect(patterns)
    }
}

/// A scripted exchange with the device.
#[derive(Debug, Clone)]
pub struct Transaction {
    steps: Vec<Step>,
    timeout: Duration,
}

/// Everything a completed transaction produced.
#[derive(Debug, Default)]
pub struct TransactionOutput {
    matches: Vec<ExpectMatch>,
    output: String,
}

impl TransactionOutput {
    /// All pattern matches, in the order the expectations ran.
    #[must_use]
    pub fn matches(&self) -> &[ExpectMatch] {
        &self.matches
    }

    /// The first match produced by the pattern named `name`.
    #[must_use]
    pub fn match_for(&self, name: &str) -> Option<&ExpectMatch> {
        self.matches.iter().find(|m| m.pattern() == name)
    }

    /// Shorthand for looking up a capture group on a named match.
    #[must_use]
    pub fn group_for(&self, pattern: &str, group: &str) -> Option<&str> {
        self.match_for(pattern).and_then(|m| m.group(group))
    }

    /// All device output consumed while the transaction ran.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }
}

/// A failed transaction, carrying the output consumed before the failure.
///
/// Output the device printed during the failing step itself is left buffered
/// in the console, so the caller decides whether to drain it for diagnostics
/// or let a later exchange match against it.
#[derive(Debug)]
pub struct TransactionError {
    /// Device output consumed by the steps that succeeded.
    pub output: String,
    /// What went wrong.
    pub source: Error,
}

impl Transaction {
    /// Builds a transaction whose expectations each get `timeout`.
    #[must_use]
    pub fn new(steps: Vec<Step>, timeout: Duration) -> Self {
        Self { steps, timeout }
    }

    /// Runs every step in order against `console`.
    pub fn run<C: Console + ?Sized>(
        &self,
        console: &mut C,
    ) -> std::result::Result<TransactionOutput, TransactionError> {
        let mut result = TransactionOutput::default();
        for step in &self.steps {
            match step {
                Step::Send(line) => {
                    if let Err(source) = console.send(&format!("{line}\n")) {
                        return Err(TransactionError {
                            output: result.output,
                            source,
                        });
                    }
                }
                Step::Expect(patterns) => match console.expect(patterns, self.timeout) {
                    Ok(matched) => {
                        result.output.push_str(matched.consumed());
                        result.matches.push(matched);
                    }
                    Err(source) => {
                        return Err(TransactionError {
                            output: result.output,
                            source,
                        });
                    }
                },
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::testing::ScriptedConsole;

    #[test]
    fn runs_steps_in_order_and_collects_matches() {
        let mut console = ScriptedConsole::new();
        console.reply_with("printenv", "baudrate=115200\r\narduino> ");

        let transaction = Transaction::new(
            vec![
                Step::send("printenv"),
                Step::expect(ExpectPattern::new("prompt", r"(?P<shell>[0-9a-zA-Z]+)>").unwrap()),
            ],
            Duration::from_secs(1),
        );
        let output = transaction.run(&mut console).unwrap();
        assert_eq!(console.sent(), ["printenv\n"]);
        assert_eq!(output.group_for("prompt", "shell"), Some("arduino"));
        assert!(output.output().contains("baudrate=115200"));
    }

    #[test]
    fn failure_keeps_unmatched_output_buffered() {
        let mut console = ScriptedConsole::new();
        console.reply_with("version", "U-Boot 1.1.4\r\narduino> Loading kernel...");

        let transaction = Transaction::new(
            vec![
                Step::send("version"),
                Step::expect(ExpectPattern::literal("prompt", "arduino>").unwrap()),
                Step::expect(ExpectPattern::literal("done", "done.").unwrap()),
            ],
            Duration::from_secs(1),
        );
        let err = transaction.run(&mut console).unwrap_err();
        assert!(matches!(err.source, Error::Timeout(_)));
        assert!(err.output.contains("U-Boot 1.1.4"));
        // The output of the failing step stays in the console.
        assert!(console.drain_output().contains("Loading kernel"));
    }

    #[test]
    fn later_expect_sees_only_unconsumed_output() {
        let mut console = ScriptedConsole::new();
        console.reply_with("printenv", "serverip=10.0.0.1\r\nipaddr=10.0.0.2\r\nlinino> ");

        let transaction = Transaction::new(
            vec![
                Step::send("printenv"),
                Step::expect(
                    ExpectPattern::new("serverip", r"serverip=(?P<value>\S+)").unwrap(),
                ),
                Step::expect(ExpectPattern::new("ipaddr", r"ipaddr=(?P<value>\S+)").unwrap()),
            ],
            Duration::from_secs(1),
        );
        let output = transaction.run(&mut console).unwrap();
        assert_eq!(output.group_for("serverip", "value"), Some("10.0.0.1"));
        assert_eq!(output.group_for("ipaddr", "value"), Some("10.0.0.2"));
    }
}
