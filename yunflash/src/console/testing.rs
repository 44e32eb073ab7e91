//! A scripted [`Console`] double for exercising flashing logic off-device.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use super::{Console, ExpectMatch, ExpectPattern, find_match, pattern_names};
use crate::{Error, Result};

/// Plays the role of a device on the far end of the console.
///
/// Replies are keyed by the exact line sent (without the trailing newline);
/// each time that line is sent the next queued reply is appended to the
/// pending output. Output the device would produce unprompted is queued with
/// [`ScriptedConsole::emit`] and surfaces once an expectation runs dry.
/// Expectations never block: when no queued output can satisfy them they
/// fail immediately with a timeout error.
#[derive(Default)]
pub(crate) struct ScriptedConsole {
    replies: HashMap<String, VecDeque<String>>,
    spontaneous: VecDeque<String>,
    buffer: String,
    sent: Vec<String>,
}

impl ScriptedConsole {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues `output` as the reply to the next send of `line`.
    pub(crate) fn reply_with(&mut self, line: &str, output: &str) {
        self.replies
            .entry(line.to_string())
            .or_default()
            .push_back(output.to_string());
    }

    /// Queues output the device produces on its own.
    pub(crate) fn emit(&mut self, output: &str) {
        self.spontaneous.push_back(output.to_string());
    }

    /// Every string passed to [`Console::send`], in order.
    pub(crate) fn sent(&self) -> &[String] {
        &self.sent
    }

    /// True if some sent line (newline stripped) equals `line`.
    pub(crate) fn sent_line(&self, line: &str) -> bool {
        self.sent
            .iter()
            .any(|s| s.trim_end_matches('\n') == line)
    }
}

impl Console for ScriptedConsole {
    fn send(&mut self, text: &str) -> Result<()> {
        self.sent.push(text.to_string());
        let line = text.trim_end_matches('\n');
        if let Some(queue) = self.replies.get_mut(line) {
            if let Some(reply) = queue.pop_front() {
                self.buffer.push_str(&reply);
            }
        }
        Ok(())
    }

    fn expect(&mut self, patterns: &[ExpectPattern], _timeout: Duration) -> Result<ExpectMatch> {
        loop {
            if let Some((end, matched)) = find_match(&self.buffer, patterns) {
                self.buffer.drain(..end);
                return Ok(matched);
            }
            match self.spontaneous.pop_front() {
                Some(output) => self.buffer.push_str(&output),
                None => return Err(Error::Timeout(pattern_names(patterns))),
            }
        }
    }

    fn drain_output(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn settle(&mut self, _duration: Duration) {}
}
