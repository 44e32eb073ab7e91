//! Tracking a board across USB re-enumeration.
//!
//! Resetting an ATmega32U4 into its bootloader makes the CDC serial port
//! vanish and a different one appear a moment later, often under a new name.
//! This module snapshots the system port list, provokes the reset with the
//! 1200 bps touch, and watches the list until the replacement port shows up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::{Result, is_interrupted_requested};

/// Opening a CDC port at this baud rate and dropping DTR asks the sketch to
/// reboot into the bootloader.
pub const TOUCH_BAUD: u32 = 1200;

/// How long DTR is held low during the touch.
const TOUCH_HOLD: Duration = Duration::from_millis(200);

/// Delay between port-list polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period after the new port appears, so the OS finishes setting it up
/// before anyone opens it.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Names of every serial port currently known to the system.
///
/// Enumeration failures are treated as an empty list; transient errors while
/// a device re-enumerates are expected and resolve on the next poll.
#[must_use]
pub fn list_port_names() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

fn count_of(list: &[String], name: &str) -> usize {
    list.iter().filter(|n| n.as_str() == name).count()
}

/// First element of `a` that `b` is missing, counting duplicates.
fn missing_from(a: &[String], b: &[String]) -> Option<String> {
    a.iter()
        .find(|name| count_of(a, name) > count_of(b, name))
        .cloned()
}

/// The single port name by which two snapshots differ.
///
/// Works on multisets, so duplicate entries cancel out instead of confusing
/// the comparison. A name missing from `after` is reported before a name
/// missing from `before`. Identical snapshots yield `None`.
#[must_use]
pub fn diff_single(before: &[String], after: &[String]) -> Option<String> {
    missing_from(before, after).or_else(|| missing_from(after, before))
}

/// Waits for the board to drop off the bus and come back.
///
/// Watches the system port list, starting from the `before` snapshot, for a
/// disappearance followed by an appearance and returns the name of the port
/// that appeared. If `timeout` elapses first (or the run is interrupted) the
/// board is assumed to still be reachable as `original_port`.
#[must_use]
pub fn watch_for_change(before: &[String], original_port: &str, timeout: Duration) -> String {
    watch_with(before, original_port, timeout, list_port_names)
}

fn watch_with<F>(before: &[String], original_port: &str, timeout: Duration, mut list: F) -> String
where
    F: FnMut() -> Vec<String>,
{
    let expired = Arc::new(AtomicBool::new(false));
    {
        let expired = Arc::clone(&expired);
        thread::spawn(move || {
            thread::sleep(timeout);
            expired.store(true, Ordering::SeqCst);
        });
    }
    let gave_up = |expired: &AtomicBool| expired.load(Ordering::SeqCst) || is_interrupted_requested();

    // Phase one: the old port detaches.
    loop {
        if let Some(gone) = missing_from(before, &list()) {
            debug!("port {gone} detached");
            break;
        }
        if gave_up(&expired) {
            debug!("no port detached within the timeout");
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    // Phase two: a port attaches, relative to a fresh snapshot.
    let baseline = list();
    loop {
        if let Some(appeared) = missing_from(&list(), &baseline) {
            info!("board re-enumerated as {appeared}");
            thread::sleep(SETTLE_DELAY);
            return appeared;
        }
        if gave_up(&expired) {
            warn!("gave up waiting for the board to re-enumerate; assuming {original_port}");
            return original_port.to_string();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Asks the sketch on `port_name` to reboot into the bootloader.
///
/// The port is opened at 1200 bps with DTR deasserted, held briefly, then
/// closed. The board reacts by dropping off the bus.
pub fn touch_at_1200bps(port_name: &str) -> Result<()> {
    debug!("touching {port_name} at {TOUCH_BAUD} baud");
    let mut port = serialport::new(port_name, TOUCH_BAUD).open()?;
    port.write_data_terminal_ready(false)?;
    thread::sleep(TOUCH_HOLD);
    Ok(())
}

/// Touch-resets the board and reports the port it comes back on.
pub fn reset_into_bootloader(port_name: &str, timeout: Duration) -> Result<String> {
    let before = list_port_names();
    touch_at_1200bps(port_name)?;
    Ok(watch_for_change(&before, port_name, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn diff_finds_appeared_port() {
        let before = names(&["/dev/ttyACM0", "/dev/ttyUSB0"]);
        let after = names(&["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyACM1"]);
        assert_eq!(diff_single(&before, &after).as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn diff_finds_disappeared_port() {
        let before = names(&["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0"]);
        let after = names(&["/dev/ttyACM0", "/dev/ttyUSB0"]);
        assert_eq!(diff_single(&before, &after).as_deref(), Some("/dev/ttyACM1"));
    }

    #[test]
    fn diff_of_identical_lists_is_none() {
        let list = names(&["/dev/ttyACM0", "/dev/ttyACM0", "/dev/ttyUSB0"]);
        assert_eq!(diff_single(&list, &list), None);
        assert_eq!(diff_single(&[], &[]), None);
    }

    #[test]
    fn diff_counts_duplicates() {
        let before = names(&["/dev/ttyACM0", "/dev/ttyACM0"]);
        let after = names(&["/dev/ttyACM0"]);
        assert_eq!(diff_single(&before, &after).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(diff_single(&after, &before).as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn watch_falls_back_to_original_on_timeout() {
        let stuck = names(&["/dev/ttyACM0"]);
        let started = Instant::now();
        let port = watch_with(
            &stuck.clone(),
            "/dev/ttyACM0",
            Duration::from_millis(200),
            move || stuck.clone(),
        );
        assert_eq!(port, "/dev/ttyACM0");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn watch_reports_newly_appeared_port() {
        let mut polls = 0u32;
        let port = watch_with(
            &names(&["/dev/ttyACM0", "/dev/ttyACM1"]),
            "/dev/ttyACM1",
            Duration::from_secs(5),
            move || {
                polls += 1;
                match polls {
                    // Board still attached, then gone, then back as ACM2.
                    1 => names(&["/dev/ttyACM0", "/dev/ttyACM1"]),
                    2..=4 => names(&["/dev/ttyACM0"]),
                    _ => names(&["/dev/ttyACM0", "/dev/ttyACM2"]),
                }
            },
        );
        assert_eq!(port, "/dev/ttyACM2");
    }
}
