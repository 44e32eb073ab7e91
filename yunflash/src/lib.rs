//! # yunflash
//!
//! A library for unattended firmware updates of Arduino Yún family boards.
//!
//! Reflashing a Yún end to end takes four cooperating pieces, all provided
//! by this crate:
//!
//! - programming the board's ATmega32U4 with a serial bridge sketch, so the
//!   AR9331 console becomes reachable over USB
//! - serving the firmware images to the bootloader over TFTP
//! - driving the U-Boot console with expect-style transactions
//! - retrying failed attempts with freshly allocated network addresses
//!
//! ## Example
//!
//! ```rust,no_run
//! use yunflash::console::{AGENT_BAUD, ConsoleSession};
//! use yunflash::flasher::{self, SessionContext};
//! use yunflash::image::{DEFAULT_BOOTLOADER_IMAGE, DEFAULT_SYSUPGRADE_IMAGE, FirmwareImage};
//! use yunflash::programmer::{ProgrammerConfig, upload_agent};
//! use yunflash::tftp::{FirmwareServer, TFTP_PORT};
//! use yunflash::net;
//!
//! fn main() -> yunflash::Result<()> {
//!     // Stage the firmware images and start serving them.
//!     let firmware_dir = std::path::Path::new("tftp");
//!     FirmwareServer::bind(("0.0.0.0", TFTP_PORT), firmware_dir)?.spawn()?;
//!     let addresses = net::allocate_addresses(None)?;
//!
//!     // Load the serial bridge sketch, then open the console it provides.
//!     let port = upload_agent(&ProgrammerConfig::from_exe()?, "/dev/ttyACM0")?;
//!     let mut console = ConsoleSession::open(&port, AGENT_BAUD)?;
//!
//!     let mut ctx = SessionContext {
//!         server_addr: addresses.server,
//!         device_addr: addresses.device,
//!         flash_bootloader: false,
//!         target_board: "Yun".to_string(),
//!         legacy: false,
//!         bootloader_image: FirmwareImage::from_dir(firmware_dir, DEFAULT_BOOTLOADER_IMAGE)?,
//!         main_image: FirmwareImage::from_dir(firmware_dir, DEFAULT_SYSUPGRADE_IMAGE)?,
//!     };
//!
//!     flasher::run_with_retries(
//!         &mut ctx,
//!         flasher::DEFAULT_MAX_ATTEMPTS,
//!         |ctx| flasher::run_attempt(ctx, &mut console, &mut |phase| println!("{phase}")),
//!         |ctx| {
//!             let fresh = net::allocate_addresses(Some(ctx.server_addr))?;
//!             ctx.server_addr = fresh.server;
//!             ctx.device_addr = fresh.device;
//!             Ok(())
//!         },
//!     )?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod console;
pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod net;
pub mod programmer;
pub mod tftp;
pub mod tracker;
pub mod uboot;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Install a process-wide cancellation probe.
///
/// Expect loops and the retry controller poll it between steps and wind
/// down cleanly once it reports `true`; callers typically wire it to a
/// Ctrl-C flag. Only the first registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// True once the installed probe reports a pending cancellation.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Flat re-exports of the public surface.
pub use {
    console::{
        AGENT_BAUD, Console, ConsoleSession, ExpectMatch, ExpectPattern, Step, Transaction,
        TransactionError, TransactionOutput,
    },
    device::{BoardMode, DetectedPort, auto_detect_port, detect_ports, detect_yun_ports},
    error::{Error, Result},
    flasher::{
        AttemptFailure, DEFAULT_MAX_ATTEMPTS, SessionContext, run_attempt, run_with_retries,
    },
    image::{DEFAULT_BOOTLOADER_IMAGE, DEFAULT_SYSUPGRADE_IMAGE, FirmwareImage},
    net::{AddressPair, allocate_addresses},
    programmer::{ProgrammerConfig, upload_agent},
    tftp::{FirmwareServer, ServerHandle, TFTP_PORT},
    tracker::{diff_single, list_port_names, reset_into_bootloader, watch_for_change},
};
