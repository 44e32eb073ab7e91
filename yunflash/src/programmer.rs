//! Loading the serial bridge sketch with avrdude.
//!
//! The board's USB port belongs to an ATmega32U4, not to the AR9331 that
//! U-Boot runs on. Before any console work the MCU must be programmed with a
//! pass-through sketch that bridges USB serial to the AR9331 console UART.
//! Programming goes through the stock AVR109 bootloader, entered with the
//! 1200 bps touch and driven by the bundled avrdude binary.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::tracker;
use crate::{Error, Result};

/// Baud rate of the AVR109 bootloader on the ATmega32U4.
const PROGRAMMER_BAUD: u32 = 57_600;

/// MCU the programmer talks to.
const PROGRAMMER_PART: &str = "atmega32u4";

/// Programming protocol spoken by the Caterina bootloader.
const PROGRAMMER_PROTOCOL: &str = "avr109";

/// Name of the bridge sketch image, flashed as Intel hex.
const BRIDGE_SKETCH: &str = "YunSerialTerminal.ino.hex";

/// How long the board may take to re-enumerate after the 1200 bps touch.
const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the board may take to re-enumerate once the sketch starts.
const REATTACH_TIMEOUT: Duration = Duration::from_secs(1);

/// Location of the bundled programmer and its payload.
///
/// The expected layout, relative to the tools directory:
///
/// ```text
/// avr/
///   bin/avrdude
///   etc/avrdude.conf
///   YunSerialTerminal.ino.hex
/// ```
#[derive(Debug, Clone)]
pub struct ProgrammerConfig {
    tools_dir: PathBuf,
}

impl ProgrammerConfig {
    /// Uses an explicit tools directory.
    pub fn new<P: Into<PathBuf>>(tools_dir: P) -> Self {
        Self {
            tools_dir: tools_dir.into(),
        }
    }

    /// Resolves the `avr` tools directory next to the running executable.
    pub fn from_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::new(dir.join("avr")))
    }

    fn avrdude(&self) -> PathBuf {
        self.tools_dir.join("bin").join("avrdude")
    }

    fn conf(&self) -> PathBuf {
        self.tools_dir.join("etc").join("avrdude.conf")
    }

    fn sketch(&self) -> PathBuf {
        self.tools_dir.join(BRIDGE_SKETCH)
    }
}

/// Programs the bridge sketch onto the MCU behind `port_name`.
///
/// Returns the name of the port the bridge console answers on, which may
/// differ from `port_name` after the two re-enumerations involved.
pub fn upload_agent(config: &ProgrammerConfig, port_name: &str) -> Result<String> {
    info!("Restarting in bootloader mode");
    let port = tracker::reset_into_bootloader(port_name, RESET_TIMEOUT)?;

    // Give the bootloader a moment to bring its CDC port up.
    thread::sleep(Duration::from_secs(1));

    run_avrdude(config, &port)?;

    // The freshly programmed sketch makes the board re-enumerate once more.
    let before = tracker::list_port_names();
    Ok(tracker::watch_for_change(&before, &port, REATTACH_TIMEOUT))
}

fn avrdude_args(config: &ProgrammerConfig, port: &str) -> Vec<String> {
    vec![
        format!("-C{}", config.conf().display()),
        "-v".to_string(),
        format!("-p{PROGRAMMER_PART}"),
        format!("-c{PROGRAMMER_PROTOCOL}"),
        format!("-P{port}"),
        format!("-b{PROGRAMMER_BAUD}"),
        "-D".to_string(),
        format!("-Uflash:w:{}:i", config.sketch().display()),
    ]
}

fn run_avrdude(config: &ProgrammerConfig, port: &str) -> Result<()> {
    let avrdude = config.avrdude();
    let args = avrdude_args(config, port);
    info!("Flashing with command: {} {}", avrdude.display(), args.join(" "));

    let mut child = Command::new(&avrdude)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Programmer(format!("failed to start {}: {e}", avrdude.display())))?;

    // Drain both pipes so a chatty run cannot stall on a full pipe buffer.
    let stdout = child
        .stdout
        .take()
        .map(|s| thread::spawn(move || drain_lines(s)));
    let stderr = child
        .stderr
        .take()
        .map(|s| thread::spawn(move || drain_lines(s)));

    let status = child.wait()?;

    if let Some(handle) = stdout {
        let _ = handle.join();
    }
    if let Some(handle) = stderr {
        let _ = handle.join();
    }

    if !status.success() {
        return Err(Error::Programmer(format!("avrdude exited with {status}")));
    }
    debug!("avrdude finished successfully");
    Ok(())
}

fn drain_lines<R: Read + Send + 'static>(reader: R) {
    for line in BufReader::new(reader).lines().map_while(std::result::Result::ok) {
        debug!("avrdude: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_layout_follows_the_avr_directory() {
        let config = ProgrammerConfig::new("/opt/yun/avr");
        assert_eq!(config.avrdude(), PathBuf::from("/opt/yun/avr/bin/avrdude"));
        assert_eq!(config.conf(), PathBuf::from("/opt/yun/avr/etc/avrdude.conf"));
        assert_eq!(
            config.sketch(),
            PathBuf::from("/opt/yun/avr/YunSerialTerminal.ino.hex")
        );
    }

    #[test]
    fn args_select_the_avr109_bootloader() {
        let config = ProgrammerConfig::new("/opt/yun/avr");
        let args = avrdude_args(&config, "/dev/ttyACM1");
        assert!(args.contains(&"-patmega32u4".to_string()));
        assert!(args.contains(&"-cavr109".to_string()));
        assert!(args.contains(&"-P/dev/ttyACM1".to_string()));
        assert!(args.contains(&"-b57600".to_string()));
        assert!(args.contains(&"-D".to_string()));
        assert!(
            args.iter()
                .any(|a| a.starts_with("-Uflash:w:") && a.ends_with(".ino.hex:i"))
        );
    }
}
