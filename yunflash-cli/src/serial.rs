//! Interactive serial port selection.
//!
//! Picks the port of the board to update:
//! - Auto-detection of Yún USB identities (sketch or bootloader side)
//! - Interactive selection via dialoguer when several ports qualify
//! - Non-interactive mode for unattended runs

use crate::{CliError, config::Config};
use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme};
use log::{debug, info, warn};
use std::io::IsTerminal;
use yunflash::{DetectedPort, detect_ports};

/// Flags that control how the port is chosen.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Port given on the command line.
    pub port: Option<String>,
    /// Never prompt; fail instead.
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection failures map to CLI exit code 2 instead of the generic 1,
    // so scripted callers can tell a setup problem from a failed update.
    CliError::Usage(message.to_string()).into()
}

fn select_non_interactive_port(yun_ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    // Non-interactive mode must be deterministic and never prompt: the first
    // recognised board wins, anything else needs an explicit --port.
    if yun_ports.len() > 1 {
        warn!(
            "{} Yún boards detected, using the first ({})",
            yun_ports.len(),
            yun_ports[0].name
        );
    }
    yun_ports.into_iter().next().ok_or_else(|| {
        usage_err("No Yún board detected. Pass --port to use an unrecognised device.")
    })
}

/// Choose the serial port to update, prompting only when allowed.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<DetectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.port {
        debug!("Port taken from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = detect_ports();

    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found. Connect the board via USB and try again.",
        ));
    }

    let yun_ports: Vec<DetectedPort> = ports.iter().filter(|p| p.is_yun()).cloned().collect();

    if options.non_interactive {
        return select_non_interactive_port(yun_ports);
    }

    // Offer every port when nothing carries a Yún identity, so a board wired
    // through an external serial adapter can still be picked by hand.
    let candidates = if yun_ports.is_empty() { ports } else { yun_ports };

    if candidates.len() > 1 {
        ensure_interactive_terminal()?;
        return select_port_interactive(candidates);
    }

    let port = candidates
        .into_iter()
        .next()
        .expect("candidates has exactly 1 element here");

    if port.is_yun() {
        info!(
            "Auto-selected {} [{}]",
            port.name,
            port.mode.map_or("unknown mode", |m| m.name())
        );
        Ok(port)
    } else {
        ensure_interactive_terminal()?;
        confirm_single_port(port)
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(
            "Interactive port selection requires a terminal. Use --port or --non-interactive."
                .to_string(),
        )
        .into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                CliError::Usage("Failed to display the port selection prompt".to_string()).into()
            }
        }
    }
}

/// Look up a named port in the enumerated list, falling back to a bare entry.
fn find_port_by_name(name: &str) -> DetectedPort {
    let ports = detect_ports();

    if let Some(port) = ports.iter().find(|p| p.name == name) {
        return port.clone();
    }

    // COM port names are case-insensitive on Windows.
    if let Some(port) = ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
        return port.clone();
    }

    // Not enumerable, but the user asked for it by name. Pass it through.
    DetectedPort {
        name: name.to_string(),
        mode: None,
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial: None,
    }
}

/// Prompt the user to pick one of several candidate ports.
fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Yún boards are listed first.").dim());

    ports.sort_by_key(|p| !p.is_yun());

    let port_names: Vec<String> = ports
        .iter()
        .map(|port| {
            let name = if port.is_yun() {
                style(&port.name).bold().to_string()
            } else {
                port.name.clone()
            };

            let device_info = if let Some(mode) = port.mode {
                format!(" [{}]", style(format!("Yún, {}", mode.name())).yellow())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" ({vid:04X}:{pid:04X})")
            } else {
                String::new()
            };

            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {}", style(p).dim()))
                .unwrap_or_default();

            format!("{name}{device_info}{product}")
        })
        .collect();

    // Keep each label on one line in narrow terminals.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let port_names: Vec<String> = port_names
        .into_iter()
        .map(|n| console::truncate_str(&n, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port of the board")
        .items(&port_names)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Confirm use of a single port that does not look like a Yún.
fn confirm_single_port(port: DetectedPort) -> Result<DetectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "{}{} was not recognised as a Yún board. Use it anyway?",
            port.name, product_info
        ))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(port)
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}
