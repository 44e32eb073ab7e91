//! Full update run, the default action when no subcommand is given.
//!
//! Stages the firmware, starts the TFTP server, programs the 32u4 with the
//! serial bridge sketch and then drives the U-Boot console until the new
//! system boots, retrying with fresh addresses when an attempt dies.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::serial::{SerialOptions, select_serial_port};
use crate::{Cli, CliError, use_fancy_output, was_interrupted};
use yunflash::console::{AGENT_BAUD, ConsoleSession};
use yunflash::flasher::{self, DEFAULT_MAX_ATTEMPTS, SessionContext};
use yunflash::image::{DEFAULT_BOOTLOADER_IMAGE, DEFAULT_SYSUPGRADE_IMAGE, FirmwareImage};
use yunflash::net;
use yunflash::programmer::{ProgrammerConfig, upload_agent};
use yunflash::tftp::{FirmwareServer, TFTP_PORT};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Update interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Effective settings of an update run after merging CLI, environment and
/// config file values.
#[derive(Debug)]
struct UpdateSettings {
    board: String,
    firmware_dir: PathBuf,
    bootloader_image: String,
    main_image: String,
    tools_dir: Option<PathBuf>,
    max_attempts: u32,
}

fn resolve_settings(cli: &Cli, config: &Config) -> UpdateSettings {
    UpdateSettings {
        board: cli
            .board
            .clone()
            .or_else(|| config.board.clone())
            .unwrap_or_else(|| "Yun".to_string()),
        firmware_dir: cli
            .firmware_dir
            .clone()
            .or_else(|| config.firmware_dir.clone())
            .unwrap_or_else(default_firmware_dir),
        bootloader_image: cli
            .bootloader_image
            .clone()
            .unwrap_or_else(|| DEFAULT_BOOTLOADER_IMAGE.to_string()),
        main_image: cli
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSUPGRADE_IMAGE.to_string()),
        tools_dir: cli.tools_dir.clone().or_else(|| config.tools_dir.clone()),
        max_attempts: cli
            .max_attempts
            .or(config.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS),
    }
}

/// Firmware directory used when none is configured: `tftp/` next to the
/// executable.
fn default_firmware_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("tftp")))
        .unwrap_or_else(|| PathBuf::from("tftp"))
}

/// Spinner showing the current phase of the U-Boot conversation.
fn phase_spinner(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

/// Update command implementation.
pub(crate) fn cmd_update(cli: &Cli, config: &Config) -> Result<()> {
    let settings = resolve_settings(cli, config);

    // Stage the firmware before touching the board: a missing image must
    // fail the run while the device is still bootable.
    let bootloader_image =
        FirmwareImage::from_dir(&settings.firmware_dir, &settings.bootloader_image)?;
    let main_image = FirmwareImage::from_dir(&settings.firmware_dir, &settings.main_image)?;

    if !cli.quiet {
        eprintln!(
            "{} Serving firmware from {}",
            style("📦").cyan(),
            settings.firmware_dir.display()
        );
    }

    let _server = FirmwareServer::bind(("0.0.0.0", TFTP_PORT), &settings.firmware_dir)
        .context("Failed to start the TFTP server (port 69 usually needs elevated privileges)")?
        .spawn()?;

    let addresses = net::allocate_addresses(None)?;
    if !cli.quiet {
        eprintln!("{} Using addresses: {addresses}", style("🌐").cyan());
    }

    // Pick the serial port of the board
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let port = select_serial_port(&options, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Found {} at {}",
            style("🔌").cyan(),
            settings.board,
            port.name
        );
        if cli.legacy {
            eprintln!("{} Old YUN detected", style("⚠").yellow());
        }
    }

    ensure_not_interrupted()?;

    // Program the 32u4 with the serial bridge sketch
    let programmer = settings
        .tools_dir
        .as_ref()
        .map_or_else(ProgrammerConfig::from_exe, |dir| {
            Ok(ProgrammerConfig::new(dir))
        })?;

    if !cli.quiet {
        eprintln!(
            "{} Programming the serial bridge sketch",
            style("⏳").yellow()
        );
    }
    let agent_port = upload_agent(&programmer, &port.name)?;

    ensure_not_interrupted()?;

    let mut console = ConsoleSession::open(&agent_port, AGENT_BAUD)
        .with_context(|| format!("Failed to open the console on {agent_port}"))?;

    let mut ctx = SessionContext {
        server_addr: addresses.server,
        device_addr: addresses.device,
        flash_bootloader: cli.bootloader,
        target_board: settings.board.clone(),
        legacy: cli.legacy,
        bootloader_image,
        main_image,
    };

    let pb = phase_spinner(cli);

    let result = flasher::run_with_retries(
        &mut ctx,
        settings.max_attempts,
        |ctx| flasher::run_attempt(ctx, &mut console, &mut |phase| pb.set_message(phase)),
        |ctx| {
            let fresh = net::allocate_addresses(Some(ctx.server_addr))?;
            ctx.server_addr = fresh.server;
            ctx.device_addr = fresh.device;
            Ok(())
        },
    );

    pb.finish_and_clear();

    match result {
        Ok(_) => {
            if !cli.quiet {
                eprintln!(
                    "\n{} All done! Enjoy your updated {}",
                    style("🎉").green().bold(),
                    settings.board
                );
            }
            Ok(())
        }
        Err(_) if was_interrupted() => {
            Err(CliError::Cancelled("Update interrupted".to_string()).into())
        }
        Err(err) => Err(anyhow::Error::new(err).context("The update did not complete")),
    }
}
