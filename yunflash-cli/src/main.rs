//! yunflash CLI - unattended firmware updates for Arduino Yún family boards.
//!
//! ## Features
//!
//! - One-command update of the boot-loader and the sysupgrade image
//! - Built-in TFTP origin server for the firmware images
//! - Guided serial port selection with Yún auto-detection
//! - Shell completions and TOML config files

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Sampled once at startup; spinner decisions consult it afterwards.
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Whether Ctrl-C was received.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Spinners and emoji only when stderr is a live, colored terminal.
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Check if the user asked to stop.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

mod commands;
mod config;
mod serial;

use config::Config;

/// Errors carrying a specific process exit code.
///
/// Anything else exits 1; clap's own parse errors exit 2 on their own.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid usage or setup; exits 2 like clap's parse errors.
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user; exits 130 (128 + SIGINT).
    #[error("{0}")]
    Cancelled(String),
}

/// yunflash - unattended firmware updates for Arduino Yún family boards.
///
/// Running without a subcommand performs the full update.
///
/// Environment variables:
///   YUNFLASH_PORT              - Serial port of the board
///   YUNFLASH_BOARD             - Board name (default: Yun)
///   YUNFLASH_FIRMWARE_DIR      - Directory served over TFTP
///   YUNFLASH_TOOLS_DIR         - Directory with avrdude and the bridge sketch
///   YUNFLASH_MAX_ATTEMPTS      - Total attempt budget
///   YUNFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "yunflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Running without a subcommand performs the full update.")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port of the board (auto-detected if not specified).
    #[arg(short, long, global = true, env = "YUNFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Board name written into the U-Boot environment [default: Yun].
    #[arg(short, long, env = "YUNFLASH_BOARD")]
    pub(crate) board: Option<String>,

    /// Reflash the boot-loader even if the board looks current.
    #[arg(long)]
    pub(crate) bootloader: bool,

    /// First-generation board: skip banner detection, stop autoboot with a
    /// bare newline.
    #[arg(long)]
    pub(crate) legacy: bool,

    /// Directory served over TFTP [default: tftp/ next to the executable].
    #[arg(long, value_name = "DIR", env = "YUNFLASH_FIRMWARE_DIR")]
    pub(crate) firmware_dir: Option<PathBuf>,

    /// Boot-loader image file name inside the firmware directory.
    #[arg(long, value_name = "NAME")]
    pub(crate) bootloader_image: Option<String>,

    /// Sysupgrade image file name inside the firmware directory.
    #[arg(long, value_name = "NAME")]
    pub(crate) image: Option<String>,

    /// Directory holding avrdude and the bridge sketch [default: avr/ next
    /// to the executable].
    #[arg(long, value_name = "DIR", env = "YUNFLASH_TOOLS_DIR")]
    pub(crate) tools_dir: Option<PathBuf>,

    /// Total attempt budget, first run included [default: 4].
    #[arg(long, value_name = "N", env = "YUNFLASH_MAX_ATTEMPTS")]
    pub(crate) max_attempts: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Only print warnings and errors.
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Never prompt; fail where a prompt would be needed.
    #[arg(long, global = true, env = "YUNFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Read settings from this file instead of the default locations.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Show every serial port and which one would be updated.
    ListPorts,

    /// Generate or install shell completions.
    Completions {
        /// Target shell (auto-detected when used with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Write the script to the shell's completion directory.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

/// Map an error to the documented exit code (1 generic, 2 usage, 130
/// cancelled).
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CliError>() {
        Some(CliError::Usage(_)) => 2,
        Some(CliError::Cancelled(_)) => 130,
        None => 1,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // NO_COLOR and piped-output handling.
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Logging filter from -q/-v.
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "yunflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Ctrl-C finishes the current console exchange, then stops before the
    // next one; the library polls this flag between expect iterations.
    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::Relaxed);
    })
    .context("Failed to install the Ctrl-C handler")?;
    yunflash::set_interrupt_checker(was_interrupted);

    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        None => commands::update::cmd_update(&cli, &config),
        Some(Commands::ListPorts) => {
            commands::list_ports::cmd_list_ports();
            Ok(())
        },
        Some(Commands::Completions { shell, install }) => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                match shell {
                    Some(shell) => {
                        commands::completions::cmd_completions(*shell);
                        Ok(())
                    },
                    None => Err(CliError::Usage(
                        "Specify a shell, e.g.: yunflash completions bash, \
                         or use --install to auto-detect."
                            .to_string(),
                    )
                    .into()),
                }
            }
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- derive validation ----

    #[test]
    fn test_derive_produces_valid_command() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_bare_invocation_is_update() {
        let cli = Cli::try_parse_from(["yunflash"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.port.is_none());
        assert!(cli.board.is_none());
        assert!(!cli.bootloader);
        assert!(!cli.legacy);
        assert!(!cli.quiet);
        assert!(!cli.non_interactive);
        assert_eq!(cli.verbose, 0);
        assert!(cli.max_attempts.is_none());
    }

    #[test]
    fn test_cli_parse_update_options() {
        let cli = Cli::try_parse_from([
            "yunflash",
            "--port",
            "/dev/ttyACM0",
            "--board",
            "Tian",
            "--bootloader",
            "--legacy",
            "--firmware-dir",
            "/srv/tftp",
            "--bootloader-image",
            "uboot.bin",
            "--image",
            "sysupgrade.bin",
            "--tools-dir",
            "/opt/avr",
            "--max-attempts",
            "2",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.board.as_deref(), Some("Tian"));
        assert!(cli.bootloader);
        assert!(cli.legacy);
        assert_eq!(cli.firmware_dir.as_deref(), Some(std::path::Path::new("/srv/tftp")));
        assert_eq!(cli.bootloader_image.as_deref(), Some("uboot.bin"));
        assert_eq!(cli.image.as_deref(), Some("sysupgrade.bin"));
        assert_eq!(cli.tools_dir.as_deref(), Some(std::path::Path::new("/opt/avr")));
        assert_eq!(cli.max_attempts, Some(2));
    }

    #[test]
    fn test_cli_parse_short_options() {
        let cli =
            Cli::try_parse_from(["yunflash", "-p", "COM3", "-b", "Yun", "-vv", "-q"]).unwrap();
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        assert_eq!(cli.board.as_deref(), Some("Yun"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
    }

    #[test]
    fn test_parse_list_ports_subcommand() {
        let cli = Cli::try_parse_from(["yunflash", "list-ports"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::ListPorts)));
    }

    #[test]
    fn test_parse_completions_with_shell() {
        let cli = Cli::try_parse_from(["yunflash", "completions", "bash"]).unwrap();
        if let Some(Commands::Completions { shell, install }) = cli.command {
            assert_eq!(shell, Some(Shell::Bash));
            assert!(!install);
        } else {
            panic!("Expected Completions command");
        }
    }

    #[test]
    fn test_cli_parse_completions_install_without_shell() {
        let cli = Cli::try_parse_from(["yunflash", "completions", "--install"]).unwrap();
        if let Some(Commands::Completions { shell, install }) = cli.command {
            assert_eq!(shell, None);
            assert!(install);
        } else {
            panic!("Expected Completions command");
        }
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["yunflash", "list-ports", "-v", "--non-interactive"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(cli.non_interactive);
    }

    #[test]
    fn test_cli_update_options_rejected_after_subcommand() {
        // Update-run options are not global; they make no sense on list-ports.
        let result = Cli::try_parse_from(["yunflash", "list-ports", "--legacy"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_invalid_max_attempts() {
        let result = Cli::try_parse_from(["yunflash", "--max-attempts", "many"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_unknown_subcommand() {
        let result = Cli::try_parse_from(["yunflash", "monitor"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_config_path() {
        let cli =
            Cli::try_parse_from(["yunflash", "--config", "/tmp/yunflash.toml"]).unwrap();
        assert_eq!(
            cli.config_path.as_deref(),
            Some(std::path::Path::new("/tmp/yunflash.toml"))
        );
    }

    // ---- exit code mapping ----

    #[test]
    fn test_exit_code_for_usage_error() {
        let err: anyhow::Error = CliError::Usage("bad".into()).into();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_exit_code_for_cancelled() {
        let err: anyhow::Error = CliError::Cancelled("stop".into()).into();
        assert_eq!(exit_code_for(&err), 130);
    }

    #[test]
    fn test_exit_code_for_generic_error() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn test_exit_code_for_wrapped_cli_error() {
        // Context added at the boundary must not hide the mapped code.
        let err = anyhow::Error::from(CliError::Usage("bad".into()));
        let wrapped = err.context("while selecting a port");
        assert_eq!(exit_code_for(&wrapped), 2);
    }
}
