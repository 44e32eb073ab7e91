//! The unattended U-Boot flashing procedure.
//!
//! A flashing attempt walks a fixed table of phases, one console transaction
//! per phase. Each table entry names what the phase sends, what it expects
//! back, the timeout budget for every expectation, how long to let the
//! device settle afterwards, and which phase comes next:
//!
//! ```text
//! reboot -> detect dialect -> stop autoboot -+-> network config -> main image
//!           (skipped on legacy boards)       |         ^
//!                                            v         |
//!            bootloader env -> bootloader write -> bootloader adopt
//! ```
//!
//! The bootloader leg runs when the caller asked for it or when the shell
//! name seen after stopping autoboot reveals a pre-production bootloader.
//! That decision lives in the per-attempt state, so a retry that finds a
//! healthy bootloader will not flash it again.

mod retry;

pub use retry::{DEFAULT_MAX_ATTEMPTS, run_with_retries};

use std::net::Ipv4Addr;
use std::time::Duration;

use log::{info, trace, warn};

use crate::console::{Console, ExpectPattern, Step, Transaction, TransactionOutput};
use crate::image::FirmwareImage;
use crate::uboot;
use crate::{Error, Result};

/// Everything a flashing session needs to know up front.
///
/// The context is read-only during an attempt; whatever an attempt learns
/// about the board stays in its own state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Address the TFTP server is reachable at.
    pub server_addr: Ipv4Addr,
    /// Address assigned to the board for the transfer.
    pub device_addr: Ipv4Addr,
    /// Reflash the bootloader even if the board looks current.
    pub flash_bootloader: bool,
    /// Board name written into the U-Boot environment.
    pub target_board: String,
    /// First-generation boards print no recognisable banner; skip dialect
    /// detection and stop autoboot with a bare newline.
    pub legacy: bool,
    /// The bootloader image staged on the TFTP server.
    pub bootloader_image: FirmwareImage,
    /// The sysupgrade image staged on the TFTP server.
    pub main_image: FirmwareImage,
}

/// What one attempt has learned about the board so far.
#[derive(Debug, Default)]
struct AttemptState {
    /// Keyword that interrupts autoboot. Empty means any key works. `None`
    /// until dialect detection ran (legacy boards leave it `None`).
    stop_keyword: Option<String>,
    /// Shell name the bootloader prompt showed.
    shell: Option<String>,
    /// Whether this attempt flashes the bootloader.
    flash_bootloader: bool,
}

impl AttemptState {
    fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or(uboot::FIXED_SHELL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reboot,
    DetectDialect,
    StopAutoboot,
    BootloaderEnv,
    BootloaderWrite,
    BootloaderAdopt,
    NetworkConfig,
    MainImage,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum FailurePolicy {
    /// Abandon the attempt.
    Abort,
    /// Log and move on. Only the initial reboot is this forgiving, since the
    /// board may already be sitting in the bootloader.
    WarnAndContinue,
}

type BuildFn = fn(&SessionContext, &AttemptState) -> Result<Vec<Step>>;
type ApplyFn = fn(&SessionContext, &mut AttemptState, &TransactionOutput) -> Result<()>;
type NextFn = fn(&SessionContext, &AttemptState) -> Phase;

/// One row of the phase table.
struct PhaseSpec {
    phase: Phase,
    label: &'static str,
    /// Budget for each expectation in the phase's transaction.
    timeout: Duration,
    /// Pause after the phase, letting the device finish printing.
    settle_after: Duration,
    on_failure: FailurePolicy,
    build: BuildFn,
    apply: ApplyFn,
    next: NextFn,
}

static PHASES: [PhaseSpec; 8] = [
    PhaseSpec {
        phase: Phase::Reboot,
        label: "Rebooting the board",
        timeout: Duration::from_secs(5),
        settle_after: Duration::ZERO,
        on_failure: FailurePolicy::WarnAndContinue,
        build: build_reboot,
        apply: apply_nothing,
        next: after_reboot,
    },
    PhaseSpec {
        phase: Phase::DetectDialect,
        label: "Waiting for the bootloader banner",
        timeout: Duration::from_secs(20),
        settle_after: Duration::ZERO,
        on_failure: FailurePolicy::Abort,
        build: build_detect_dialect,
        apply: apply_detect_dialect,
        next: |_, _| Phase::StopAutoboot,
    },
    PhaseSpec {
        phase: Phase::StopAutoboot,
        label: "Entering the bootloader console",
        timeout: Duration::from_secs(5),
        settle_after: Duration::from_secs(1),
        on_failure: FailurePolicy::Abort,
        build: build_stop_autoboot,
        apply: apply_stop_autoboot,
        next: after_stop_autoboot,
    },
    PhaseSpec {
        phase: Phase::BootloaderEnv,
        label: "Flashing bootloader: configuring addresses",
        timeout: Duration::from_secs(10),
        settle_after: Duration::from_secs(2),
        on_failure: FailurePolicy::Abort,
        build: build_bootloader_env,
        apply: apply_env_config,
        next: |_, _| Phase::BootloaderWrite,
    },
    PhaseSpec {
        phase: Phase::BootloaderWrite,
        label: "Flashing bootloader: writing image",
        timeout: Duration::from_secs(30),
        settle_after: Duration::from_secs(1),
        on_failure: FailurePolicy::Abort,
        build: build_bootloader_write,
        apply: apply_bootloader_write,
        next: |_, _| Phase::BootloaderAdopt,
    },
    PhaseSpec {
        phase: Phase::BootloaderAdopt,
        label: "Flashing bootloader: saving board name",
        timeout: Duration::from_secs(10),
        settle_after: Duration::ZERO,
        on_failure: FailurePolicy::Abort,
        build: build_bootloader_adopt,
        apply: apply_bootloader_adopt,
        next: |_, _| Phase::NetworkConfig,
    },
    PhaseSpec {
        phase: Phase::NetworkConfig,
        label: "Setting up IP addresses",
        timeout: Duration::from_secs(20),
        settle_after: Duration::from_secs(2),
        on_failure: FailurePolicy::Abort,
        build: build_network_config,
        apply: apply_env_config,
        next: |_, _| Phase::MainImage,
    },
    PhaseSpec {
        phase: Phase::MainImage,
        label: "Flashing the sysupgrade image",
        // Covers a full image transfer plus a 16 MB erase.
        timeout: Duration::from_secs(60),
        settle_after: Duration::ZERO,
        on_failure: FailurePolicy::Abort,
        build: build_main_image,
        apply: apply_main_image,
        next: |_, _| Phase::Done,
    },
];

fn spec_for(phase: Phase) -> Option<&'static PhaseSpec> {
    PHASES.iter().find(|spec| spec.phase == phase)
}

fn build_reboot(_ctx: &SessionContext, _state: &AttemptState) -> Result<Vec<Step>> {
    Ok(vec![
        Step::send(""),
        Step::expect(ExpectPattern::literal("linux-shell", "root@")?),
        Step::send("reboot -f"),
    ])
}

fn after_reboot(ctx: &SessionContext, _state: &AttemptState) -> Phase {
    if ctx.legacy {
        Phase::StopAutoboot
    } else {
        Phase::DetectDialect
    }
}

fn build_detect_dialect(_ctx: &SessionContext, _state: &AttemptState) -> Result<Vec<Step>> {
    Ok(vec![Step::expect_any(uboot::banner_patterns()?)])
}

fn apply_detect_dialect(
    _ctx: &SessionContext,
    state: &mut AttemptState,
    output: &TransactionOutput,
) -> Result<()> {
    if let Some(banner) = output.matches().first() {
        let keyword = uboot::stop_keyword(banner);
        if keyword.is_empty() {
            info!("old bootloader generation, autoboot stops on any key");
        } else {
            info!("autoboot stop keyword: {keyword}");
        }
        state.stop_keyword = Some(keyword);
    }
    Ok(())
}

fn build_stop_autoboot(_ctx: &SessionContext, state: &AttemptState) -> Result<Vec<Step>> {
    let keyword = state.stop_keyword.clone().unwrap_or_default();
    Ok(vec![
        Step::send(keyword),
        Step::send("printenv"),
        Step::expect(uboot::generic_prompt()?),
    ])
}

fn apply_stop_autoboot(
    _ctx: &SessionContext,
    state: &mut AttemptState,
    output: &TransactionOutput,
) -> Result<()> {
    if let Some(shell) = output.group_for("prompt", "shell") {
        info!("got shell: {shell}");
        if shell != uboot::FIXED_SHELL {
            info!("pre-production bootloader detected, it will be reflashed");
            state.flash_bootloader = true;
        }
        state.shell = Some(shell.to_string());
    }
    Ok(())
}

fn after_stop_autoboot(_ctx: &SessionContext, state: &AttemptState) -> Phase {
    if state.flash_bootloader {
        Phase::BootloaderEnv
    } else {
        Phase::NetworkConfig
    }
}

/// Sets `serverip` and `ipaddr` and reads both back.
fn env_config_steps(ctx: &SessionContext, prompt: ExpectPattern) -> Result<Vec<Step>> {
    Ok(vec![
        Step::send(format!("setenv serverip {}", ctx.server_addr)),
        Step::expect(prompt.clone()),
        Step::send("printenv"),
        Step::expect(uboot::env_value("serverip")?),
        Step::expect(prompt.clone()),
        Step::send(format!("setenv ipaddr {}", ctx.device_addr)),
        Step::send("printenv"),
        Step::expect(uboot::env_value("ipaddr")?),
        Step::expect(prompt),
    ])
}

fn build_bootloader_env(ctx: &SessionContext, state: &AttemptState) -> Result<Vec<Step>> {
    env_config_steps(ctx, uboot::shell_prompt(state.shell())?)
}

fn build_network_config(ctx: &SessionContext, _state: &AttemptState) -> Result<Vec<Step>> {
    env_config_steps(ctx, uboot::fixed_prompt()?)
}

fn apply_env_config(
    ctx: &SessionContext,
    _state: &mut AttemptState,
    output: &TransactionOutput,
) -> Result<()> {
    verify_env(output, "serverip", ctx.server_addr)?;
    verify_env(output, "ipaddr", ctx.device_addr)
}

fn build_bootloader_write(ctx: &SessionContext, state: &AttemptState) -> Result<Vec<Step>> {
    let prompt = uboot::shell_prompt(state.shell())?;
    Ok(vec![
        Step::send("printenv"),
        Step::expect(prompt.clone()),
        Step::send(format!(
            "tftp {} {}",
            uboot::LOAD_ADDR,
            ctx.bootloader_image.name
        )),
        Step::expect(uboot::bytes_transferred()?),
        Step::expect(prompt.clone()),
        Step::send(format!(
            "erase {} {}",
            uboot::BOOTLOADER_BASE,
            uboot::BOOTLOADER_ERASE_LEN
        )),
        Step::expect(prompt.clone()),
        Step::send(format!("cp.b $fileaddr {} $filesize", uboot::BOOTLOADER_BASE)),
        Step::expect(prompt.clone()),
        // Wipe the old environment so the new bootloader starts clean.
        Step::send(format!("erase {} {}", uboot::ENV_BASE, uboot::ENV_ERASE_LEN)),
        Step::expect(prompt),
        Step::send("reset"),
    ])
}

fn apply_bootloader_write(
    ctx: &SessionContext,
    _state: &mut AttemptState,
    output: &TransactionOutput,
) -> Result<()> {
    verify_transfer(output, &ctx.bootloader_image)
}

fn build_bootloader_adopt(ctx: &SessionContext, _state: &AttemptState) -> Result<Vec<Step>> {
    let prompt = uboot::fixed_prompt()?;
    Ok(vec![
        Step::expect(ExpectPattern::literal("autoboot", "autoboot in")?),
        Step::send(uboot::FIXED_STOP),
        Step::expect(prompt.clone()),
        Step::send("printenv"),
        Step::expect(prompt.clone()),
        Step::send(format!("setenv board {}", ctx.target_board)),
        Step::expect(prompt.clone()),
        Step::send("saveenv"),
        Step::expect(prompt),
    ])
}

fn apply_bootloader_adopt(
    _ctx: &SessionContext,
    state: &mut AttemptState,
    _output: &TransactionOutput,
) -> Result<()> {
    // From here on the board speaks the current dialect.
    state.shell = Some(uboot::FIXED_SHELL.to_string());
    state.stop_keyword = Some(uboot::FIXED_STOP.to_string());
    Ok(())
}

fn build_main_image(ctx: &SessionContext, _state: &AttemptState) -> Result<Vec<Step>> {
    let prompt = uboot::fixed_prompt()?;
    Ok(vec![
        Step::send("printenv"),
        Step::expect(ExpectPattern::literal("board-set", "board=")?),
        Step::expect(prompt.clone()),
        Step::send(format!("tftp {} {}", uboot::LOAD_ADDR, ctx.main_image.name)),
        Step::expect(uboot::bytes_transferred()?),
        Step::expect(prompt.clone()),
        Step::send(format!(
            "erase {} +0x{}",
            uboot::FIRMWARE_BASE,
            ctx.main_image.size_hex()
        )),
        Step::expect(uboot::erased_sectors()?),
        Step::send("printenv"),
        Step::expect(prompt.clone()),
        Step::send(format!("cp.b $fileaddr {} $filesize", uboot::FIRMWARE_BASE)),
        Step::expect(ExpectPattern::literal("copy-done", "done")?),
        Step::send("printenv"),
        Step::expect(prompt),
        Step::send("reset"),
        Step::expect(ExpectPattern::literal("kernel-start", "Starting kernel")?),
    ])
}

fn apply_main_image(
    ctx: &SessionContext,
    _state: &mut AttemptState,
    output: &TransactionOutput,
) -> Result<()> {
    verify_transfer(output, &ctx.main_image)
}

fn apply_nothing(
    _ctx: &SessionContext,
    _state: &mut AttemptState,
    _output: &TransactionOutput,
) -> Result<()> {
    Ok(())
}

fn verify_env(output: &TransactionOutput, var: &'static str, expected: Ipv4Addr) -> Result<()> {
    let expected = expected.to_string();
    let actual = output.group_for(var, "value").unwrap_or_default();
    if actual != expected {
        return Err(Error::Verification {
            what: var,
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn verify_transfer(output: &TransactionOutput, image: &FirmwareImage) -> Result<()> {
    let expected = image.size_bytes.to_string();
    let actual = output
        .group_for("bytes-transferred", "bytes")
        .unwrap_or_default();
    if actual != expected {
        return Err(Error::Verification {
            what: "transferred byte count",
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// A failed flashing attempt.
#[derive(Debug)]
pub struct AttemptFailure {
    /// Console output seen up to and including the failing exchange.
    pub output: String,
    /// The underlying error.
    pub error: Error,
}

/// Runs one full flashing attempt against `console`.
///
/// `progress` is called with a human-readable label as each phase starts.
/// On success the output of the final exchange is returned; it ends with the
/// kernel start message of the freshly flashed system.
pub fn run_attempt<C, F>(
    ctx: &SessionContext,
    console: &mut C,
    progress: &mut F,
) -> std::result::Result<String, AttemptFailure>
where
    C: Console + ?Sized,
    F: FnMut(&'static str),
{
    let stale = console.drain_output();
    if !stale.is_empty() {
        trace!("discarding {} bytes of stale output", stale.len());
    }

    let mut state = AttemptState {
        flash_bootloader: ctx.flash_bootloader,
        ..AttemptState::default()
    };
    let mut last_output = String::new();
    let mut phase = Phase::Reboot;

    while let Some(spec) = spec_for(phase) {
        progress(spec.label);
        info!("{}", spec.label);

        let steps = (spec.build)(ctx, &state).map_err(|error| AttemptFailure {
            output: last_output.clone(),
            error,
        })?;

        match Transaction::new(steps, spec.timeout).run(console) {
            Ok(outcome) => {
                if let Err(error) = (spec.apply)(ctx, &mut state, &outcome) {
                    let mut output = outcome.output().to_string();
                    output.push_str(&console.drain_output());
                    return Err(AttemptFailure { output, error });
                }
                last_output = outcome.output().to_string();
            }
            Err(failed) => match spec.on_failure {
                FailurePolicy::WarnAndContinue => {
                    warn!(
                        "{}; reboot the board with the YUN RST button if nothing happens",
                        failed.source
                    );
                }
                FailurePolicy::Abort => {
                    let mut output = failed.output;
                    output.push_str(&console.drain_output());
                    return Err(AttemptFailure {
                        output,
                        error: failed.source,
                    });
                }
            },
        }

        if !spec.settle_after.is_zero() {
            console.settle(spec.settle_after);
        }
        phase = (spec.next)(ctx, &state);
    }

    Ok(last_output)
}

#[cfg(test)]
pub(crate) fn test_context() -> SessionContext {
    SessionContext {
        server_addr: Ipv4Addr::new(192, 168, 0, 10),
        device_addr: Ipv4Addr::new(192, 168, 0, 11),
        flash_bootloader: false,
        target_board: "Yun".into(),
        legacy: false,
        bootloader_image: FirmwareImage {
            name: "u-boot-arduino-lede.bin".into(),
            size_bytes: 180_224,
        },
        main_image: FirmwareImage {
            name: "sysupgrade.bin".into(),
            size_bytes: 7_340_032,
        },
    }
}
