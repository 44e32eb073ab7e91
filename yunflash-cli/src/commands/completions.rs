//! Shell completion output and per-user installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

/// Write the completion script for `shell` to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Install shell completions into the conventional per-user location.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell().context(
            "Could not detect your shell. Name it explicitly:\n  \
             yunflash completions --install bash",
        )?,
    };

    let path = install_path(shell)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, completion_script(shell))
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Wrote {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );
    print_activation_hint(shell, &path);

    Ok(())
}

fn completion_script(shell: Shell) -> Vec<u8> {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    let mut buf = Vec::new();
    generate(shell, &mut cmd, name, &mut buf);
    buf
}

/// Detect the user's shell from `$SHELL`, falling back to PowerShell
/// markers on Windows.
fn detect_shell() -> Option<Shell> {
    if let Some(path) = env::var_os("SHELL") {
        return shell_from_path(Path::new(&path));
    }
    if cfg!(windows) && env::var_os("PSModulePath").is_some() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &Path) -> Option<Shell> {
    match shell_path.file_name()?.to_str()? {
        "pwsh" => Some(Shell::PowerShell),
        name => name.parse().ok(),
    }
}

/// Conventional per-user completion script path for a shell.
fn install_path(shell: Shell) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => xdg_dir("XDG_DATA_HOME", &[".local", "share"])?
            .join("bash-completion")
            .join("completions")
            .join("yunflash"),
        Shell::Zsh => home_dir()?.join(".zfunc").join("_yunflash"),
        Shell::Fish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("fish")
            .join("completions")
            .join("yunflash.fish"),
        Shell::Elvish => xdg_dir("XDG_CONFIG_HOME", &[".config"])?
            .join("elvish")
            .join("lib")
            .join("yunflash.elv"),
        Shell::PowerShell => match env::var_os("PROFILE") {
            Some(profile) => PathBuf::from(&profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                .join("yunflash.ps1"),
            None => home_dir()?
                .join(".config")
                .join("powershell")
                .join("completions")
                .join("yunflash.ps1"),
        },
        _ => anyhow::bail!("No install convention known for this shell"),
    };
    Ok(path)
}

/// Shell-specific post-install instructions.
fn print_activation_hint(shell: Shell, path: &Path) {
    match shell {
        Shell::Bash => {
            eprintln!();
            eprintln!("New terminals pick these up automatically.");
            eprintln!(
                "To load them in this session: {}",
                style(format!("source {}", path.display())).cyan()
            );
        }
        Shell::Zsh => {
            eprintln!();
            eprintln!("Make sure ~/.zfunc is in your fpath, e.g. add to ~/.zshrc:");
            eprintln!("  {}", style("fpath=(~/.zfunc $fpath)").cyan());
            eprintln!("  {}", style("autoload -Uz compinit && compinit").cyan());
            eprintln!("Then restart your shell or run: {}", style("exec zsh").cyan());
        }
        Shell::Fish => {
            eprintln!();
            eprintln!("New Fish sessions pick these up automatically.");
        }
        Shell::PowerShell => {
            eprintln!();
            eprintln!("Load them from your PowerShell profile:");
            eprintln!(
                "  {}",
                style(format!("Import-Module {}", path.display())).cyan()
            );
        }
        Shell::Elvish => {
            eprintln!();
            eprintln!("New Elvish sessions pick these up automatically.");
        }
        _ => {}
    }
}

fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .context("Home directory not set")
}

/// An XDG base directory: the override variable when set, otherwise the
/// conventional location under the home directory.
fn xdg_dir(var: &str, fallback: &[&str]) -> Result<PathBuf> {
    match env::var_os(var) {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => {
            let mut path = home_dir()?;
            for segment in fallback {
                path.push(segment);
            }
            Ok(path)
        }
    }
}
