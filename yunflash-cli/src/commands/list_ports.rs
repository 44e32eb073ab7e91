//! Port listing command implementation.

use console::style;
use yunflash::{DetectedPort, auto_detect_port, detect_ports};

/// List ports command implementation.
pub(crate) fn cmd_list_ports() {
    let detected = detect_ports();

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &detected {
            eprintln!("  {} {}", style("•").green(), describe(port));
        }

        // Show which port a bare `yunflash` run would pick
        if let Ok(auto_port) = auto_detect_port("Yun") {
            eprintln!(
                "\n{} Would update: {}",
                style("→").green().bold(),
                style(&auto_port.name).cyan().bold()
            );
        }
    }
}

fn describe(port: &DetectedPort) -> String {
    let identity = if let Some(mode) = port.mode {
        format!(" [{}]", style(format!("Yún, {}", mode.name())).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_deref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{}{}{}", style(&port.name).cyan(), identity, product)
}
