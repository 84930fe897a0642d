//! Serial port selection.
//!
//! Order of preference:
//! - the port given on the command line or in `OPTIFLASH_PORT`
//! - the port from the configuration file
//! - auto-detection, prompting when more than one bridge is attached

use {
    crate::CliError,
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    optiflash::{DetectedPort, detect_ports},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port from the command line or environment.
    pub port: Option<String>,
    /// Port from the configuration file.
    pub config_port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Pick the serial port to open.
pub fn select_serial_port(options: &SerialOptions) -> Result<String> {
    if let Some(port) = &options.port {
        return Ok(port.clone());
    }
    if let Some(port) = &options.config_port {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    let ports = detect_ports();
    let candidates = preferred_ports(ports);
    choose(candidates, options.non_interactive)
}

/// Known bridges if any are attached, otherwise every port.
fn preferred_ports(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    if ports.iter().any(|p| p.device.is_known()) {
        ports.into_iter().filter(|p| p.device.is_known()).collect()
    } else {
        ports
    }
}

fn choose(candidates: Vec<DetectedPort>, non_interactive: bool) -> Result<String> {
    match candidates.len().cmp(&1) {
        Ordering::Less => Err(CliError::Usage(
            "no serial ports found; pass --port or set OPTIFLASH_PORT".to_string(),
        )
        .into()),
        Ordering::Equal => {
            let port = optiflash::select_port(candidates)?;
            info!("Auto-selected port: {} [{}]", port.name, port.device.name());
            Ok(port.name)
        },
        Ordering::Greater if non_interactive => Err(CliError::Usage(
            "multiple serial ports found; pass --port to choose one".to_string(),
        )
        .into()),
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(
            "multiple serial ports found and no terminal to ask; pass --port".to_string(),
        )
        .into())
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => CliError::Usage(format!("prompt failed: {io_err}")).into(),
    }
}

fn select_port_interactive(ports: Vec<DetectedPort>) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let labels = optiflash::format_port_list(&ports);
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the bootloader port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|p| p.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("selection cancelled".to_string()).into()),
    }
}
