//! Commands that talk to the bootloader: info, read, write and verify.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use optiflash::{
    BootloaderLink, FlashImage, FlashProgrammer, LinkConfig, NativePort, Phase, ProgramStatus,
    ResetControl, SerialConfig, Target,
};

use super::image::{fingerprint_hex, hex_export_warning, load_image, save_image};
use crate::config::{Config, DEFAULT_BAUD, ResetMode};
use crate::serial::{SerialOptions, map_prompt_error, select_serial_port};
use crate::{Cli, CliError, ImageFormat, use_fancy_output};

type Programmer = FlashProgrammer<NativePort, Box<dyn ResetControl>>;

/// Most mismatching addresses listed after a failed verify.
const MAX_REPORTED_MISMATCHES: usize = 32;

/// Resolve port, baud, reset wiring and target, then open the programmer.
fn open_programmer(cli: &Cli, config: &Config) -> Result<Programmer> {
    let target = config.resolve_target(cli.target.as_deref())?;
    let port_name = select_serial_port(&SerialOptions {
        port: cli.port.clone(),
        config_port: config.connection.port.clone(),
        non_interactive: cli.non_interactive,
    })?;
    let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
    let reset = cli
        .reset
        .or(config.connection.reset)
        .unwrap_or(ResetMode::Dtr);

    if !cli.quiet {
        eprintln!(
            "{} Using {} @ {} baud, target {}",
            style("🔌").cyan(),
            style(&port_name).cyan(),
            baud,
            target
        );
    }
    debug!("Reset wiring: {reset:?}");

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open {port_name}"))?;
    let link = BootloaderLink::with_config(
        port,
        LinkConfig::default().with_strictness(config.strictness(cli.strict)),
    );
    Ok(FlashProgrammer::new(link, reset.controller(), target)
        .with_config(config.programmer_config()))
}

/// One progress bar that restarts whenever the phase changes.
struct PhaseProgress {
    bar: ProgressBar,
    phase: Option<Phase>,
}

impl PhaseProgress {
    fn new(cli: &Cli) -> Self {
        let bar = if cli.quiet || !use_fancy_output() {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(0);
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                    )
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar
        };
        Self { bar, phase: None }
    }

    fn update(&mut self, phase: Phase, page: usize, total: usize) {
        if self.phase != Some(phase) {
            self.phase = Some(phase);
            self.bar.reset();
            self.bar.set_length(total as u64);
            self.bar.set_message(phase.to_string());
        }
        self.bar.set_position(page as u64);
    }

    fn finish(&self, message: &'static str) {
        self.bar.finish_with_message(message);
    }
}

fn print_fingerprint(cli: &Cli, image: &FlashImage) {
    if !cli.quiet {
        eprintln!(
            "{} SHA-256: {}",
            style("🔑").cyan(),
            style(fingerprint_hex(image)).bold()
        );
    }
}

fn print_mismatches(mismatches: &[usize]) {
    for address in mismatches.iter().take(MAX_REPORTED_MISMATCHES) {
        eprintln!("  {} ERROR at 0x{address:04X}", style("✗").red());
    }
    if mismatches.len() > MAX_REPORTED_MISMATCHES {
        eprintln!(
            "  {} ... and {} more",
            style("✗").red(),
            mismatches.len() - MAX_REPORTED_MISMATCHES
        );
    }
}

/// Ask before writing; skipped with `--yes`, `--non-interactive` or without a terminal.
fn confirm_write(cli: &Cli, yes: bool, target: &Target) -> Result<()> {
    if yes || cli.non_interactive || !std::io::stdin().is_terminal() {
        return Ok(());
    }

    let proceed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Program {target} flash?"))
        .default(false)
        .interact()
        .map_err(map_prompt_error)?;
    if proceed {
        Ok(())
    } else {
        Err(CliError::Cancelled("write cancelled".to_string()).into())
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config) -> Result<()> {
    let mut programmer = open_programmer(cli, config)?;
    let identity = programmer.connect_and_identify()?;
    let target = programmer.target();

    eprintln!("{}", style("Device").bold().underlined());
    eprintln!("  Signature:  {}", style(identity.signature).cyan());
    eprintln!("  Bootloader: {}", identity.version());
    if identity.matches(target) {
        eprintln!("  Target:     {} {}", target, style("✓").green());
        Ok(())
    } else {
        eprintln!(
            "  Target:     {} {} (expects {})",
            target,
            style("✗").red(),
            target.signature
        );
        Err(optiflash::Error::SignatureMismatch {
            expected: target.signature,
            actual: identity.signature,
        }
        .into())
    }
}

/// Read command implementation.
pub(crate) fn cmd_read(cli: &Cli, config: &Config, output: &Path, format: ImageFormat) -> Result<()> {
    let mut programmer = open_programmer(cli, config)?;
    let mut progress = PhaseProgress::new(cli);

    let image = programmer
        .read_flash(|phase, page, total| progress.update(phase, page, total))
        .context("Reading flash failed")?;
    progress.finish("Read complete");

    save_image(&image, output, format)?;
    if let Some(warning) = hex_export_warning(&image, format) {
        eprintln!("{} {warning}", style("⚠").yellow());
    }
    if !cli.quiet {
        eprintln!(
            "{} Saved {} bytes to {}",
            style("✓").green(),
            image.len(),
            output.display()
        );
    }
    print_fingerprint(cli, &image);
    Ok(())
}

/// Write command implementation.
pub(crate) fn cmd_write(cli: &Cli, config: &Config, input: &Path, yes: bool) -> Result<()> {
    let target = config.resolve_target(cli.target.as_deref())?;
    let image = load_image(input, &target, config.strictness(cli.strict))?;
    if !cli.quiet {
        eprintln!("{} Loaded {}", style("📦").cyan(), input.display());
    }
    print_fingerprint(cli, &image);
    confirm_write(cli, yes, &target)?;

    let mut programmer = open_programmer(cli, config)?;
    let mut progress = PhaseProgress::new(cli);
    let report = programmer
        .program_flash(&image, |phase, page, total| progress.update(phase, page, total))
        .context("Programming failed")?;

    match report.status {
        ProgramStatus::Ok => {
            progress.finish("Verified");
            if !cli.quiet {
                eprintln!(
                    "\n{} Programmed and verified after {} attempt(s)",
                    style("🎉").green().bold(),
                    report.attempts
                );
            }
        },
        ProgramStatus::VerifyFailed => {
            progress.finish("Verify failed");
            print_mismatches(&report.mismatches);
        },
        ProgramStatus::NoConnection => progress.finish("No connection"),
    }
    report.into_result()?;
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(cli: &Cli, config: &Config, input: &Path) -> Result<()> {
    let target = config.resolve_target(cli.target.as_deref())?;
    let image = load_image(input, &target, config.strictness(cli.strict))?;
    print_fingerprint(cli, &image);

    let mut programmer = open_programmer(cli, config)?;
    let mut progress = PhaseProgress::new(cli);
    let mismatches = programmer
        .verify(&image, |phase, page, total| progress.update(phase, page, total))
        .context("Verifying flash failed")?;

    if mismatches.is_empty() {
        progress.finish("Verified");
        if !cli.quiet {
            eprintln!("{} Flash matches {}", style("✓").green(), input.display());
        }
        return Ok(());
    }

    progress.finish("Mismatch");
    print_mismatches(&mismatches);
    Err(optiflash::Error::VerifyFailed {
        attempts: 1,
        mismatches: mismatches.len(),
    }
    .into())
}
