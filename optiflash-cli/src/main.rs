//! optiflash CLI - Command-line tool for AVR flash through an optiboot bootloader.
//!
//! ## Features
//!
//! - Read the whole flash to an Intel-HEX or raw binary file
//! - Program an Intel-HEX file with read-back verification and retries
//! - Verify device flash against a file
//! - SHA-256 fingerprints of flash images
//! - Serial port auto-detection and shell completion generation
//! - Environment variable and configuration file support

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use thiserror::Error;

mod commands;
mod config;
mod serial;

use config::{Config, ResetMode};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if progress bars and symbols should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Failures that map to dedicated exit codes.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation or setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Aborted by the operator (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// optiflash - read and program AVR flash through an optiboot bootloader.
///
/// Environment variables:
///   OPTIFLASH_PORT              - Default serial port
///   OPTIFLASH_BAUD              - Baud rate (default: 115200)
///   OPTIFLASH_TARGET            - Target profile (default: avr64db32)
///   OPTIFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "optiflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "OPTIFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the bootloader.
    #[arg(short, long, global = true, env = "OPTIFLASH_BAUD")]
    baud: Option<u32>,

    /// Target profile (built in: avr64db32) or a name described in the config.
    #[arg(short, long, global = true, env = "OPTIFLASH_TARGET")]
    target: Option<String>,

    /// Modem line wired to the target's reset pin.
    #[arg(long, global = true, value_enum)]
    reset: Option<ResetMode>,

    /// Fail on protocol deviations (missing in-sync, bad status, timeouts,
    /// invalid hex digits) instead of tolerating them.
    #[arg(long, global = true)]
    strict: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (never prompt).
    #[arg(long, global = true, env = "OPTIFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for flash dumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ImageFormat {
    /// Intel-HEX text (erased chunks omitted).
    Hex,
    /// Raw binary of the whole flash.
    Bin,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Identify the device behind the bootloader.
    Info,

    /// Read the whole flash into a file.
    Read {
        /// Output file.
        output: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value = "hex")]
        format: ImageFormat,
    },

    /// Program an Intel-HEX file (raw binary for .bin) and verify it.
    Write {
        /// Input file.
        input: PathBuf,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Compare device flash against a file.
    Verify {
        /// Input file.
        input: PathBuf,
    },

    /// Print the SHA-256 fingerprint of a file's flash image.
    Hash {
        /// Input file.
        input: PathBuf,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if not specified).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<optiflash::Error>() {
        Some(optiflash::Error::VerifyFailed { .. }) => 3,
        Some(optiflash::Error::DeviceNotFound | optiflash::Error::Config(_)) => 2,
        _ => 1,
    }
}

fn init_logging(cli: &Cli) {
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
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "optiflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Info => commands::device::cmd_info(cli, &config),
        Commands::Read { output, format } => {
            commands::device::cmd_read(cli, &config, output, *format)
        },
        Commands::Write { input, yes } => commands::device::cmd_write(cli, &config, input, *yes),
        Commands::Verify { input } => commands::device::cmd_verify(cli, &config, input),
        Commands::Hash { input } => commands::image::cmd_hash(cli, &config, input),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}
