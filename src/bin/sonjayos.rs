use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use sonjayos_provision::config::Mode;
use sonjayos_provision::error::exit_code_for;
use sonjayos_provision::logging::{self, LoggingConfig};

mod workflows;

#[derive(Parser, Debug)]
#[command(
    name = "sonjayos",
    version,
    about = "Provision, run and package SonjayOS",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct GlobalArgs {
    /// Provisioning config (TOML). Defaults to the user, then the system config.
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) config: Option<PathBuf>,

    /// Directory treated as `/` by every filesystem operation.
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) root: Option<PathBuf>,

    /// More diagnostics (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Errors only.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub(crate) quiet: bool,

    /// Emit diagnostics as JSON lines.
    #[arg(long, global = true)]
    pub(crate) log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// First-time setup: run every stage, then start the services under systemd.
    Install {
        #[arg(long, value_enum, default_value_t = Mode::Production)]
        mode: Mode,

        /// Provision only; leave the services stopped.
        #[arg(long)]
        no_start: bool,

        /// Directory holding the service code (`src/`) to deploy. Overrides
        /// `application.source_dir` from the config.
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,
    },

    /// Development services, supervised by this process.
    Dev {
        #[command(subcommand)]
        action: ModeAction,
    },

    /// Production services, supervised by systemd.
    Prod {
        #[command(subcommand)]
        action: ModeAction,
    },

    /// Build an unattended installer image from an Ubuntu live ISO.
    Iso(workflows::IsoArgs),

    /// List recorded pipeline runs.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub(crate) enum ModeAction {
    Start {
        /// Return once the services are up instead of supervising them
        /// (development only).
        #[arg(long)]
        detach: bool,
    },
    Stop,
    Status,
    Restart {
        #[arg(long)]
        detach: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(LoggingConfig::from_flags(
        cli.global.verbose,
        cli.global.quiet,
        cli.global.log_json,
    ));

    let result = match cli.command {
        Command::Install {
            mode,
            no_start,
            source,
        } => workflows::install(&cli.global, mode, no_start, source.as_deref()),
        Command::Dev { action } => workflows::run_mode(&cli.global, Mode::Development, action),
        Command::Prod { action } => workflows::run_mode(&cli.global, Mode::Production, action),
        Command::Iso(args) => workflows::build_image(&args),
        Command::History { limit } => workflows::history(&cli.global, limit),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
