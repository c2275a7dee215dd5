//! Command-line interface of the `npdm` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::io::format::npdm_output;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

/// Logs a nicely formatted NPDM heading to the `npdm-output` logger.
pub fn log_heading() {
    let version = if let Some(ver) = VERSION {
        format!("v{ver}")
    } else {
        "v unknown".to_string()
    };
    npdm_output!("╭─────────────────────────────────────────────────────────────────────────────╮");
    npdm_output!("│                                                                             │");
    npdm_output!("│   N   N  PPPP   DDDD   M   M                                                │");
    npdm_output!("│   NN  N  P   P  D   D  MM MM     Spin-adapted n-particle reduced density    │");
    npdm_output!("│   N N N  PPPP   D   D  M M M     matrices from DMRG wavefunctions           │");
    npdm_output!("│   N  NN  P      D   D  M   M                                                │");
    npdm_output!("│   N   N  P      DDDD   M   M                                  {version:>13} │");
    npdm_output!("│                                                                             │");
    npdm_output!("╰─────────────────────────────────────────────────────────────────────────────╯");
    npdm_output!("");
}

/// Command-line arguments of the `npdm` binary.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// The YAML input file. If absent, a default reference sweep is run.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// The file to which the main output is also written.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Increases the verbosity of the diagnostic log. May be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
