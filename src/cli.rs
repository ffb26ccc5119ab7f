//! Command-line parsing
//!
//! Long options go through clap. The power switches keep their slash form
//! (`/E`, `/-S`, ...) and are collected verbatim, then interpreted here.

use clap::Parser;
use clap::error::ErrorKind;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::constants::app;
use crate::ipc::FlagOverrides;

#[derive(Parser, Debug, Default, PartialEq, Eq)]
#[command(
    name = "sleep-preventer",
    version,
    about = "Keeps the machine awake from the system tray",
    disable_help_flag = true
)]
pub struct Cli {
    /// Config file (defaults to the executable path with a .cfg extension)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding the instance lock and socket
    #[arg(long, value_name = "DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Power switches: /E /-E /S /-S /D /-D, or /? for usage
    #[arg(value_name = "SWITCH", trailing_var_arg = true, allow_hyphen_values = true)]
    pub switches: Vec<String>,
}

/// What the process was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Print usage and exit without touching any instance
    Help,

    /// Start or signal the running instance with these overrides
    Run(FlagOverrides),
}

pub const USAGE: &str = "
SleepPreventer [/E | /-E] [/S | /-S] [/D | /-D]

  /E    Enable prevention
  /-E   Disable prevention
  /S    Enable sleep prevention
  /-S   Disable sleep prevention
  /D    Enable display-off prevention
  /-D   Disable display-off prevention
";

impl Cli {
    /// Parse the process arguments. Tokens clap cannot place are treated
    /// as switches, so an unknown option never aborts startup.
    pub fn parse_lenient<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        match Self::try_parse_from(&args) {
            Ok(cli) => cli,
            Err(e) if e.kind() == ErrorKind::DisplayVersion => e.exit(),
            Err(e) => {
                warn!(error = ?e.kind(), "Falling back to switch-only argument parsing");
                Self {
                    switches: args
                        .iter()
                        .skip(1)
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                    ..Self::default()
                }
            }
        }
    }

    pub fn action(&self) -> Action {
        parse_switches(&self.switches)
    }
}

/// A token asks for help when its second character is `?`, `H` or `h`
fn is_help(arg: &str) -> bool {
    matches!(arg.chars().nth(1), Some('?' | 'H' | 'h'))
}

/// Interpret the switch list; later switches override earlier ones
pub fn parse_switches<S: AsRef<str>>(switches: &[S]) -> Action {
    let mut overrides = FlagOverrides::default();

    for arg in switches.iter().map(AsRef::as_ref) {
        if is_help(arg) {
            return Action::Help;
        }

        match arg.to_ascii_uppercase().as_str() {
            "/E" => overrides.enable = Some(true),
            "/-E" => overrides.enable = Some(false),
            "/S" => overrides.system = Some(true),
            "/-S" => overrides.system = Some(false),
            "/D" => overrides.display = Some(true),
            "/-D" => overrides.display = Some(false),
            _ => debug!(arg, "Ignoring unrecognized argument"),
        }
    }

    Action::Run(overrides)
}

pub fn print_usage() {
    println!("{USAGE}");
    debug!(app = app::NAME, "Printed usage");
}
