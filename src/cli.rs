use std::path::PathBuf;
use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    /// Path to a config file. Defaults to `config.toml` in the user config directory
    #[clap(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Directory of formula files. Overrides the config file
    #[clap(long, global = true)]
    pub(crate) formula_dir: Option<PathBuf>,
    /// More log output (-v info, -vv debug). `RUST_LOG` takes precedence
    #[clap(short, long, global = true, action = ArgAction::Count)]
    pub(crate) verbose: u8,
    #[command(subcommand)]
    pub(crate) command: FormularyCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum FormularyCommand {
    /// Loads every formula and reports conflicts. Fails if any record is rejected
    Check,
    /// Shows the resolved formula and its aliases
    Info {
        name: String,
        /// A specific version instead of the latest
        #[clap(long)]
        version: Option<String>,
    },
    /// Lists other names published from the same source archive
    Aliases {
        name: String,
    },
    /// Prints the toolchain arguments a build would use
    Flags {
        name: String,
        #[clap(long)]
        version: Option<String>,
    },
    /// Compares formulas with their latest upstream release. Defaults to all
    Livecheck {
        name: Option<String>,
        /// Extra attempts when the upstream host is unavailable
        #[clap(long)]
        retries: Option<u32>,
    },
    /// Builds, installs, and verifies a formula
    Install {
        /// Formula to install. Required unless `--all` is given
        name: Option<String>,
        #[clap(long)]
        version: Option<String>,
        /// Install the latest version of every formula
        #[clap(long, conflicts_with_all = ["name", "version"])]
        all: bool,
        /// Install prefix. Overrides the config file
        #[clap(long)]
        prefix: Option<PathBuf>,
        /// Keep binaries that fail verification instead of removing them
        #[clap(long)]
        keep_unverified: bool,
    },
    /// Runs an installed binary and checks its output
    Verify {
        artifact: PathBuf,
        expected: String,
        /// Arguments to run with. Defaults to `--version`
        #[clap(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Empties the source archive cache
    Clean,
}
