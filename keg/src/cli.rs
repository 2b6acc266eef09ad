// keg/src/cli.rs
//! Defines the command-line argument structure using clap.
use clap::{ArgAction, Parser, Subcommand};
use keg_common::error::Result;
use keg_common::pipeline::CancellationFlag;
use keg_common::Config;

pub mod info;
pub mod install;
pub mod list;
pub mod status;
pub mod uninstall;

use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::uninstall::Uninstall;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "keg", bin_name = "keg")]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve, fetch, build and install formulae
    Install(InstallArgs),
    /// Remove installed formulae
    Uninstall(Uninstall),
    /// List installed formulae
    List(List),
    /// Show a formula and the artifact that would be installed
    Info(Info),
}

impl Command {
    /// Runs the command and returns the process exit code.
    pub async fn run(&self, config: Config, cancel: CancellationFlag) -> Result<i32> {
        match self {
            Self::Install(command) => command.run(config, cancel).await,
            Self::Uninstall(command) => command.run(&config),
            Self::List(command) => command.run(&config),
            Self::Info(command) => command.run(&config),
        }
    }
}
