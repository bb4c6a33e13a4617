// This file is part of xgqd, a host-side service for the XGQ command queue of PCIe FPGA accelerator cards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xgqd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xgqd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.


mod load;
mod proxies;
mod set;
mod status;

use crate::load::load_handler;
use crate::set::set_handler;
use crate::status::status_handler;
use clap::{Parser, Subcommand, ValueEnum, arg, command};
use log::{debug, error};
use std::error::Error;

#[derive(Parser, Debug)]
#[command(name = "xgq")]
#[command(bin_name = "xgq")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum LoadSubcommand {
    /// Download an xclbin into a slot
    Xclbin {
        #[arg(value_name = "FILE")]
        file: String,
        #[arg(long, default_value_t = 0)]
        slot: u32,
    },
    Pdi {
        #[arg(value_name = "FILE")]
        file: String,
    },
    ApuBin {
        #[arg(value_name = "FILE")]
        file: String,
    },
    /// Flash a new management firmware image. Restart services afterwards to run it.
    Vmr {
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[derive(ValueEnum, Clone, Debug)]
enum ServicesAction {
    Start,
    Stop,
    Restart,
}

#[derive(Subcommand, Debug)]
enum SetSubcommand {
    /// Start, stop or restart the command queue services
    Services {
        #[arg(value_enum)]
        action: ServicesAction,
    },
    /// Select the flash partition used on the next boot
    Multiboot {
        #[arg(long)]
        backup: bool,
    },
    /// Reset the processing system
    Srst,
    /// Flash the satellite controller from the image the firmware holds, then wait for it
    Scfw,
    ClockScaling {
        #[arg(long)]
        disable: bool,
        /// Power limit override in watts
        #[arg(long)]
        power_limit: Option<u32>,
        /// Temperature limit override in degrees Celsius
        #[arg(long)]
        temp_limit: Option<u32>,
    },
    ClockScalingDefaults,
    /// Set the clock frequencies of a region, in MHz
    Clocks {
        #[arg(long, default_value_t = 0)]
        region: u32,
        #[arg(required = true, num_args = 1..=4)]
        freqs: Vec<u32>,
    },
}

#[derive(Subcommand, Debug)]
enum StatusSubcommand {
    Vmr,
    Sc,
    ClockScaling,
    /// Current frequency of one clock, in MHz
    Clock {
        #[arg(long, default_value_t = 0)]
        region: u32,
        #[arg(default_value_t = 0)]
        clock: u32,
    },
    /// Dump a firmware log page, such as `shell_interface_uuid`
    LogPage {
        page: String,
    },
    Firewall,
    /// Firmware log captured the last time the channel went offline
    Diagnostic,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download or flash an image through the command queue
    Load {
        #[command(subcommand)]
        command: LoadSubcommand,
    },
    Set {
        #[command(subcommand)]
        command: SetSubcommand,
    },
    /// Show the service and firmware status
    Status {
        #[command(subcommand)]
        command: Option<StatusSubcommand>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");
    let result = match cli.command {
        Commands::Load { command } => load_handler(&command).await,
        Commands::Set { command } => set_handler(&command).await,
        Commands::Status { command } => status_handler(&command).await,
    };
    match result {
        Ok(msg) => {
            println!("{msg}");
            Ok(())
        }
        Err(e) => {
            error!("{e}");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clocks_takes_at_most_four_frequencies() {
        let cli = Cli::try_parse_from(["xgq", "set", "clocks", "--region", "1", "300", "250"])
            .expect("valid clocks command");
        match cli.command {
            Commands::Set {
                command: SetSubcommand::Clocks { region, freqs },
            } => {
                assert_eq!(region, 1);
                assert_eq!(freqs, vec![300, 250]);
            }
            other => panic!("parsed into {other:?}"),
        }
        assert!(Cli::try_parse_from(["xgq", "set", "clocks", "1", "2", "3", "4", "5"]).is_err());
    }

    #[test]
    fn test_scfw_takes_no_file() {
        let cli = Cli::try_parse_from(["xgq", "set", "scfw"]).expect("valid scfw command");
        assert!(matches!(
            cli.command,
            Commands::Set {
                command: SetSubcommand::Scfw
            }
        ));
        assert!(Cli::try_parse_from(["xgq", "set", "scfw", "sc.bin"]).is_err());
        assert!(Cli::try_parse_from(["xgq", "load", "scfw", "sc.bin"]).is_err());
    }

    #[test]
    fn test_status_without_subcommand() {
        let cli = Cli::try_parse_from(["xgq", "status"]).expect("valid status command");
        assert!(matches!(cli.command, Commands::Status { command: None }));
    }
}
