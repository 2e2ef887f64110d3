// Copyright (c) 2026 Murk Developers. MIT License.
// See LICENSE for details.

//! # murk-node
//!
//! Operator tooling around the murk router core:
//!
//! - `init`      create keys in a data directory; relays also get a signed contact
//! - `inspect`   decode a contact or bootstrap file and verify each entry
//! - `bootstrap` bundle relay contacts into one bootstrap list
//! - `version`   print build and protocol versions
//!
//! Command output goes to stdout as plain text or JSON; logs go to stderr.

mod cli;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;

use murk_router::time::now_ms;

use cli::{Commands, MurkNodeCli};

fn main() -> Result<()> {
    let cli = MurkNodeCli::parse();
    logging::init_logging("murk_node=info,murk_router=info", cli.log_format.into());

    match cli.command {
        Commands::Init(args) => {
            let outcome = commands::init_node(&args, now_ms())?;
            println!("Router initialized.");
            println!("  Data directory : {}", args.data_dir.display());
            println!("  Router id      : {}", outcome.router_id);
            match &outcome.rc {
                Some(rc) => {
                    println!("  Mode           : relay");
                    for addr in &rc.addrs {
                        println!("  Address        : {}", addr.addr);
                    }
                }
                None => println!("  Mode           : client"),
            }
            Ok(())
        }
        Commands::Inspect(args) => {
            for report in commands::inspect(&args, now_ms())? {
                println!("{report:#}");
            }
            Ok(())
        }
        Commands::Bootstrap(args) => {
            let written = commands::bundle_bootstrap(&args, now_ms())?;
            println!("Wrote {written} contacts to {}", args.out.display());
            Ok(())
        }
        Commands::Version => {
            for line in commands::version_lines() {
                println!("{line}");
            }
            Ok(())
        }
    }
}
