// SPDX-License-Identifier: Apache-2.0

//! Command-line surface. A single `serve` subcommand: this binary's only job
//! is to construct the core types from spec.md §4 and run them, not to grow
//! into a configuration subsystem (SPEC_FULL.md §C).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "beskar", about = "Beskar cluster node agent", version)]
pub struct Args {
	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
	/// Join (or form) a cluster and run this node's coordination fabric.
	Serve(ServeArgs),
}

#[derive(Debug, clap::Args)]
pub struct ServeArgs {
	/// Path to this node's TOML configuration file.
	#[arg(short, long)]
	pub config: PathBuf,
}
