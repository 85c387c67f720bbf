// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mpkv broker service CLI.
//!
//! Owns one engine directory and serves shared-memory peers until the
//! last one releases its slot. Normally spawned by the first client for
//! a directory; running it by hand is useful for debugging and for
//! pre-warming the engine.
//!
//! # Usage
//!
//! ```bash
//! # Serve a store directory
//! mpkv-broker --db /var/lib/myapp/db
//!
//! # With logging
//! RUST_LOG=debug mpkv-broker --db ./db
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mpkv-broker")]
#[command(about = "mpkv broker - single owner of an engine directory", long_about = None)]
struct Args {
    /// Engine directory to own and serve
    #[arg(short, long)]
    db: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // A peer's Ctrl-C must not take the broker (and the engine) down
    // with it; shutdown happens through slot release.
    mpkv::broker::mask_signals();

    tracing::info!(db = %args.db, "broker starting");
    mpkv::broker::run(&args.db).with_context(|| format!("serving {}", args.db))?;
    tracing::info!("broker exited cleanly");
    Ok(())
}
