//! Developer helper for building the `speedlimit-ebpf` crate for the `bpf`
//! target and copying the result where the control plane expects to find
//! it by default (`Settings::bpf_obj_path`). Not part of the shipped
//! binary; invoked as `cargo xtask build-ebpf [--release]`.
use std::process::Command;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-compile the eBPF filter object for the bpfel target.
    BuildEbpf {
        #[arg(long)]
        release: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::BuildEbpf { release } => build_ebpf(release),
    }
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut args = vec![
        "build",
        "-p",
        "speedlimit-ebpf",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ];
    if release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("failed to spawn cargo for the eBPF build")?;

    if !status.success() {
        bail!("cargo build for speedlimit-ebpf failed: {status}");
    }
    Ok(())
}
