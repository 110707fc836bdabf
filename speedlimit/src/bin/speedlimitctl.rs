use std::path::PathBuf;

use clap::{Parser, Subcommand};
use speedlimit::reconciler::MoveTarget;
use speedlimit::{AttachMode, Reconciler, Settings};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a rate limit, optionally moving a PID into it.
    Set {
        /// Decimal bytes/sec, optionally suffixed with k/K (1024) or m/M (1024^2).
        #[arg(long)]
        rate: String,
        /// Same notation as --rate; defaults to --rate if omitted.
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        pid: Option<i32>,
        #[arg(long)]
        object: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "link")]
        mode: ModeArg,
    },
    /// Migrate a PID into an existing rule.
    Move {
        #[arg(long)]
        pid: i32,
        #[arg(long, conflicts_with_all = ["key", "last"])]
        path: Option<PathBuf>,
        #[arg(long, conflicts_with_all = ["path", "last"])]
        key: Option<u64>,
        #[arg(long, conflicts_with_all = ["path", "key"])]
        last: bool,
    },
    /// Revert a PID's limits, restoring its pre-limit cgroup.
    Unset {
        #[arg(long)]
        pid: i32,
    },
    /// Reattach the filter, preserving every rule's configuration.
    Reload {
        #[arg(long)]
        object: Option<PathBuf>,
    },
    /// Detach and unpin the filter and maps; rule directories survive.
    Unload,
    /// Enumerate managed rules.
    List,
    /// Full teardown: detach, unpin, remove the pin namespace.
    Purge,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Link,
    Direct,
}

impl From<ModeArg> for AttachMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Link => AttachMode::Link,
            ModeArg::Direct => AttachMode::Direct,
        }
    }
}

fn main() {
    speedlimit::logging::init();
    if let Err(e) = dispatch() {
        tracing::error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

fn dispatch() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve()?;
    let reconciler = Reconciler::new(&settings);
    run(&reconciler, &settings, cli.command)?;
    Ok(())
}

fn run(reconciler: &Reconciler, settings: &Settings, command: Commands) -> speedlimit::Result<()> {
    match command {
        Commands::Set { rate, bucket, pid, object, mode } => {
            let obj_path = object.unwrap_or_else(|| settings.bpf_obj_path.clone());
            let rate_bps = speedlimit::parse_size(&rate)?;
            let bucket_size = bucket.map(|b| speedlimit::parse_size(&b)).transpose()?;
            let path = reconciler.set(pid, rate_bps, bucket_size, mode.into(), &obj_path)?;
            println!("{}", path.display());
        }
        Commands::Move { pid, path, key, last } => {
            let target = if let Some(path) = path {
                MoveTarget::Path(path)
            } else if let Some(key) = key {
                MoveTarget::Key(key)
            } else if last {
                MoveTarget::Last
            } else {
                return Err(speedlimit::LimiterError::RuleMalformed(
                    "move requires one of --path, --key, --last".into(),
                ));
            };
            let path = reconciler.move_pid(pid, target)?;
            println!("{}", path.display());
        }
        Commands::Unset { pid } => reconciler.unset(pid)?,
        Commands::Reload { object } => reconciler.reload(object.as_deref(), None)?,
        Commands::Unload => {
            let (count, failed) = reconciler.unload()?;
            println!("detached {count} attachment(s), failed={failed}");
        }
        Commands::List => {
            for rule in reconciler.list()? {
                println!(
                    "{}\tkey={}\trate={}\tbucket={}\tprocs={}",
                    rule.path.display(),
                    rule.key,
                    rule.rate_bps,
                    rule.bucket_size,
                    rule.process_count
                );
            }
        }
        Commands::Purge => reconciler.purge()?,
    }
    Ok(())
}
