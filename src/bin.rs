use clap::{Parser, Subcommand};
use simshim::{ClockSource, IdentitySource, ShimConfig, SimContext};

extern crate simshim;

/// Inspect the simulated environment the way a shimmed process sees it.
#[derive(Parser)]
#[command(name = "simshim", version)]
struct Cli {
    /// Shared memory object holding the simulated clock.
    #[arg(long)]
    region: Option<String>,

    /// Directory holding users.sim (default: next to $SLURM_CONF).
    #[arg(long)]
    users_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print time() and one gettimeofday() reading.
    Time,
    /// Look up a user by name.
    User { name: String },
    /// Look up a user by uid.
    Uid { uid: u32 },
    /// Dump the shared region.
    Region,
    /// Write the simulated seconds, as a driver would.
    SetTime { seconds: u32 },
}

fn context(cli: &Cli) -> SimContext {
    let mut config = ShimConfig::from_env();
    if let Some(region) = &cli.region {
        config = config.with_region_name(region.clone());
    }
    if let Some(dir) = &cli.users_dir {
        config = config.with_users_dir(dir.clone());
    }
    SimContext::new(config)
}

pub fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    let ctx = context(&cli);

    match cli.command {
        Command::Time => {
            let clock = ctx.clock();
            let source = if clock.is_simulated() { "simulated" } else { "real" };
            println!("time: {} ({})", clock.time(), source);
            let tv = clock.time_of_day();
            println!("gettimeofday: {}.{:06}", tv.seconds, tv.micros);
        }
        Command::User { name } => {
            let record = ctx.identity().resolve_by_name(&name)?;
            println!("{}:{}:{}", record.name, record.uid, record.gid);
        }
        Command::Uid { uid } => {
            let record = ctx.identity().resolve_by_uid(uid)?;
            println!("{}:{}:{}", record.name, record.uid, record.gid);
        }
        Command::Region => {
            let region = ctx.region().ensure_attached()?;
            println!("{:#?}", region);
        }
        Command::SetTime { seconds } => {
            let region = ctx.region().ensure_attached()?;
            region.set_simulated_seconds(seconds);
            println!("simulated seconds set to {}", seconds);
        }
    }
    Ok(())
}
