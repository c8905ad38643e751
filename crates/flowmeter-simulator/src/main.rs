//! Desktop simulator for the flowmeter state store.
//!
//! Runs the same [`SyncCoordinator`] the firmware runs, against host files
//! standing in for each storage medium, with a synthetic flow sensor.
//!
//! # Commands
//!
//! | Command | Action |
//! |---|---|
//! | `run` | boot, count synthetic pulses, flush on the configured interval |
//! | `dump` | print every persisted entry as stored |
//! | `init` | write the compiled defaults to the medium |
//! | `edit KEY [VALUE]` | set or clear one persisted field, unchecked |
//! | `calibrate ML` | set millilitres per pulse and save immediately |
//! | `calibrate --ml ML --pulses N` | calibrate from a measured run |
//! | `reset` | zero the cumulative usage |
//! | `report` | print the usage report as JSON |
//!
//! Options can also come from the environment or a `.env` file
//! (`FLOWMETER_BACKEND`, `FLOWMETER_DATA_DIR`, `RUST_LOG`).

mod media;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use flowmeter_core::announce::{ANNOUNCE_PORT, announcement, broadcast_address};
use flowmeter_core::clock::{Clock, ManualClock, SystemClock};
use flowmeter_core::config::{
    BackendKind, Config, FLAT_FILE_NAME, JSON_FILE_NAME, NVM_IMAGE_FILE_NAME, PAGED_KV_FILE_NAME,
};
use flowmeter_core::storage::paged_kv::DEFAULT_PAGE_COUNT;
use flowmeter_core::storage::{Backend, FlatFileBackend, JsonBackend, NvmBackend, PagedKvBackend, StdFs};
use flowmeter_core::{PulseCounter, SyncCoordinator, TickOutcome};

use media::{FileBlockDevice, FileNvm, NVM_IMAGE_SIZE};

/// Live pulse counter, as the sensor interrupt would see it
static PULSES: PulseCounter = PulseCounter::new();

/// Step of the simulated main loop
const TICK: Duration = Duration::from_secs(1);

/// flowmeter-simulator - exercise the flowmeter state store on the desktop
#[derive(Parser, Debug)]
#[command(name = "flowmeter-simulator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage medium: flat-file, paged-kv, json or nvm
    #[arg(long, env = "FLOWMETER_BACKEND")]
    backend: Option<BackendKind>,

    /// Directory holding the medium images
    #[arg(long, env = "FLOWMETER_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot and count synthetic pulses
    Run {
        /// Simulated seconds to run for
        #[arg(long, default_value_t = 1800)]
        seconds: u64,

        /// Sensor pulses per second
        #[arg(long, default_value_t = 5.0)]
        flow_hz: f64,

        /// Advance a simulated clock instead of waiting on the real one
        #[arg(long)]
        fast: bool,

        /// Override the flush interval in seconds
        #[arg(long)]
        flush_interval: Option<u32>,
    },
    #[command(flatten)]
    Admin(AdminCommand),
}

/// One-shot maintenance of the persisted record
#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Print every persisted entry as stored
    Dump,
    /// Write the compiled defaults to the medium
    Init,
    /// Set or clear one persisted field without validation
    Edit { key: String, value: Option<String> },
    /// Set millilitres per pulse, directly or from a measured run
    Calibrate {
        /// Millilitres per pulse
        #[arg(required_unless_present = "ml", conflicts_with = "ml")]
        ml_per_pulse: Option<String>,
        /// Millilitres collected during the measured run
        #[arg(long, requires = "pulses")]
        ml: Option<f32>,
        /// Pulses counted during the measured run
        #[arg(long, requires = "ml")]
        pulses: Option<u32>,
    },
    /// Zero the cumulative usage
    Reset,
    /// Print the usage report as JSON
    Report,
}

fn open_backend(kind: BackendKind, data_dir: &Path) -> Result<Box<dyn Backend>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let fs = StdFs::new(data_dir);

    let backend: Box<dyn Backend> = match kind {
        BackendKind::FlatFile => Box::new(FlatFileBackend::new(fs, FLAT_FILE_NAME)),
        BackendKind::Json => Box::new(JsonBackend::new(fs, JSON_FILE_NAME)),
        BackendKind::PagedKv => {
            let path = data_dir.join(PAGED_KV_FILE_NAME);
            let device = FileBlockDevice::open(&path, DEFAULT_PAGE_COUNT)
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(PagedKvBackend::open(device).map_err(anyhow::Error::msg)?)
        }
        BackendKind::Nvm => {
            let path = data_dir.join(NVM_IMAGE_FILE_NAME);
            let nvm = FileNvm::open(&path, NVM_IMAGE_SIZE)
                .with_context(|| format!("opening {}", path.display()))?;
            Box::new(NvmBackend::new(nvm, 0))
        }
    };
    info!("Using the {} backend in {}", backend.name(), data_dir.display());
    Ok(backend)
}

/// Run the main loop for `seconds` simulated seconds.
fn run<C: Clock>(
    sync: &mut SyncCoordinator<'_, Box<dyn Backend>, C>,
    seconds: u64,
    flow_hz: f64,
    mut wait: impl FnMut(),
) {
    let ip = Ipv4Addr::LOCALHOST;
    info!(
        "{} (broadcast to {}:{})",
        announcement(&sync.persisted().hostname, ip, ANNOUNCE_PORT),
        broadcast_address(ip, Ipv4Addr::new(255, 0, 0, 0)),
        ANNOUNCE_PORT
    );

    let mut owed = 0.0;
    for _ in 0..seconds {
        owed += flow_hz;
        while owed >= 1.0 {
            PULSES.record_pulse();
            owed -= 1.0;
        }

        wait();
        match sync.tick() {
            TickOutcome::Saved => info!("Flushed usage={}", sync.persisted().usage),
            TickOutcome::Failed => warn!("Flush failed, retrying next tick"),
            TickOutcome::Clean | TickOutcome::Throttled => {}
        }
    }

    if let Err(e) = sync.save_now() {
        error!("Final save failed: {}", e);
    }
}

fn admin<C: Clock>(
    mut sync: SyncCoordinator<'_, Box<dyn Backend>, C>,
    command: AdminCommand,
) -> Result<()> {
    match command {
        AdminCommand::Dump => {
            for entry in sync.dump().map_err(anyhow::Error::msg)? {
                println!("{entry}");
            }
        }
        AdminCommand::Init => {
            let record = sync.initialize().map_err(anyhow::Error::msg)?;
            println!("Initialized: {record:?}");
        }
        AdminCommand::Edit { key, value } => {
            let record = sync
                .raw_edit(&key, value.as_deref())
                .map_err(anyhow::Error::msg)?;
            println!("Reloaded: {record:?}");
        }
        AdminCommand::Calibrate {
            ml_per_pulse,
            ml,
            pulses,
        } => {
            sync.load();
            match (ml_per_pulse, ml, pulses) {
                (Some(input), _, _) => sync.calibrate_from_str(&input),
                (None, Some(ml), Some(pulses)) => sync.calibrate_from_measurement(ml, pulses),
                _ => anyhow::bail!("calibrate needs ML, or --ml together with --pulses"),
            }
            .map_err(anyhow::Error::msg)?;
            println!("ml_per_pulse = {}", sync.persisted().ml_per_pulse);
        }
        AdminCommand::Reset => {
            sync.load();
            sync.reset_usage().map_err(anyhow::Error::msg)?;
            println!("usage = {}", sync.persisted().usage);
        }
        AdminCommand::Report => {
            sync.load();
            println!("{}", serde_json::to_string_pretty(&sync.report())?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::init();
    let args = Args::parse();

    let config_text = match &args.config {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => String::new(),
    };
    let config: Config = if config_text.is_empty() {
        Config::default()
    } else {
        serde_json::from_str(&config_text).context("parsing configuration")?
    };

    let kind = args.backend.unwrap_or(config.backend);
    let backend = open_backend(kind, &args.data_dir)?;
    let system_clock = SystemClock::new();

    match args.command {
        Command::Run {
            seconds,
            flow_hz,
            fast,
            flush_interval,
        } => {
            let mut sync_config = config.sync;
            if let Some(secs) = flush_interval {
                sync_config = sync_config.with_flush_interval_secs(secs);
            }
            info!(
                "Simulating {} s at {} pulses/s, flushing every {} s",
                seconds, flow_hz, sync_config.flush_interval_secs
            );

            if fast {
                let clock = ManualClock::new(system_clock.now());
                let mut sync = SyncCoordinator::new(backend, &clock, &PULSES, sync_config);
                sync.boot();
                run(&mut sync, seconds, flow_hz, || clock.advance_secs(1));
                println!("{}", serde_json::to_string_pretty(&sync.report())?);
            } else {
                let mut sync = SyncCoordinator::new(backend, &system_clock, &PULSES, sync_config);
                sync.boot();
                run(&mut sync, seconds, flow_hz, || std::thread::sleep(TICK));
                println!("{}", serde_json::to_string_pretty(&sync.report())?);
            }
        }
        Command::Admin(command) => {
            let sync = SyncCoordinator::new(backend, &system_clock, &PULSES, config.sync);
            admin(sync, command)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowmeter_core::clock::from_unix_secs;
    use flowmeter_core::config::SyncConfig;

    fn calibrate(args: &[&str]) -> Result<AdminCommand, clap::Error> {
        let argv = ["flowmeter-simulator", "--backend", "json", "calibrate"];
        let args = Args::try_parse_from(argv.iter().chain(args))?;
        match args.command {
            Command::Admin(command) => Ok(command),
            other => panic!("expected an admin command, got {other:?}"),
        }
    }

    #[test]
    fn calibrate_takes_a_value_or_a_measured_run() {
        assert!(matches!(
            calibrate(&["1.25"]).unwrap(),
            AdminCommand::Calibrate { ml_per_pulse: Some(v), ml: None, pulses: None } if v == "1.25"
        ));
        assert!(matches!(
            calibrate(&["--ml", "1000", "--pulses", "800"]).unwrap(),
            AdminCommand::Calibrate { ml_per_pulse: None, ml: Some(_), pulses: Some(800) }
        ));

        assert!(calibrate(&[]).is_err());
        assert!(calibrate(&["--ml", "1000"]).is_err());
        assert!(calibrate(&["1.25", "--ml", "1000", "--pulses", "800"]).is_err());
    }

    #[test]
    fn measured_run_sets_the_calibration() {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = ManualClock::new(from_unix_secs(1_700_000_000));
        let pulses = PulseCounter::new();

        let backend = open_backend(BackendKind::Json, dir.path()).unwrap();
        let sync = SyncCoordinator::new(backend, &clock, &pulses, SyncConfig::default());
        admin(sync, calibrate(&["--ml", "1000", "--pulses", "800"]).unwrap()).unwrap();

        let mut backend = open_backend(BackendKind::Json, dir.path()).unwrap();
        assert_eq!(backend.try_load().unwrap().ml_per_pulse, 1.25);

        let sync = SyncCoordinator::new(backend, &clock, &pulses, SyncConfig::default());
        assert!(admin(sync, calibrate(&["--ml", "1000", "--pulses", "0"]).unwrap()).is_err());
    }
}
