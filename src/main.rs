use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use mountkeeper::modules::constants::{DEFAULT_FS_NAME, FORCE_UNMOUNT_ATTEMPTS};
use mountkeeper::{
    force_unmount_many_times, FuseAuthority, LogObserver, MountController, MountRecord, Registry,
    Scope, SnapshotFs,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding the records of served mounts
    #[arg(long, global = true, env = "MNTK_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a read-only snapshot of a directory at a mount point
    Mount {
        /// Directory to expose
        source: PathBuf,
        /// Mount point
        mount_point: PathBuf,
        /// Who else may access the mount: "root" or "other"
        #[arg(long, default_value = "")]
        allow: String,
        /// FUSE fsname reported to the kernel
        #[arg(long, default_value = DEFAULT_FS_NAME)]
        fs_name: String,
    },
    /// List mounts served by mntk processes
    List {
        /// Drop records whose serving process is gone
        #[arg(short = 'p', long = "purge")]
        purge: bool,
    },
    /// Ask the process serving a mount to unmount it
    Stop {
        /// Mount ID as printed by `mount` and `list`
        id: Uuid,
    },
    /// Release a mount point left behind by a dead process
    Unmount {
        /// Mount point
        mount_point: PathBuf,
        /// Forced unmount attempts
        #[arg(long, default_value_t = FORCE_UNMOUNT_ATTEMPTS)]
        attempts: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let state_dir = cli
        .state_dir
        .unwrap_or_else(|| std::env::temp_dir().join("mntk").join("mounts"));
    let registry = Registry::new(state_dir)?;

    match cli.command {
        Commands::Mount {
            source,
            mount_point,
            allow,
            fs_name,
        } => serve(&registry, source, mount_point, &allow, fs_name).await?,
        Commands::List { purge } => {
            if purge {
                let purged = registry.purge_stale()?;
                println!("Purged {} stale records", purged);
            }
            let records = registry.list()?;
            println!("Active mounts:");
            for record in records {
                println!("ID: {}", record.id);
                println!("  PID: {}", record.pid);
                println!("  Mount point: {}", record.mountpoint.display());
                println!("  Source: {}", record.source.display());
                println!("  Allow: {}", record.policy);
                if !record.is_alive() {
                    println!("  (serving process is gone)");
                }
                println!();
            }
        }
        Commands::Stop { id } => {
            let record = registry.stop(&id)?;
            println!(
                "Asked pid {} to unmount {}",
                record.pid,
                record.mountpoint.display()
            );
        }
        Commands::Unmount {
            mount_point,
            attempts,
        } => release(&registry, &mount_point, attempts).await?,
    }

    Ok(())
}

async fn serve(
    registry: &Registry,
    source: PathBuf,
    mount_point: PathBuf,
    allow: &str,
    fs_name: String,
) -> Result<()> {
    let fs = SnapshotFs::new(&source)?;
    let mount_point = fs::canonicalize(&mount_point)?;
    info!(
        "Serving {} entries from {}",
        fs.len(),
        fs.source().display()
    );

    let shutdown = watch_signals()?;
    let node = Scope::root("mntk");
    let controller = MountController::new(FuseAuthority::with_fs_name(fs_name));
    let mount = controller
        .mount(&node, Arc::new(fs.clone()), &mount_point, allow)
        .await?;

    let record = MountRecord::new(
        mount.mount_point().to_path_buf(),
        fs.source().to_path_buf(),
        mount.policy(),
    );
    if let Err(e) = registry.register(&record) {
        error!("Failed to record mount: {}", e);
    }
    println!("{}", record.id);

    tokio::select! {
        signal = shutdown => match signal {
            Ok(sig) => info!("Received signal {}, unmounting...", sig),
            Err(_) => warn!("Signal watcher stopped, unmounting..."),
        },
        _ = mount.serve_exited() => {
            warn!("Serve loop for {} exited, releasing", mount.mount_point().display())
        }
        _ = node.closed() => info!("Node scope closed"),
    }

    let result = node.close().await;
    registry.remove(&record.id)?;
    result?;
    Ok(())
}

/// Forwards the first SIGINT or SIGTERM to the async side.
fn watch_signals() -> Result<oneshot::Receiver<i32>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                let _ = tx.send(sig);
            }
        })?;
    Ok(rx)
}

async fn release(registry: &Registry, mount_point: &Path, attempts: usize) -> Result<()> {
    // A dead FUSE mount fails every stat, so fall back to the path as given.
    let mount_point = &fs::canonicalize(mount_point).unwrap_or_else(|_| mount_point.to_path_buf());
    if let Some(record) = registry.find_by_mountpoint(mount_point)? {
        if record.is_alive() {
            return Err(anyhow!(
                "{} is served by pid {}, use `mntk stop {}`",
                mount_point.display(),
                record.pid,
                record.id
            ));
        }
        registry.remove(&record.id)?;
    }

    let authority = Arc::new(FuseAuthority::<SnapshotFs>::new());
    force_unmount_many_times(&authority, mount_point, attempts, &LogObserver).await?;
    println!("Unmounted {}", mount_point.display());
    Ok(())
}
