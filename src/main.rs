//! CLI entry point.
//!
//! CLI parsing lives here, outside the core pull pipeline (spec §1 "out of
//! scope"); this binary just wires the library's traits to the environment
//! and reports the final outcome.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use vm_image_puller::cache::CacheStore;
use vm_image_puller::collaborators::{
    DefaultVmDirResolver, EnvSettings, FixedResourceHints, NullDiskConverter, Settings,
};
use vm_image_puller::config::PullConfig;
use vm_image_puller::orchestrator::PullOrchestrator;

#[derive(Parser)]
#[command(name = "vm-image-puller")]
#[command(about = "Pulls VM disk images distributed as OCI artifacts and reassembles them locally")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull an image and materialize it as a VM directory.
    Pull {
        /// Image reference, e.g. `trycua/macos-sequoia-vanilla:latest`.
        image: String,

        /// Name of the VM directory to create (defaults to a sanitized image name).
        #[arg(long)]
        name: Option<String>,

        /// Explicit VM directory path, bypassing the default resolver entirely.
        #[arg(long)]
        location: Option<PathBuf>,
    },

    /// List every image currently held in the local cache.
    ListCached,
}

#[tokio::main]
async fn main() -> ExitCode {
    vm_image_puller::logging::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Pull { image, name, location } => run_pull(&image, name.as_deref(), location.as_deref()).await,
        Command::ListCached => run_list_cached().await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run_pull(image: &str, name: Option<&str>, location: Option<&std::path::Path>) -> Result<(), String> {
    let settings = EnvSettings::from_env();
    let vm_dir_resolver = Box::new(DefaultVmDirResolver::new(default_vm_dir_base()));
    let resource_hints = Box::new(FixedResourceHints::default());
    let converter = Box::new(NullDiskConverter);

    let orchestrator = PullOrchestrator::new(&settings, vm_dir_resolver, resource_hints, converter, PullConfig::default())
        .map_err(|e| e.to_string())?;

    let outcome = orchestrator.pull(image, name, location).await.map_err(|e| e.to_string())?;

    println!(
        "pulled {image} -> {} ({} downloaded in {:.1}s)",
        outcome.vm_dir.display(),
        human_bytes(outcome.stats.downloaded_bytes),
        outcome.stats.elapsed.as_secs_f64()
    );

    Ok(())
}

async fn run_list_cached() -> Result<(), String> {
    let settings = EnvSettings::from_env();
    let cache = CacheStore::new(settings.cache_root(), settings.caching_enabled());

    let images = cache.enumerate_images().await.map_err(|e| e.to_string())?;
    if images.is_empty() {
        println!("no cached images");
        return Ok(());
    }

    for image in images {
        println!("{}  {}", image.short_image_id, image.repository);
    }
    Ok(())
}

fn default_vm_dir_base() -> PathBuf {
    std::env::var_os("VM_IMAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("vm-image-puller").join("vms"))
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}
