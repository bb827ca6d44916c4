// src/main.rs

use anyhow::{Context, Result, bail};
use appman_installer::config::InstallerConfig;
use appman_installer::location::parse_locations;
use appman_installer::packager::collect_package_files;
use appman_installer::signature::SigningKeyPair;
use appman_installer::{
    InstallationReport, InstallerContext, InstallerEvent, MemoryRegistry, PackageCreator,
    PackageInstaller, spawn_registry, sudo,
};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_yaml::Mapping;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use tracing::info;

#[derive(Parser)]
#[command(name = "appman-installer")]
#[command(author, version, about = "Install and remove application packages", long_about = None)]
struct Cli {
    /// Installer configuration file
    #[arg(short, long, default_value = "/etc/appman/installer.toml", global = true)]
    config: PathBuf,

    /// More output (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a package from a file or an http(s) URL
    Install {
        /// Package file path or URL
        source: String,
        /// Installation location id (default: the default location)
        #[arg(short, long)]
        location: Option<String>,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Remove an installed application
    Remove {
        /// Application id
        id: String,
        /// Keep the application's document directory
        #[arg(long)]
        keep_documents: bool,
        /// Remove even if the removable medium is missing
        #[arg(short, long)]
        force: bool,
    },
    /// Repair the installation state after an interrupted operation
    Cleanup,
    /// List the configured installation locations
    Locations,
    /// Generate a signing key pair
    Keygen {
        /// Secret key output file
        private: PathBuf,
        /// Public key output file
        public: PathBuf,
        /// Key identifier stored with the key
        #[arg(long)]
        key_id: Option<String>,
    },
    /// Create a package from an application directory
    CreatePackage {
        /// Application directory containing info.yaml and the icon
        dir: PathBuf,
        /// Package output file
        output: PathBuf,
        /// Package id (default: the id in info.yaml)
        #[arg(long)]
        id: Option<String>,
        /// Sign as developer with this private key file
        #[arg(long)]
        developer_key: Option<PathBuf>,
        /// Sign as store with this private key file
        #[arg(long)]
        store_key: Option<PathBuf>,
        /// Bind the store signature to this device
        #[arg(long, requires = "store_key")]
        hardware_id: Option<String>,
        /// Unsigned extra metadata, KEY=VALUE
        #[arg(long = "extra", value_parser = parse_key_value)]
        extra: Vec<(String, String)>,
        /// Signed extra metadata, KEY=VALUE
        #[arg(long = "extra-signed", value_parser = parse_key_value)]
        extra_signed: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

fn to_mapping(pairs: Vec<(String, String)>) -> Mapping {
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn load_config(path: &Path) -> Result<InstallerConfig> {
    InstallerConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))
}

/// Fork the helper, load the installed applications and lock the installer
fn open_installer(config: InstallerConfig) -> Result<PackageInstaller> {
    // No threads may exist before the fork
    let sudo = sudo::fork_server(&config.privileges).context("Failed to start the privileged helper")?;

    let locations = parse_locations(&config)?;
    let mut registry = MemoryRegistry::new();
    let loaded = registry.load_installed(&config.manifest_dir, &locations, config.user_id_separation)?;
    info!("Found {} installed applications", loaded);

    let registry = spawn_registry(registry)?;
    let context = InstallerContext::new(config, registry, Arc::new(sudo))?;
    Ok(PackageInstaller::new(Arc::new(context))?)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Follow a task until it ends, driving the acknowledgment
fn follow_task(
    installer: &PackageInstaller,
    events: &Receiver<InstallerEvent>,
    task_id: &str,
    assume_yes: bool,
) -> Result<()> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.green/dim}] {percent}%")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );

    for event in events.iter().filter(|e| e.task_id() == task_id) {
        match event {
            InstallerEvent::StateChanged { state, .. } => bar.set_message(state.to_string()),
            InstallerEvent::Progress { progress, .. } => {
                bar.set_position((progress * 100.0).round() as u64);
            }
            InstallerEvent::RequestingAcknowledge { manifest, .. } => {
                let name = manifest
                    .name
                    .get("en")
                    .cloned()
                    .unwrap_or_else(|| manifest.id.clone());
                let accepted = assume_yes
                    || bar.suspend(|| confirm(&format!("Install {} ({})?", name, manifest.id)))?;
                if accepted {
                    installer.acknowledge_package_installation(task_id);
                } else {
                    installer.cancel_task(task_id);
                }
            }
            InstallerEvent::Finished { .. } => {
                bar.finish_and_clear();
                return Ok(());
            }
            InstallerEvent::Failed { kind, message, .. } => {
                bar.abandon();
                bail!("{} ({})", message, kind);
            }
            InstallerEvent::Started { .. } | InstallerEvent::BlockingUntilAcknowledge { .. } => {}
        }
    }
    bail!("installer stopped without a result for task {}", task_id)
}

#[allow(clippy::too_many_arguments)]
fn create_package(
    dir: &Path,
    output: &Path,
    id: Option<String>,
    developer_key: Option<&Path>,
    store_key: Option<&Path>,
    hardware_id: Option<String>,
    extra: Mapping,
    extra_signed: Mapping,
) -> Result<()> {
    let files = collect_package_files(dir)?;
    let id = match id {
        Some(id) => id,
        None => appman_installer::ApplicationManifest::from_file(&dir.join("info.yaml"))?.id,
    };

    let mut report = InstallationReport::new(&id);
    report.add_files(files);
    report.set_extra_meta_data(extra);
    report.set_extra_signed_meta_data(extra_signed);

    let mut creator = PackageCreator::new(dir, output, report);
    if let Some(path) = developer_key {
        creator = creator.with_developer_key(SigningKeyPair::read_secret_key_file(path)?);
    }
    if let Some(path) = store_key {
        creator = creator.with_store_key(SigningKeyPair::read_secret_key_file(path)?, hardware_id);
    }
    creator.create()?;

    println!(
        "Created {} ({} files, digest {})",
        output.display(),
        creator.report().files().len(),
        hex::encode(creator.report().digest())
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Install {
            source,
            location,
            yes,
        } => {
            let installer = open_installer(load_config(&cli.config)?)?;
            let location = match location {
                Some(id) => id,
                None => installer
                    .default_installation_location()
                    .map(|l| l.id())
                    .context("No default installation location configured")?,
            };
            let events = installer.subscribe();
            let task_id = installer.start_package_installation(&location, &source)?;
            follow_task(&installer, &events, &task_id, yes)?;
            let app = installer.task_application_id(&task_id).unwrap_or_default();
            println!("Installed {} into {}", app, location);
            Ok(())
        }
        Commands::Remove {
            id,
            keep_documents,
            force,
        } => {
            let installer = open_installer(load_config(&cli.config)?)?;
            let events = installer.subscribe();
            let task_id = installer.remove_package(&id, keep_documents, force)?;
            follow_task(&installer, &events, &task_id, true)?;
            println!("Removed {}", id);
            Ok(())
        }
        Commands::Cleanup => {
            let installer = open_installer(load_config(&cli.config)?)?;
            installer.cleanup_broken_installations()?;
            println!("Cleanup complete");
            Ok(())
        }
        Commands::Locations => {
            let config = load_config(&cli.config)?;
            for location in parse_locations(&config)? {
                let free = location
                    .disk_usage()
                    .map(|u| format!("{} MiB free", u.available / (1024 * 1024)))
                    .unwrap_or_else(|_| "unavailable".to_string());
                println!(
                    "{}{}\t{}\t{}",
                    location.id(),
                    if location.is_default() { " (default)" } else { "" },
                    location.installation_path().display(),
                    free
                );
            }
            Ok(())
        }
        Commands::Keygen {
            private,
            public,
            key_id,
        } => {
            let mut keypair = SigningKeyPair::generate();
            if let Some(id) = key_id.as_deref() {
                keypair = keypair.with_key_id(id);
            }
            keypair.write_key_files(&private, &public)?;
            println!("Public key: {}", keypair.public_key_base64());
            Ok(())
        }
        Commands::CreatePackage {
            dir,
            output,
            id,
            developer_key,
            store_key,
            hardware_id,
            extra,
            extra_signed,
        } => create_package(
            &dir,
            &output,
            id,
            developer_key.as_deref(),
            store_key.as_deref(),
            hardware_id,
            to_mapping(extra),
            to_mapping(extra_signed),
        ),
    }
}
