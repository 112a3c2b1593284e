//! lanvault - Local-first encrypted secret store
//!
//! Usage:
//!   lanvault init               - Create a vault (or join one with --pair)
//!   lanvault add --title ...    - Add a credential
//!   lanvault list               - List credentials
//!   lanvault serve              - Run sync server, discovery and auto-sync
//!   lanvault sync <addr>        - Sync once with a peer

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lanvault::{
    bridge::Bridge,
    config::Config,
    identity::DeviceIdentity,
    logging,
    store::{RecordStore, SledRecordStore},
    sync::{Discovery, DiscoveryEvent, SyncEngine, SyncEvent},
    vault::{EntryUpdate, NewEntry, Vault, VaultEntry},
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "lanvault")]
#[command(author = "lanvault Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Local-first encrypted secret store with LAN sync")]
struct Cli {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Read the master password from this file instead of prompting
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault
    Init {
        /// Join an existing vault using its pairing code
        #[arg(long)]
        pair: Option<String>,
    },

    /// Print the code another device needs to join this vault
    PairingCode,

    /// Add a credential; the secret is prompted for
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        folder: Option<String>,
    },

    /// Show one credential
    Get {
        id: String,
        /// Print the password too
        #[arg(long)]
        show: bool,
    },

    /// Credentials matching a site
    Find { url: String },

    /// List credentials
    List {
        /// Include deleted entries
        #[arg(long)]
        deleted: bool,
    },

    /// Replace a credential's password; the new one is prompted for
    Passwd { id: String },

    /// Delete a credential
    Delete { id: String },

    /// Toggle a credential's favorite flag
    Favorite { id: String },

    /// Create a folder
    Folder {
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },

    /// Write an export sealed with the export key
    Export { file: PathBuf },

    /// Merge an export into the vault
    Import { file: PathBuf },

    /// Run the sync server, discovery and auto-sync until interrupted
    Serve,

    /// Sync once with a peer
    Sync {
        addr: SocketAddr,
        /// Peer device id, for incremental sync
        #[arg(long)]
        peer_id: Option<String>,
        /// Use the WebSocket transport
        #[arg(long)]
        ws: bool,
    },

    /// Browse the network for peers
    Peers {
        /// Seconds to listen
        #[arg(long, default_value = "6")]
        wait: u64,
    },

    /// Serve the messaging bridge on stdin/stdout
    Bridge,

    /// Show vault and sync status
    Status,
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    let config = match Config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging.level, cli.verbose, config.logging.file.as_deref()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let app = App {
        config,
        config_path,
        password_file: cli.password_file,
    };
    if let Err(e) = runtime.block_on(run_command(cli.command, &app)) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

struct App {
    config: Config,
    config_path: PathBuf,
    password_file: Option<PathBuf>,
}

impl App {
    fn vault_path(&self) -> PathBuf {
        expand_tilde(&self.config.vault.path)
    }

    fn master_password(&self, prompt: &str) -> Result<Zeroizing<String>> {
        match &self.password_file {
            Some(path) => read_password_file(path),
            None => Ok(Zeroizing::new(
                rpassword::prompt_password(prompt).context("Failed to read password")?,
            )),
        }
    }

    /// Open the vault and unlock it
    async fn unlock(&self) -> Result<Arc<Vault>> {
        let vault = Vault::open(self.vault_path(), self.config.vault_settings())
            .context("Failed to open vault; run `lanvault init` first")?;
        let password = self.master_password("Master password: ")?;
        vault.unlock(&password).await?;
        Ok(vault)
    }

    fn identity(&self, vault: &Vault) -> Result<Arc<DeviceIdentity>> {
        let identity = DeviceIdentity::load_or_create(
            vault.store().as_ref(),
            &self.config.device.name,
            self.config.device.id.as_deref(),
        )?;
        Ok(Arc::new(identity))
    }
}

async fn run_command(command: Commands, app: &App) -> Result<()> {
    match command {
        Commands::Init { pair } => cmd_init(app, pair).await,
        Commands::PairingCode => cmd_pairing_code(app),
        Commands::Add {
            title,
            username,
            url,
            notes,
            folder,
        } => cmd_add(app, title, username, url, notes, folder).await,
        Commands::Get { id, show } => cmd_get(app, &id, show).await,
        Commands::Find { url } => cmd_find(app, &url).await,
        Commands::List { deleted } => cmd_list(app, deleted).await,
        Commands::Passwd { id } => cmd_passwd(app, &id).await,
        Commands::Delete { id } => {
            app.unlock().await?.delete_entry(&id)?;
            println!("Deleted {}", id);
            Ok(())
        }
        Commands::Favorite { id } => {
            let favorite = app.unlock().await?.toggle_favorite(&id)?;
            println!("{} is {}a favorite", id, if favorite { "" } else { "no longer " });
            Ok(())
        }
        Commands::Folder { name, parent } => {
            let folder = app.unlock().await?.add_folder(&name, parent.as_deref())?;
            println!("Created folder {} ({})", folder.name, folder.id);
            Ok(())
        }
        Commands::Export { file } => cmd_export(app, &file).await,
        Commands::Import { file } => cmd_import(app, &file).await,
        Commands::Serve => cmd_serve(app).await,
        Commands::Sync { addr, peer_id, ws } => cmd_sync(app, addr, peer_id, ws).await,
        Commands::Peers { wait } => cmd_peers(app, wait).await,
        Commands::Bridge => cmd_bridge(app).await,
        Commands::Status => cmd_status(app),
    }
}

async fn cmd_init(app: &App, pair: Option<String>) -> Result<()> {
    let path = app.vault_path();
    if path.exists() {
        bail!("A vault already exists at {:?}", path);
    }
    app.config.ensure_directories()?;
    if !app.config_path.exists() {
        app.config.save(&app.config_path)?;
        info!("Wrote default config to {:?}", app.config_path);
    }

    let password = app.master_password("New master password: ")?;
    if app.password_file.is_none() && pair.is_none() {
        let confirm = app.master_password("Repeat master password: ")?;
        if *confirm != *password {
            bail!("Passwords do not match");
        }
    }

    let store: Arc<dyn RecordStore> = Arc::new(SledRecordStore::open(&path)?);
    let settings = app.config.vault_settings();
    let vault = match pair {
        Some(code) => Vault::join_with(Arc::clone(&store), settings, &code, &password).await,
        None => Vault::create_with(Arc::clone(&store), settings, &password).await,
    };
    let vault = match vault {
        Ok(vault) => vault,
        Err(e) => {
            // Leave no half-made vault behind
            drop(store);
            let _ = std::fs::remove_dir_all(&path);
            return Err(e.into());
        }
    };

    let identity = app.identity(&vault)?;
    println!("Vault created at {:?}", path);
    println!("Device: {} ({})", identity.name, identity.device_id);
    vault.shutdown();
    Ok(())
}

fn cmd_pairing_code(app: &App) -> Result<()> {
    let vault = Vault::open(app.vault_path(), app.config.vault_settings())?;
    println!("{}", vault.pairing_code());
    Ok(())
}

async fn cmd_add(
    app: &App,
    title: String,
    username: String,
    url: Option<String>,
    notes: Option<String>,
    folder: Option<String>,
) -> Result<()> {
    let vault = app.unlock().await?;
    let password = Zeroizing::new(
        rpassword::prompt_password(format!("Password for {}: ", title))
            .context("Failed to read entry password")?,
    );
    let entry = vault.add_entry(NewEntry {
        title,
        username,
        password: password.to_string(),
        notes,
        url,
        folder_id: folder,
        ..NewEntry::default()
    })?;
    println!("Added {}", entry.id);
    Ok(())
}

async fn cmd_get(app: &App, id: &str, show: bool) -> Result<()> {
    let vault = app.unlock().await?;
    let entry = vault.get_entry(id)?;
    print_entry(&entry, show);
    Ok(())
}

async fn cmd_find(app: &App, url: &str) -> Result<()> {
    let vault = app.unlock().await?;
    let found = vault.find_entries_by_domain(url)?;
    if found.is_empty() {
        println!("No credentials for {}", url);
    }
    for entry in &found {
        print_summary(entry);
    }
    Ok(())
}

async fn cmd_list(app: &App, deleted: bool) -> Result<()> {
    let vault = app.unlock().await?;
    let listing = if deleted {
        vault.list_all_entries()?
    } else {
        vault.list_entries()?
    };
    for entry in &listing.entries {
        print_summary(entry);
    }
    for (id, e) in &listing.failures {
        warn!("Entry {} could not be read: {}", id, e);
    }
    Ok(())
}

async fn cmd_passwd(app: &App, id: &str) -> Result<()> {
    let vault = app.unlock().await?;
    let password = Zeroizing::new(
        rpassword::prompt_password("New password: ").context("Failed to read entry password")?,
    );
    let entry = vault.update_entry(
        id,
        EntryUpdate {
            password: Some(password.to_string()),
            ..EntryUpdate::default()
        },
    )?;
    println!("Updated {} (version {})", entry.id, entry.sync_version);
    Ok(())
}

async fn cmd_export(app: &App, file: &Path) -> Result<()> {
    let vault = app.unlock().await?;
    let export = vault.export_vault()?;
    let document = Zeroizing::new(export.data);
    std::fs::write(file, document.as_bytes())
        .with_context(|| format!("Failed to write {:?}", file))?;
    for (id, e) in &export.failures {
        warn!("Entry {} left out of export: {}", id, e);
    }
    println!(
        "Exported {} entries and {} folders to {:?}",
        export.entries, export.folders, file
    );
    Ok(())
}

async fn cmd_import(app: &App, file: &Path) -> Result<()> {
    let vault = app.unlock().await?;
    let document = Zeroizing::new(
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?,
    );
    let summary = vault.import_vault(&document)?;
    println!(
        "Imported {} entries ({} skipped), {} folders ({} skipped)",
        summary.entries_added,
        summary.entries_skipped,
        summary.folders_added,
        summary.folders_skipped
    );
    Ok(())
}

async fn cmd_serve(app: &App) -> Result<()> {
    let config = &app.config;
    if !config.sync.enabled {
        bail!("Sync is disabled in {:?}", app.config_path);
    }

    let vault = app.unlock().await?;
    let identity = app.identity(&vault)?;
    info!("Serving as {} ({})", identity.name, identity.device_id);

    let engine = SyncEngine::new(Arc::clone(&vault), identity.device_id.clone(), config.sync_settings());
    let (_, tcp) = engine
        .listen_tcp(SocketAddr::new(config.sync.bind, config.sync.tcp_port))
        .await?;
    let (_, ws) = engine
        .listen_ws(SocketAddr::new(config.sync.bind, config.sync.ws_port))
        .await?;

    let mut sync_events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = sync_events.recv().await {
            match event {
                SyncEvent::Conflict {
                    peer_id, entry_id, ..
                } => warn!("Entry {} conflicts with the copy on {}", entry_id, peer_id),
                SyncEvent::Completed(report) => info!(
                    "Synced with {}: {} merged, {} conflicts",
                    report.peer_id, report.merged, report.conflicts
                ),
                SyncEvent::Failed { .. } => {}
            }
        }
    });

    let mut discovery = None;
    let mut auto_sync = None;
    if config.discovery.enabled {
        let (service, mut events) =
            Discovery::start(Arc::clone(&identity), Arc::clone(&vault), config.discovery_settings())
                .await?;
        if config.sync.auto_sync {
            auto_sync = Some(engine.spawn_auto_sync(service.peers()));
        }
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DiscoveryEvent::DeviceFound(device) => {
                        info!("Found {} ({}) at {}", device.name, device.id, device.sync_addr())
                    }
                    DiscoveryEvent::DeviceLost(id) => info!("Lost {}", id),
                    DiscoveryEvent::DeviceUpdated(_) => {}
                }
            }
        });
        discovery = Some(service);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(task) = auto_sync {
        task.abort();
    }
    if let Some(service) = discovery {
        service.shutdown().await;
    }
    tcp.abort();
    ws.abort();
    reporter.abort();
    vault.shutdown();
    Ok(())
}

async fn cmd_sync(app: &App, addr: SocketAddr, peer_id: Option<String>, ws: bool) -> Result<()> {
    let vault = app.unlock().await?;
    let identity = app.identity(&vault)?;
    let engine = SyncEngine::new(Arc::clone(&vault), identity.device_id.clone(), app.config.sync_settings());

    let report = if ws {
        engine.sync_with_ws(peer_id.as_deref(), addr).await?
    } else {
        engine.sync_with(peer_id.as_deref(), addr).await?
    };
    println!(
        "Synced with {}: sent {}, merged {}, conflicts {}",
        report.peer_id, report.sent, report.merged, report.conflicts
    );
    vault.shutdown();
    Ok(())
}

async fn cmd_peers(app: &App, wait: u64) -> Result<()> {
    let vault = Vault::open(app.vault_path(), app.config.vault_settings())?;
    let identity = app.identity(&vault)?;
    let (service, _events) =
        Discovery::start(identity, Arc::clone(&vault), app.config.discovery_settings()).await?;

    tokio::time::sleep(Duration::from_secs(wait)).await;
    let peers = service.peers().devices();
    service.shutdown().await;

    if peers.is_empty() {
        println!("No peers found");
    }
    for peer in peers {
        println!(
            "{:<18} {:<20} {:<22} v{}",
            peer.id,
            peer.name,
            peer.sync_addr(),
            peer.sync_version
        );
    }
    Ok(())
}

async fn cmd_bridge(app: &App) -> Result<()> {
    if app.password_file.is_none() {
        bail!("The bridge talks over stdin; pass --password-file");
    }
    let vault = app.unlock().await?;
    let bridge = Bridge::new(Arc::clone(&vault));
    bridge.serve(tokio::io::stdin(), tokio::io::stdout()).await?;
    vault.shutdown();
    Ok(())
}

fn cmd_status(app: &App) -> Result<()> {
    let path = app.vault_path();
    println!("Config: {:?}", app.config_path);
    println!("Vault:  {:?}", path);

    let vault = match Vault::open(&path, app.config.vault_settings()) {
        Ok(vault) => vault,
        Err(lanvault::Error::VaultNotFound(_)) => {
            println!("No vault; run `lanvault init`");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let header = vault.header();
    println!(
        "KDF:    Argon2id {} KiB, {} passes, {} lanes",
        header.memory_cost, header.time_cost, header.parallelism
    );
    println!("Version: {}", vault.sync_version()?);

    let identity = app.identity(&vault)?;
    println!("Device: {} ({})", identity.name, identity.device_id);

    let states = vault.sync_states()?;
    if states.is_empty() {
        println!("Never synced");
    }
    for state in states {
        let when = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(state.last_sync_time)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "Peer {}: version {} at {}",
            state.device_id, state.last_sync_version, when
        );
    }
    Ok(())
}

fn print_summary(entry: &VaultEntry) {
    println!(
        "{} {}{:<30} {:<24} {}{}",
        entry.id,
        if entry.is_favorite { "*" } else { " " },
        entry.title,
        entry.username,
        entry.url.as_deref().unwrap_or(""),
        if entry.is_deleted { " (deleted)" } else { "" }
    );
}

fn print_entry(entry: &VaultEntry, show: bool) {
    println!("Title:    {}", entry.title);
    println!("Username: {}", entry.username);
    if show {
        println!("Password: {}", entry.password);
    }
    if let Some(url) = &entry.url {
        println!("URL:      {}", url);
    }
    if let Some(notes) = &entry.notes {
        println!("Notes:    {}", notes);
    }
    println!("Version:  {}", entry.sync_version);
    if entry.is_deleted {
        println!("Deleted");
    }
}

fn read_password_file(path: &Path) -> Result<Zeroizing<String>> {
    let content = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read password file {:?}", path))?,
    );
    Ok(Zeroizing::new(content.trim().to_string()))
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
