//! remsync command-line interface.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

use remsync::stream::{TransferEvent, TransferListener};
use remsync::{
    Config, Engine, FileVisitor, LocalBackend, RemoteFile, RemoteFs, SyncOperation, SyncOptions,
    VisitResult,
};

/// Sync and stream files between a local tree and a remote filesystem.
#[derive(Parser)]
#[command(name = "remsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serve the "remote" side from this local directory
    #[arg(global = true, long, env = "REMSYNC_ROOT")]
    root: Option<PathBuf>,

    /// Connect to an SFTP server: user@host[:port], authenticated by ssh-agent
    #[cfg(feature = "ssh")]
    #[arg(global = true, long)]
    ssh: Option<String>,

    /// Config file (default: <config dir>/remsync/config.toml)
    #[arg(global = true, long)]
    config: Option<PathBuf>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(global = true, short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print sync results as JSON
    #[arg(global = true, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Copy)]
struct SyncFlags {
    /// Descend into sub-directories
    #[arg(short, long)]
    recursive: bool,

    /// Delete target entries missing from the source
    #[arg(long)]
    delete: bool,

    /// Only report what would change
    #[arg(short = 'n', long)]
    dry_run: bool,
}

impl SyncFlags {
    fn options(self) -> SyncOptions {
        SyncOptions::new(self.recursive, self.delete, !self.dry_run)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a remote directory into a local one
    Download {
        remote: String,
        local: PathBuf,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// Mirror a local directory into a remote one
    Upload {
        local: PathBuf,
        remote: String,
        #[command(flatten)]
        flags: SyncFlags,
    },

    /// List a remote directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Print a remote tree
    Tree {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Download a single file
    Get {
        remote: String,
        #[arg(default_value = ".")]
        local: PathBuf,

        /// Continue a partial download
        #[arg(short = 'c', long = "continue")]
        resume: bool,
    },

    /// Upload a single file
    Put {
        local: PathBuf,
        remote: String,

        /// Continue a partial upload
        #[arg(short = 'c', long = "continue")]
        resume: bool,
    },

    /// Create a remote directory
    Mkdir {
        path: String,

        /// Create missing parents too
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove a remote file or directory
    Rm {
        path: String,

        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },
}

// =============================================================================
// Progress
// =============================================================================

/// Draws one progress bar per transfer.
struct BarListener {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarListener {
    fn new() -> Self {
        Self { bar: Mutex::new(None) }
    }
}

impl TransferListener for BarListener {
    fn started(&self, event: &TransferEvent) {
        let bar = match event.size {
            Some(size) => ProgressBar::new(size),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) =
            ProgressStyle::with_template("{msg:40!} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(remsync::path::basename(&event.source).to_string());
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn progressed(&self, _event: &TransferEvent, transferred: u64) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.set_position(transferred);
            }
        }
    }

    fn finished(&self, _event: &TransferEvent, _transferred: u64) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

// =============================================================================
// Tree printing
// =============================================================================

struct TreePrinter {
    depth: usize,
}

impl FileVisitor for TreePrinter {
    fn pre_visit_directory(&mut self, dir: &RemoteFile) -> remsync::Result<VisitResult> {
        println!("{}{}/", "  ".repeat(self.depth), dir.name().blue().bold());
        self.depth += 1;
        Ok(VisitResult::Continue)
    }

    fn visit_file(&mut self, file: &RemoteFile) -> remsync::Result<VisitResult> {
        println!("{}{}", "  ".repeat(self.depth), file.name());
        Ok(VisitResult::Continue)
    }

    fn post_visit_directory(
        &mut self,
        dir: &RemoteFile,
        error: Option<remsync::SyncError>,
    ) -> remsync::Result<VisitResult> {
        self.depth = self.depth.saturating_sub(1);
        if let Some(e) = error {
            eprintln!("{} {}: {}", "warning:".yellow(), dir.path(), e);
        }
        Ok(VisitResult::Continue)
    }
}

// =============================================================================
// Main
// =============================================================================

fn init_logging(verbose: u8, config: &Config) {
    let level = match verbose {
        0 => config.log.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "ssh")]
fn parse_ssh_target(target: &str) -> Result<(String, String, u16)> {
    let (user, rest) = match target.split_once('@') {
        Some((user, rest)) => (user.to_string(), rest),
        None => (whoami::username(), target),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().with_context(|| format!("Invalid port in {}", target))?,
        ),
        None => (rest.to_string(), 22),
    };
    if host.is_empty() {
        bail!("Missing host in {}", target);
    }
    Ok((user, host, port))
}

#[cfg(feature = "ssh")]
fn ssh_backend(cli: &Cli) -> Result<Option<Arc<dyn RemoteFs>>> {
    let Some(target) = &cli.ssh else {
        return Ok(None);
    };
    let (user, host, port) = parse_ssh_target(target)?;
    let backend = remsync::Ssh2Backend::connect(&host, port, &user)
        .with_context(|| format!("Failed to connect to {}", target))?;
    Ok(Some(Arc::new(backend)))
}

#[cfg(not(feature = "ssh"))]
fn ssh_backend(_cli: &Cli) -> Result<Option<Arc<dyn RemoteFs>>> {
    Ok(None)
}

fn open_backend(cli: &Cli) -> Result<Arc<dyn RemoteFs>> {
    if let Some(backend) = ssh_backend(cli)? {
        return Ok(backend);
    }

    match &cli.root {
        Some(root) => {
            let backend = LocalBackend::new(root)
                .with_context(|| format!("Failed to open backend root {}", root.display()))?;
            Ok(Arc::new(backend))
        }
        None => bail!("No backend selected: pass --root DIR{}", ssh_hint()),
    }
}

fn ssh_hint() -> &'static str {
    if cfg!(feature = "ssh") {
        " or --ssh user@host"
    } else {
        ""
    }
}

fn print_summary(op: &SyncOperation, json: bool, dry_run: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&op.report())?);
        return Ok(());
    }

    for path in op.created() {
        println!("{} {}", "+".green(), path);
    }
    for path in op.updated() {
        println!("{} {}", "~".yellow(), path);
    }
    for path in op.deleted() {
        println!("{} {}", "-".red(), path);
    }
    for (path, err) in op.errors() {
        eprintln!("{} {}: {}", "error:".red().bold(), path, err);
    }

    let prefix = if dry_run { "Would sync" } else { "Synced" };
    println!("{} {} ({} bytes)", prefix.bold(), op, op.size());
    Ok(())
}

fn finish_sync(op: SyncOperation, json: bool, flags: SyncFlags) -> Result<()> {
    print_summary(&op, json, flags.dry_run)?;
    if op.has_errors() {
        bail!("{} entries failed", op.errors().len());
    }
    Ok(())
}

fn run(cli: Cli, config: Config) -> Result<()> {
    let fs = open_backend(&cli)?;
    let engine = Engine::with_config(fs.clone(), config.transfer.clone());
    if !cli.json {
        engine.listeners().add(Arc::new(BarListener::new()));
    }

    match cli.command {
        Commands::Download { remote, local, flags } => {
            let op = engine.download(&remote, &local, flags.options())?;
            finish_sync(op, cli.json, flags)
        }
        Commands::Upload { local, remote, flags } => {
            let op = engine.upload(&local, &remote, flags.options())?;
            finish_sync(op, cli.json, flags)
        }
        Commands::Ls { path } => {
            for file in fs.list_dir(&path)? {
                let line = format!("{} {}", file.permissions_string(), file);
                if file.is_dir() {
                    println!("{}", line.blue());
                } else {
                    println!("{}", line);
                }
            }
            Ok(())
        }
        Commands::Tree { path } => {
            engine.visit(&path, &mut TreePrinter { depth: 0 })?;
            Ok(())
        }
        Commands::Get { remote, local, resume } => {
            let bytes = if resume {
                let target = if local.is_dir() {
                    local.join(remsync::path::basename(&remote))
                } else {
                    local
                };
                engine.resume_get(&remote, &target)?
            } else {
                engine.get_file(&remote, &local)?
            };
            println!("{} {} ({} bytes)", "Downloaded".green(), remote, bytes);
            Ok(())
        }
        Commands::Put { local, remote, resume } => {
            let bytes = if resume {
                engine.resume_put(&local, &remote)?
            } else {
                engine.put_file(&local, &remote)?
            };
            println!("{} {} ({} bytes)", "Uploaded".green(), display(&local), bytes);
            Ok(())
        }
        Commands::Mkdir { path, parents } => {
            let mode = engine.config().dir_permissions;
            if parents {
                engine.mkdirs(&path, mode)?;
            } else {
                fs.mkdir(&path, mode)?;
            }
            Ok(())
        }
        Commands::Rm { path, recursive } => {
            if recursive {
                engine.remove_recursive(&path)?;
            } else if fs.stat(&path)?.is_dir() {
                fs.remove_dir(&path)?;
            } else {
                fs.remove(&path)?;
            }
            Ok(())
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_logging(cli.verbose, &config);

    run(cli, config)
}
