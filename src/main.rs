//! veilfs - Encrypted overlay filesystem core
//!
//! Usage:
//!   veilfs init <cipherdir>               - Initialize a ciphertext directory
//!   veilfs ls <cipherdir> [dir]           - List a decrypted directory
//!   veilfs cat <cipherdir> <file>         - Print a decrypted file
//!   veilfs put <cipherdir> <file>         - Store stdin as an encrypted file
//!   veilfs fsck <cipherdir>               - Check the whole tree

use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use veilfs::{
    config::Config,
    crypto::{MasterKey, PLAIN_BLOCK_SIZE},
    fs::{init_cipherdir, FileKind, RootState},
    fsck::fsck,
    Error, Result,
};
use zeroize::Zeroizing;

/// Environment variable holding the hex master key
const MASTER_KEY_ENV: &str = "VEILFS_MASTER_KEY";

/// Plaintext bytes moved per read or write
const COPY_CHUNK: usize = 32 * PLAIN_BLOCK_SIZE;

#[derive(Parser)]
#[command(name = "veilfs")]
#[command(author = "veilfs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Encrypted overlay filesystem core")]
struct Cli {
    /// File holding the hex encoded master key (default: $VEILFS_MASTER_KEY)
    #[arg(short, long, global = true)]
    key_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize an empty directory as a ciphertext tree
    Init {
        /// Ciphertext directory
        cipherdir: PathBuf,

        /// Store file names unencrypted
        #[arg(long)]
        plaintext_names: bool,

        /// Seconds without activity before unmounting, 0 = never
        #[arg(long, default_value_t = 0)]
        idle_timeout: u64,
    },

    /// List a directory
    Ls {
        cipherdir: PathBuf,

        /// Directory inside the plaintext view
        #[arg(default_value = "/")]
        dir: PathBuf,
    },

    /// Write a file to stdout
    Cat { cipherdir: PathBuf, file: PathBuf },

    /// Store stdin as a file, replacing existing content
    Put { cipherdir: PathBuf, file: PathBuf },

    /// Create a directory
    Mkdir {
        cipherdir: PathBuf,
        dir: PathBuf,

        /// Permissions (octal)
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },

    /// Remove a file or symlink
    Rm { cipherdir: PathBuf, path: PathBuf },

    /// Remove an empty directory
    Rmdir { cipherdir: PathBuf, dir: PathBuf },

    /// Move a file or directory
    Mv {
        cipherdir: PathBuf,
        from: PathBuf,
        to: PathBuf,
    },

    /// Create a symlink
    Symlink {
        cipherdir: PathBuf,
        target: OsString,
        link: PathBuf,
    },

    /// Print the target of a symlink
    Readlink { cipherdir: PathBuf, link: PathBuf },

    /// Decrypt every name, file and symlink and report corruption
    Fsck { cipherdir: PathBuf },
}

fn parse_mode(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    // Setup logging, RUST_LOG takes precedence over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = run_command(cli.command, cli.key_file.as_deref()) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, key_file: Option<&Path>) -> Result<()> {
    match command {
        Commands::Init {
            cipherdir,
            plaintext_names,
            idle_timeout,
        } => cmd_init(&cipherdir, key_file, plaintext_names, idle_timeout),

        Commands::Ls { cipherdir, dir } => cmd_ls(&open_root(&cipherdir, key_file)?, &dir),

        Commands::Cat { cipherdir, file } => cmd_cat(&open_root(&cipherdir, key_file)?, &file),

        Commands::Put { cipherdir, file } => cmd_put(&open_root(&cipherdir, key_file)?, &file),

        Commands::Mkdir {
            cipherdir,
            dir,
            mode,
        } => {
            open_root(&cipherdir, key_file)?.mkdir(&dir, mode)?;
            Ok(())
        }

        Commands::Rm { cipherdir, path } => open_root(&cipherdir, key_file)?.unlink(&path),

        Commands::Rmdir { cipherdir, dir } => open_root(&cipherdir, key_file)?.rmdir(&dir),

        Commands::Mv {
            cipherdir,
            from,
            to,
        } => open_root(&cipherdir, key_file)?.rename(&from, &to),

        Commands::Symlink {
            cipherdir,
            target,
            link,
        } => {
            open_root(&cipherdir, key_file)?.symlink(&target, &link)?;
            Ok(())
        }

        Commands::Readlink { cipherdir, link } => {
            let target = open_root(&cipherdir, key_file)?.readlink(&link)?;
            println!("{}", target.to_string_lossy());
            Ok(())
        }

        Commands::Fsck { cipherdir } => cmd_fsck(&cipherdir, key_file),
    }
}

fn load_key(key_file: Option<&Path>) -> Result<MasterKey> {
    let hex = match key_file {
        Some(path) => Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read key file {:?}: {}", path, e))
        })?),
        None => Zeroizing::new(std::env::var(MASTER_KEY_ENV).map_err(|_| {
            Error::Config(format!(
                "No master key: pass --key-file or set {}",
                MASTER_KEY_ENV
            ))
        })?),
    };
    MasterKey::from_hex(hex.trim())
}

fn open_root(cipherdir: &Path, key_file: Option<&Path>) -> Result<Arc<RootState>> {
    let key = load_key(key_file)?;
    let config = Config::load_from_cipherdir(cipherdir)?;
    Ok(Arc::new(RootState::new(cipherdir, config, &key)?))
}

fn cmd_init(
    cipherdir: &Path,
    key_file: Option<&Path>,
    plaintext_names: bool,
    idle_timeout: u64,
) -> Result<()> {
    info!("Initializing {:?}...", cipherdir);
    std::fs::create_dir_all(cipherdir)?;

    let key = MasterKey::generate();
    init_cipherdir(cipherdir, plaintext_names, idle_timeout, &key)?;

    match key_file {
        Some(path) => {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)?;
            file.write_all(key.to_hex().as_bytes())?;
            info!("Master key written to {:?}", path);
        }
        None => {
            warn!("No --key-file given, printing the master key. Store it safely.");
            println!("{}", key.to_hex().as_str());
        }
    }
    Ok(())
}

fn cmd_ls(root: &Arc<RootState>, dir: &Path) -> Result<()> {
    let mut entries = root.read_dir(dir)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    for entry in entries {
        let kind = match entry.kind {
            FileKind::Directory => 'd',
            FileKind::Symlink => 'l',
            FileKind::RegularFile => '-',
            _ => '?',
        };
        let size = root
            .getattr(&dir.join(&entry.name))
            .map(|attr| attr.size.to_string())
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "{:>8} {} {:>12} {}",
            entry.ino,
            kind,
            size,
            entry.name.to_string_lossy()
        );
    }
    Ok(())
}

fn cmd_cat(root: &Arc<RootState>, path: &Path) -> Result<()> {
    let file = root.open(path, libc::O_RDONLY)?;
    let mut stdout = std::io::stdout().lock();
    let mut offset = 0u64;
    loop {
        let chunk = file.read(offset, COPY_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        stdout.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    stdout.flush()?;
    Ok(())
}

fn cmd_put(root: &Arc<RootState>, path: &Path) -> Result<()> {
    let file = match root.create(path, libc::O_WRONLY, 0o644) {
        Ok((_, file)) => file,
        Err(e) if e.errno() == libc::EEXIST => root.open(path, libc::O_WRONLY | libc::O_TRUNC)?,
        Err(e) => return Err(e),
    };

    let mut stdin = std::io::stdin().lock();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        offset += file.write(offset, &buf[..n])? as u64;
    }
    file.sync()?;
    info!("Wrote {} bytes to {:?}", offset, path);
    Ok(())
}

fn cmd_fsck(cipherdir: &Path, key_file: Option<&Path>) -> Result<()> {
    let key = load_key(key_file)?;
    let report = fsck(cipherdir, &key)?;

    for path in &report.corrupt {
        println!("corrupt: {}", path.display());
    }
    for item in &report.mitigated {
        println!("corrupt name: {}", item);
    }
    println!(
        "{} directories, {} files, {} symlinks checked",
        report.dirs, report.files, report.symlinks
    );

    if report.is_clean() {
        info!("fsck: no problems found");
        Ok(())
    } else {
        Err(Error::Internal(format!("fsck found {} errors", report.errors())))
    }
}
