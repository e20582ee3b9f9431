//! agefs - age-encrypting loopback filesystem
//!
//! Usage:
//!   agefs mount --identity <key> --src <dir> --mountpoint <dir>  - Mount the filesystem
//!   agefs keygen --out <file>                                    - Generate a new identity
//!   agefs recipients --identity <key>                            - Print the recipients of an identity
//!   agefs encrypt --recipients-file <file> [input]               - Encrypt a file
//!   agefs decrypt --identity <key> [input]                       - Decrypt a file

use age::secrecy::ExposeSecret;
use agefs::{
    config::Config,
    crypto,
    fs::{self, AgeFs, Root},
    identity::{parse_recipients_file, FixedPassphrase, Keyring, Prompter, TerminalPrompter},
    Error, Result,
};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agefs")]
#[command(author = "agefs Contributors")]
#[command(version)]
#[command(about = "FUSE loopback filesystem that encrypts file contents with age")]
struct Cli {
    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log every filesystem request
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount an encrypted view of a directory
    Mount {
        /// Identity (private key) file
        #[arg(short, long)]
        identity: Option<PathBuf>,

        /// Source directory holding the ciphertext
        #[arg(short, long)]
        src: PathBuf,

        /// Mount point directory
        #[arg(short, long)]
        mountpoint: PathBuf,

        /// Mount read-only
        #[arg(long)]
        read_only: bool,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Generate a new X25519 identity
    Keygen {
        /// Output file for the identity
        #[arg(short, long)]
        out: PathBuf,

        /// Store the identity unencrypted
        #[arg(long)]
        no_encrypt: bool,

        /// Ask for the passphrase instead of generating one
        #[arg(long)]
        passphrase: bool,
    },

    /// Print the recipients of an identity file
    Recipients {
        /// Identity (private key) file
        #[arg(short, long)]
        identity: PathBuf,
    },

    /// Encrypt a file to the recipients in a recipients file
    Encrypt {
        /// Recipients file, one recipient per line
        #[arg(short = 'R', long)]
        recipients_file: PathBuf,

        /// Produce ASCII-armored output
        #[arg(short, long)]
        armor: bool,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Input file (stdin when omitted)
        input: Option<PathBuf>,
    },

    /// Decrypt a file with an identity file
    Decrypt {
        /// Identity (private key) file
        #[arg(short, long)]
        identity: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Input file (stdin when omitted)
        input: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the command line flags
    let default_level = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Mount {
            identity,
            src,
            mountpoint,
            read_only,
            allow_other,
        } => {
            let mut config = Config::load(config_path)?;
            if read_only {
                config.mount.read_only = true;
            }
            if allow_other {
                config.mount.allow_other = true;
            }
            cmd_mount(config, identity, &src, &mountpoint)
        }

        Commands::Keygen {
            out,
            no_encrypt,
            passphrase,
        } => cmd_keygen(&out, no_encrypt, passphrase),

        Commands::Recipients { identity } => cmd_recipients(&identity),

        Commands::Encrypt {
            recipients_file,
            armor,
            output,
            input,
        } => cmd_encrypt(&recipients_file, armor, output.as_deref(), input.as_deref()),

        Commands::Decrypt {
            identity,
            output,
            input,
        } => cmd_decrypt(&identity, output.as_deref(), input.as_deref()),
    }
}

/// `AGEFS_PASSPHRASE` selects a non-interactive passphrase source
fn prompter() -> Arc<dyn Prompter> {
    match std::env::var("AGEFS_PASSPHRASE") {
        Ok(passphrase) => Arc::new(FixedPassphrase::new(passphrase)),
        Err(_) => Arc::new(TerminalPrompter),
    }
}

fn cmd_mount(config: Config, identity: Option<PathBuf>, src: &Path, mountpoint: &Path) -> Result<()> {
    let identity = identity
        .or_else(|| config.identity_file.clone())
        .map(|p| expand_tilde(&p))
        .ok_or_else(|| Error::Config("no identity file given (--identity)".to_string()))?;
    let src = expand_tilde(src);
    let mountpoint = expand_tilde(mountpoint);

    if !mountpoint.is_dir() {
        return Err(Error::PathNotFound(mountpoint.display().to_string()));
    }

    let root = Root::open(src, &identity, &config.policy_file_name, prompter())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(config.mount.workers)
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(e.to_string()))?;

    let fs = AgeFs::new(root, &config.mount, runtime.handle().clone());
    let session = fs::mount(fs, &mountpoint, &config.mount)?;
    info!("Mounted at {:?} (read_only={})", mountpoint, config.mount.read_only);

    runtime.block_on(async {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
        Ok::<(), Error>(())
    })?;

    info!("Unmounting {:?}", mountpoint);
    drop(session);
    Ok(())
}

fn cmd_keygen(out: &Path, no_encrypt: bool, ask_passphrase: bool) -> Result<()> {
    let key = crypto::generate_key(chrono::Utc::now());

    let contents: Vec<u8> = if no_encrypt {
        key.contents.as_bytes().to_vec()
    } else {
        let passphrase = if ask_passphrase {
            let prompter = prompter();
            let first = prompter.passphrase("Enter passphrase:")?;
            let second = prompter.passphrase("Confirm passphrase:")?;
            if first.expose_secret() != second.expose_secret() {
                return Err(Error::Passphrase("passphrases didn't match".to_string()));
            }
            first
        } else {
            let generated = crypto::random_passphrase();
            eprintln!("Using autogenerated passphrase {}", generated.expose_secret());
            generated
        };
        crypto::encrypt_with_passphrase(key.contents.as_bytes(), passphrase, Vec::new())?
    };

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(out)?;
    if file.metadata()?.permissions().mode() & 0o004 != 0 {
        drop(file);
        std::fs::remove_file(out)?;
        return Err(Error::Internal(format!("refusing to write identity to world-readable {:?}", out)));
    }
    file.write_all(&contents)?;
    file.sync_all()?;

    let mut public = out.as_os_str().to_owned();
    public.push(".pub");
    std::fs::write(&public, format!("{}\n", key.public))?;

    eprintln!("Public key: {}", key.public);
    Ok(())
}

fn cmd_recipients(identity: &Path) -> Result<()> {
    let keyring = Keyring::load(&expand_tilde(identity), prompter())?;
    for recipient in keyring.recipients() {
        println!("{}", recipient);
    }
    Ok(())
}

fn read_input(input: Option<&Path>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    match input {
        Some(path) => {
            std::fs::File::open(path)?.read_to_end(&mut data)?;
        }
        None => {
            std::io::stdin().lock().read_to_end(&mut data)?;
        }
    }
    Ok(data)
}

fn write_output(output: Option<&Path>, data: &[u8]) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, data)?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cmd_encrypt(recipients_file: &Path, armor: bool, output: Option<&Path>, input: Option<&Path>) -> Result<()> {
    let recipients = parse_recipients_file(&expand_tilde(recipients_file), prompter())?;
    if output.is_none() && !armor && std::io::IsTerminal::is_terminal(&std::io::stdout()) {
        warn!("Writing binary ciphertext to a terminal; pass --armor or --output");
    }
    let plaintext = zeroize::Zeroizing::new(read_input(input)?);
    let ciphertext = crypto::encrypt(&plaintext, &recipients, Vec::new(), armor)?;
    write_output(output, &ciphertext)
}

fn cmd_decrypt(identity: &Path, output: Option<&Path>, input: Option<&Path>) -> Result<()> {
    let keyring = Keyring::load(&expand_tilde(identity), prompter())?;
    let ciphertext = read_input(input)?;
    let plaintext = crypto::decrypt(&ciphertext[..], keyring.identities())?;
    write_output(output, &plaintext)
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
