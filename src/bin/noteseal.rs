//! Noteseal CLI - per-file hybrid encryption for notes
//!
//! Generates key pairs, encrypts and decrypts single files, and edits
//! encrypted notes in an external editor with the plaintext kept in
//! session storage only while the editor is open.

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use noteseal::config::{self, Settings};
use noteseal::engine::{HybridEngine, KeyConfig};
use noteseal::error::{ErrorCategory, ErrorKind, NotesealError, Result};
use noteseal::file_ops;
use noteseal::keys;
use noteseal::lifecycle::LifecycleManager;
use noteseal::passphrase::{PassphrasePrompt, ReaderPassphrase, TerminalPassphrase};
use noteseal::storage::SessionStorage;
use noteseal::surface::{EditingSurface, ExternalEditor, SurfaceEvent};

#[derive(Parser)]
#[command(name = "noteseal")]
#[command(version)]
#[command(about = "Per-file hybrid encryption for notes.", long_about = None)]
struct Cli {
    /// Read passphrase from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Settings file
    #[arg(long, global = true, env = "NOTESEAL_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Public key (PEM), overriding the settings file
    #[arg(long, global = true, env = "NOTESEAL_PUBLIC_KEY", value_name = "FILE")]
    public_key: Option<PathBuf>,

    /// Private key (PEM), overriding the settings file
    #[arg(long, global = true, env = "NOTESEAL_PRIVATE_KEY", value_name = "FILE")]
    private_key: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a 4096-bit RSA key pair
    Keygen {
        /// Directory to write the key files to
        #[arg(short, long, value_name = "DIR")]
        out: PathBuf,

        /// Store the private key unencrypted
        #[arg(long)]
        no_passphrase: bool,
    },

    /// Encrypt a file
    #[command(alias = "e")]
    Encrypt {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the file to write the encrypted note to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Decrypt a file
    #[command(alias = "d")]
    Decrypt {
        /// Path to the encrypted note
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the file to write the unencrypted text to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Replace an encrypted note with new content, after checking that the
    /// existing note opens with the configured key.
    #[command(alias = "u")]
    Update {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to the existing encrypted note to replace
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Edit an encrypted note in $VISUAL / $EDITOR
    Edit {
        /// Encrypted note to edit
        file: PathBuf,

        /// Create the note if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// Show configuration and where plaintext would be stored
    Info,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Keygen { out, no_passphrase } => keygen(&cli, out, *no_passphrase),
        Commands::Encrypt { input, output } => {
            load_engine(&cli).and_then(|engine| file_ops::encrypt_file(&engine, input, output))
        }
        Commands::Decrypt { input, output } => load_engine(&cli).and_then(|engine| {
            let mut prompt = get_passphrase_prompt(cli.passphrase_stdin);
            file_ops::decrypt_file(&engine, input, output, &mut *prompt)
        }),
        Commands::Update { input, output } => load_engine(&cli).and_then(|engine| {
            let mut prompt = get_passphrase_prompt(cli.passphrase_stdin);
            file_ops::update_file(&engine, input, output, &mut *prompt)
        }),
        Commands::Edit { file, create } => edit(&cli, file, *create),
        Commands::Info => info(&cli),
    };

    if let Err(e) = result {
        report(&e);
        process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("NOTESEAL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn report(e: &NotesealError) {
    eprintln!("Error: {}", e);
    let mut source = e.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
    if e.is(ErrorKind::IntegrityCheckFailed) {
        eprintln!("The file appears to have been tampered with.");
    } else if e.category == ErrorCategory::SecurityBoundary {
        eprintln!("A path attempted to escape the session storage directory.");
    }
}

fn get_passphrase_prompt(use_stdin: bool) -> Box<dyn PassphrasePrompt> {
    if use_stdin {
        Box::new(ReaderPassphrase::new(Box::new(std::io::stdin())))
    } else {
        Box::new(TerminalPassphrase::new())
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    match cli.config.clone().or_else(config::default_settings_path) {
        Some(path) => {
            debug!(path = %path.display(), "loading settings");
            Settings::load(&path)
        }
        None => Ok(Settings::default()),
    }
}

fn key_config(cli: &Cli, settings: &Settings) -> KeyConfig {
    let mut key_config = settings.key_config();
    if let Some(path) = &cli.public_key {
        key_config.public_key_path = Some(path.clone());
    }
    if let Some(path) = &cli.private_key {
        key_config.private_key_path = Some(path.clone());
    }
    key_config
}

fn load_engine(cli: &Cli) -> Result<HybridEngine> {
    let settings = load_settings(cli)?;
    Ok(HybridEngine::new(key_config(cli, &settings)))
}

fn keygen(cli: &Cli, out: &Path, no_passphrase: bool) -> Result<()> {
    let passphrase = if no_passphrase {
        None
    } else {
        let mut prompt = get_passphrase_prompt(cli.passphrase_stdin);
        let first = prompt.prompt("New passphrase for private key")?;
        let second = prompt.prompt("Repeat passphrase")?;
        match (first, second) {
            (Some(first), _) if first.is_empty() => {
                return Err(NotesealError::with_kind(
                    ErrorCategory::Authentication,
                    ErrorKind::PassphraseUnavailable,
                    "empty passphrase; use --no-passphrase to store the key unencrypted",
                ));
            }
            (Some(first), Some(second)) if *first == *second => Some(first),
            (Some(_), Some(_)) => {
                return Err(NotesealError::with_kind(
                    ErrorCategory::Authentication,
                    ErrorKind::InvalidPassphrase,
                    "passphrases do not match",
                ));
            }
            _ => {
                return Err(NotesealError::with_kind(
                    ErrorCategory::Authentication,
                    ErrorKind::PassphraseUnavailable,
                    "empty passphrase; use --no-passphrase to store the key unencrypted",
                ));
            }
        }
    };

    let paths = keys::generate_key_pair(out, passphrase.as_deref().map(Vec::as_slice))?;
    println!("public key:  {}", paths.public_key_path.display());
    println!("private key: {}", paths.private_key_path.display());
    Ok(())
}

fn edit(cli: &Cli, file: &Path, create: bool) -> Result<()> {
    let settings = load_settings(cli)?;
    let engine = HybridEngine::new(key_config(cli, &settings));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            NotesealError::with_kind_and_source(
                ErrorCategory::Operational,
                ErrorKind::Io,
                "failed to start async runtime",
                e,
            )
        })?;

    runtime.block_on(async {
        let storage = SessionStorage::detect()?;
        if let Some(warning) = storage.storage_info().warning() {
            eprintln!("Warning: {}", warning);
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let surface: Arc<dyn EditingSurface> = Arc::new(ExternalEditor::new(events_tx));
        let manager = LifecycleManager::new(
            engine,
            storage,
            surface,
            get_passphrase_prompt(cli.passphrase_stdin),
            settings.lifecycle_config(),
        );

        let opened = if create && !file.exists() {
            manager.create(file, b"").await
        } else {
            manager.open(file).await
        };
        if let Err(e) = opened {
            manager.dispose().await?;
            return Err(e);
        }

        while let Some(event) = events.recv().await {
            let closed = matches!(event, SurfaceEvent::Closed(_));
            manager.handle_event(event).await;
            if closed {
                break;
            }
        }

        if let Err(e) = manager.dispose().await {
            report(&e);
            for record in manager.records() {
                eprintln!(
                    "Unsaved edits to {} remain at {}",
                    record.encrypted_path.display(),
                    record.temporary_path.display()
                );
            }
            // Exit without running destructors so session storage survives.
            process::exit(1);
        }
        Ok(())
    })
}

fn info(cli: &Cli) -> Result<()> {
    let settings_path = cli.config.clone().or_else(config::default_settings_path);
    let settings = load_settings(cli)?;
    let key_config = key_config(cli, &settings);
    let show = |path: Option<&Path>| {
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    };

    println!("settings:        {}", show(settings_path.as_deref()));
    println!("public key:      {}", show(key_config.public_key_path.as_deref()));
    println!("private key:     {}", show(key_config.private_key_path.as_deref()));
    match key_config.session_timeout.filter(|t| !t.is_zero()) {
        Some(timeout) => println!("session timeout: {} min", timeout.as_secs() / 60),
        None => println!("session timeout: disabled"),
    }

    let storage = SessionStorage::detect()?;
    let storage_info = storage.storage_info();
    println!("platform:        {}", storage_info.platform);
    println!("storage:         {}", storage.base_path().display());
    println!("security level:  {}", storage_info.security_level);
    if let Some(warning) = storage_info.warning() {
        println!("warning:         {}", warning);
    }
    storage.remove()
}
