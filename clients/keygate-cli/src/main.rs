//! keygate - manage a presence-gated P-256 key pair from the terminal

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use keygate::{
    ExistingKeyPolicy, KeyManager, KeyManagerConfig, KeygateError, PresenceCheck, PublicKeyBytes,
    Signature, SoftwareKeystoreConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_NAMESPACE: &str = "com.keygate.default";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Key namespace; keys are labelled <namespace>.private / <namespace>.public
    #[arg(short, long, env = "KEYGATE_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// KeyManager config file (JSON). Overrides --namespace.
    #[arg(short, long, env = "KEYGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Software key directory (default: ~/.keygate/keys)
    #[arg(long, env = "KEYGATE_HOME")]
    key_dir: Option<PathBuf>,

    /// Use the Secure Enclave instead of the software keystore
    #[cfg(all(
        any(target_os = "macos", target_os = "ios"),
        feature = "secure-enclave"
    ))]
    #[arg(long)]
    hardware: bool,

    /// Approve presence checks without asking
    #[arg(short, long)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the key pair (replaces an existing one)
    Generate {
        /// Refuse if either half of the pair already exists
        #[arg(long)]
        fail_if_exists: bool,
    },

    /// Report whether the public key exists
    Exists,

    /// Delete the public key only
    DeletePublic,

    /// Delete the private key only
    DeletePrivate,

    /// Delete both halves of the key pair
    Delete,

    /// Print the public key
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Pem)]
        format: ExportFormat,
    },

    /// Sign data with the private key (asks for presence)
    Sign {
        /// Data to sign, as UTF-8 text
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        data: Option<String>,

        /// File whose contents to sign
        #[arg(long)]
        file: Option<PathBuf>,

        /// Print the X9.62 DER encoding instead of raw r || s
        #[arg(long)]
        der: bool,
    },

    /// Verify a signature against the stored public key
    Verify {
        /// Signed data, as UTF-8 text
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        data: Option<String>,

        /// File whose contents were signed
        #[arg(long)]
        file: Option<PathBuf>,

        /// Signature hex (raw r || s or DER)
        #[arg(long)]
        signature: String,
    },

    /// Encrypt data to the public key (ECIES); prints the ciphertext as hex
    Encrypt {
        /// Data to encrypt, as UTF-8 text
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        data: Option<String>,

        /// File whose contents to encrypt
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Decrypt hex ciphertext with the private key (asks for presence)
    Decrypt {
        /// Ciphertext hex, as printed by `encrypt`
        #[arg(long)]
        ciphertext: String,
    },

    /// Show keystore and key pair status
    Status,

    /// Write the effective KeyManager config to a file
    SaveConfig {
        /// Destination path
        path: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ExportFormat {
    Hex,
    Pem,
}

// ==================== Presence ====================

/// Asks on the terminal before each use of the private key.
struct TerminalPresence;

impl PresenceCheck for TerminalPresence {
    fn confirm(&self, prompt: &str) -> keygate::Result<()> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{} [y/N] ", prompt.yellow().bold())?;
        stderr.flush()?;

        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if is_approval(&answer) {
            Ok(())
        } else {
            Err(KeygateError::AuthenticationDenied(
                "declined at terminal".to_string(),
            ))
        }
    }
}

fn is_approval(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

// ==================== Helpers ====================

fn key_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(dir) = &cli.key_dir {
        return Ok(dir.clone());
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".keygate").join("keys"))
}

fn manager_config(cli: &Cli) -> Result<KeyManagerConfig> {
    match &cli.config {
        Some(path) => KeyManagerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(KeyManagerConfig::for_namespace(&cli.namespace)),
    }
}

fn open_manager(cli: &Cli, config: KeyManagerConfig) -> Result<KeyManager> {
    #[cfg(all(
        any(target_os = "macos", target_os = "ios"),
        feature = "secure-enclave"
    ))]
    if cli.hardware {
        return KeyManager::open(&keygate::SecureEnclaveKeystoreConfig, config)
            .context("Failed to open Secure Enclave keystore");
    }

    let presence: Arc<dyn PresenceCheck> = if cli.yes {
        Arc::new(keygate::AutoApprove)
    } else {
        Arc::new(TerminalPresence)
    };
    let keystore_config = SoftwareKeystoreConfig::persistent(key_dir(cli)?).with_presence(presence);
    KeyManager::open(&keystore_config, config).context("Failed to open software keystore")
}

fn read_input(data: Option<&str>, file: Option<&Path>) -> Result<Vec<u8>> {
    match (data, file) {
        (Some(text), None) => Ok(text.as_bytes().to_vec()),
        (None, Some(path)) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        _ => bail!("Provide exactly one of --data or --file"),
    }
}

fn parse_signature(hex_str: &str) -> Result<Signature> {
    let bytes = hex::decode(hex_str.trim()).context("Signature is not valid hex")?;
    if bytes.len() == keygate::types::P256_SIGNATURE_LEN {
        Ok(Signature::from_bytes(&bytes)?)
    } else {
        Ok(Signature::from_der(&bytes)?)
    }
}

fn yes_no(value: bool) -> colored::ColoredString {
    if value { "yes".green() } else { "no".red() }
}

fn print_public_key(public: &PublicKeyBytes, format: ExportFormat) -> Result<()> {
    match format {
        ExportFormat::Hex => println!("{}", public.to_hex()),
        ExportFormat::Pem => print!("{}", public.to_pem()?),
    }
    Ok(())
}

// ==================== Commands ====================

fn cmd_generate(manager: &KeyManager, fail_if_exists: bool) -> Result<()> {
    let manager = if fail_if_exists {
        let config = manager
            .config()
            .clone()
            .with_existing_policy(ExistingKeyPolicy::Fail);
        manager.with_config(config)
    } else {
        manager.clone()
    };

    println!("{}", "Generating key pair...".green());
    manager
        .try_generate_key_pair()
        .context("Key generation failed")?;

    let public = manager
        .try_export_public_key_bytes()?
        .context("Public key missing after generation")?;
    println!("{}", "Key pair generated!".green().bold());
    println!("  Identifier:  {}", manager.identifier());
    println!("  Fingerprint: {}", public.fingerprint()?);
    Ok(())
}

fn cmd_exists(manager: &KeyManager) -> Result<()> {
    let exists = manager.try_public_key_exists()?;
    println!("{}", yes_no(exists));
    Ok(())
}

fn cmd_delete_public(manager: &KeyManager) -> Result<()> {
    manager.try_delete_public_key()?;
    println!("{}", "Public key deleted.".green());
    Ok(())
}

fn cmd_delete_private(manager: &KeyManager) -> Result<()> {
    manager.try_delete_private_key()?;
    println!("{}", "Private key deleted.".green());
    Ok(())
}

fn cmd_delete(manager: &KeyManager) -> Result<()> {
    manager.delete_key_pair()?;
    println!("{}", "Key pair deleted.".green().bold());
    Ok(())
}

fn cmd_export(manager: &KeyManager, format: ExportFormat) -> Result<()> {
    let Some(public) = manager.try_export_public_key_bytes()? else {
        bail!("No public key for {}", manager.identifier());
    };
    print_public_key(&public, format)
}

async fn cmd_sign(manager: &KeyManager, data: Vec<u8>, der: bool) -> Result<()> {
    let signature = manager.sign(data).await.map_err(not_found_hint)?;

    if der {
        println!("{}", hex::encode(signature.to_der()));
    } else {
        println!("{}", signature.to_hex());
    }
    Ok(())
}

fn not_found_hint(e: KeygateError) -> anyhow::Error {
    match e {
        KeygateError::KeyNotFound(label) => {
            anyhow::anyhow!("No key {} (run `keygate generate`)", label)
        }
        other => other.into(),
    }
}

fn cmd_encrypt(manager: &KeyManager, data: &[u8]) -> Result<()> {
    let ciphertext = manager.encrypt(data).map_err(not_found_hint)?;
    println!("{}", hex::encode(ciphertext));
    Ok(())
}

async fn decrypt_hex(manager: &KeyManager, ciphertext: &str) -> Result<Vec<u8>> {
    let ciphertext = hex::decode(ciphertext.trim()).context("Ciphertext is not valid hex")?;
    manager.decrypt(ciphertext).await.map_err(not_found_hint)
}

async fn cmd_decrypt(manager: &KeyManager, ciphertext: &str) -> Result<()> {
    let plaintext = decrypt_hex(manager, ciphertext).await?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&plaintext)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_verify(manager: &KeyManager, data: &[u8], signature: &str) -> Result<()> {
    let signature = parse_signature(signature)?;
    match manager.verify(data, &signature) {
        Ok(()) => {
            println!("{}", "Signature valid.".green().bold());
            Ok(())
        }
        Err(KeygateError::VerificationFailed(_)) => {
            println!("{}", "Signature INVALID.".red().bold());
            bail!("Verification failed")
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_status(manager: &KeyManager) -> Result<()> {
    let identifier = manager.identifier();
    let public = manager.try_export_public_key_bytes()?;
    let private = manager.try_private_key_exists()?;

    println!("{}", "Key Pair Status".cyan().bold());
    println!("  Keystore:    {}", manager.keystore_name());
    println!("  Private tag: {}", identifier.private_tag());
    println!("  Public tag:  {}", identifier.public_tag());
    println!("  Private key: {}", yes_no(private));
    println!("  Public key:  {}", yes_no(public.is_some()));
    if let Some(public) = public {
        println!("  Fingerprint: {}", public.fingerprint()?);
    }
    println!("  Presence:    {}", yes_no(manager.config().access.user_presence));
    Ok(())
}

fn cmd_save_config(config: &KeyManagerConfig, path: &Path) -> Result<()> {
    config
        .save(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    println!(
        "{}",
        format!("Config written to {}", path.display()).green()
    );
    Ok(())
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = manager_config(&cli)?;

    if let Commands::SaveConfig { path } = &cli.command {
        return cmd_save_config(&config, path);
    }

    let manager = open_manager(&cli, config)?;
    tracing::debug!(keystore = manager.keystore_name(), identifier = %manager.identifier(), "Keystore opened");

    match &cli.command {
        Commands::Generate { fail_if_exists } => cmd_generate(&manager, *fail_if_exists),
        Commands::Exists => cmd_exists(&manager),
        Commands::DeletePublic => cmd_delete_public(&manager),
        Commands::DeletePrivate => cmd_delete_private(&manager),
        Commands::Delete => cmd_delete(&manager),
        Commands::Export { format } => cmd_export(&manager, *format),
        Commands::Sign { data, file, der } => {
            let input = read_input(data.as_deref(), file.as_deref())?;
            cmd_sign(&manager, input, *der).await
        }
        Commands::Verify {
            data,
            file,
            signature,
        } => {
            let input = read_input(data.as_deref(), file.as_deref())?;
            cmd_verify(&manager, &input, signature)
        }
        Commands::Encrypt { data, file } => {
            let input = read_input(data.as_deref(), file.as_deref())?;
            cmd_encrypt(&manager, &input)
        }
        Commands::Decrypt { ciphertext } => cmd_decrypt(&manager, ciphertext).await,
        Commands::Status => cmd_status(&manager),
        Commands::SaveConfig { .. } => Ok(()),
    }
}
