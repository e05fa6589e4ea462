//! TSS Participant CLI
//!
//! Command-line interface for running threshold Schnorr participants:
//! - Local devnet: N participants on an in-process ledger
//! - Key share and nonce pair inspection of a node's store

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn, Level};
use tss_core::ledger::{Ledger, LedgerEvent, Sequenced};
use tss_core::store::{DeStatus, FileStore, MemoryStore, SecretStore};
use tss_core::{crypto, sign, GroupId, Signature, SigningId};
use tss_ledger::{LedgerConfig, MemoryLedger};
use tss_participant::{with_retry, Participant, ParticipantConfig};

/// TSS Participant - threshold Schnorr node
#[derive(Parser)]
#[command(name = "tss-participant")]
#[command(about = "Threshold Schnorr signing participant")]
#[command(version)]
struct Cli {
    /// Participant config file (JSON)
    #[arg(short, long, env = "TSS_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger address of this node
    #[arg(short, long, env = "TSS_ADDRESS")]
    address: Option<String>,

    /// Data directory for secret stores
    #[arg(short, long, env = "TSS_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local group on an in-process ledger and sign messages with it
    Devnet {
        /// Number of members
        #[arg(short, long, default_value_t = 4)]
        n: usize,

        /// Threshold (t-of-n)
        #[arg(short, long, default_value_t = 3)]
        t: usize,

        /// Messages to sign (UTF-8)
        #[arg(short, long)]
        message: Vec<String>,

        /// Keep secret stores under the data directory
        #[arg(long)]
        persist: bool,

        /// Seconds to wait for each ledger outcome
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show stored key shares
    Info,

    /// List stored nonce pairs and their status
    Des,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devnet {
            n,
            t,
            ref message,
            persist,
            timeout,
        } => {
            run_devnet(&cli, n, t, message, persist, Duration::from_secs(timeout)).await?;
        }
        Commands::Info => {
            show_info(&cli)?;
        }
        Commands::Des => {
            show_des(&cli)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<ParticipantConfig> {
    let mut config = match &cli.config {
        Some(path) => ParticipantConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ParticipantConfig::default(),
    };
    if let Some(address) = &cli.address {
        config.address = address.clone();
    }
    if cli.config.is_none() {
        config.data_dir = cli.data_dir.clone();
    }
    Ok(config)
}

fn open_store(cli: &Cli) -> Result<FileStore> {
    let config = load_config(cli)?;
    config.validate()?;
    let path = config.store_path();
    if !path.exists() {
        bail!("no store at {}", path.display());
    }
    Ok(FileStore::open(&path)?)
}

async fn run_devnet(
    cli: &Cli,
    n: usize,
    t: usize,
    messages: &[String],
    persist: bool,
    timeout: Duration,
) -> Result<()> {
    info!(n_members = n, threshold = t, "Starting devnet");

    let ledger = Arc::new(MemoryLedger::new(LedgerConfig::default()));
    let mut events = ledger.subscribe();
    let (stop, stopped) = watch::channel(false);

    let base = load_config(cli)?;
    let mut addresses = Vec::with_capacity(n);
    let mut nodes = Vec::with_capacity(n);
    for i in 1..=n {
        let mut config = base.clone();
        config.address = format!("validator-{}", i);

        let store: Arc<dyn SecretStore> = if persist {
            let path = config.store_path();
            if path.exists() {
                bail!("store {} already exists; remove it or pick another data dir", path.display());
            }
            Arc::new(FileStore::open(&path)?)
        } else {
            Arc::new(MemoryStore::new())
        };

        addresses.push(config.address.clone());
        let participant = Participant::new(config, ledger.clone(), store)?;
        let mut stopped = stopped.clone();
        nodes.push(tokio::spawn(async move {
            participant
                .run(async move {
                    let _ = stopped.changed().await;
                })
                .await
        }));
    }

    let group_id = ledger.create_group(t, addresses).await?;
    let public_key = wait_for(&mut events, timeout, |event| match event {
        LedgerEvent::GroupActivated {
            group_id: id,
            public_key,
            ..
        } if *id == group_id => Some(Ok(public_key.clone())),
        LedgerEvent::GroupFailed { group_id: id, reason } if *id == group_id => {
            Some(Err(anyhow::anyhow!("group {} failed: {}", id, reason)))
        }
        _ => None,
    })
    .await??;

    info!(group_id = %group_id, public_key = hex::encode(&public_key), "Group active");
    println!("Group {} Public Key: {}", group_id, hex::encode(&public_key));

    let point = crypto::decode_point(&public_key)?;
    for message in messages {
        let signing_id = request_signature(&ledger, &base, group_id, message.as_bytes()).await?;
        let signature = wait_for_signature(&mut events, timeout, signing_id).await?;
        let valid = sign::verify(&point, message.as_bytes(), &signature);

        info!(signing_id = %signing_id, valid, "Signature generated");
        println!("Signature for {:?}:", message);
        println!("  R: {}", hex::encode(crypto::encode_point(&signature.r)));
        println!("  z: {}", hex::encode(crypto::encode_scalar(&signature.s)));
        println!("  Valid: {}", valid);
    }

    let _ = stop.send(true);
    for joined in join_all(nodes).await {
        if let Err(e) = joined? {
            warn!(error = %e, "Participant stopped with an error");
        }
    }

    Ok(())
}

/// Request a signature, waiting for signers to publish nonce pairs.
async fn request_signature(
    ledger: &MemoryLedger,
    config: &ParticipantConfig,
    group_id: GroupId,
    message: &[u8],
) -> Result<SigningId> {
    let signing_id = with_retry(&config.retry, "signing request", || async move {
        ledger
            .request_signature(group_id, message.to_vec())
            .await
            .map_err(tss_core::Error::from)
    })
    .await?;
    Ok(signing_id)
}

async fn wait_for_signature(
    events: &mut broadcast::Receiver<Sequenced>,
    timeout: Duration,
    signing_id: SigningId,
) -> Result<Signature> {
    wait_for(events, timeout, |event| match event {
        LedgerEvent::SigningCompleted {
            signing_id: id,
            signature,
            ..
        } if *id == signing_id => Some(Ok(*signature)),
        LedgerEvent::SigningFailed {
            signing_id: id,
            culprit,
            reason,
            ..
        } if *id == signing_id => Some(Err(anyhow::anyhow!(
            "signing {} failed (culprit {:?}): {}",
            id,
            culprit,
            reason
        ))),
        _ => None,
    })
    .await?
}

/// First event `select` maps to a value.
async fn wait_for<T>(
    events: &mut broadcast::Receiver<Sequenced>,
    timeout: Duration,
    mut select: impl FnMut(&LedgerEvent) -> Option<T>,
) -> Result<T> {
    let waiting = async {
        loop {
            match events.recv().await {
                Ok(sequenced) => {
                    if let Some(value) = select(&sequenced.event) {
                        return Ok(value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("ledger closed"),
            }
        }
    };
    tokio::time::timeout(timeout, waiting)
        .await
        .context("timed out waiting for the ledger")?
}

fn show_info(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let group_ids = store.group_ids()?;
    if group_ids.is_empty() {
        println!("No key shares in {}", store.path().display());
        return Ok(());
    }

    for group_id in group_ids {
        let Some(key) = store.group_key(group_id)? else {
            continue;
        };
        println!("Key Share Info:");
        println!("  Group ID: {}", key.group_id);
        println!("  Member ID: {}", key.member_id);
        println!("  Threshold: {}", key.threshold);
        println!("  Public Key: {}", hex::encode(&key.public_key));
        println!("  Public Share: {}", hex::encode(&key.public_share));
    }

    Ok(())
}

fn show_des(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let des = store.des()?;

    println!("Nonce pairs ({} unused):", store.unused_de_count()?);
    for (public, status) in des {
        match status {
            DeStatus::Unused => println!("  {}  unused", public.key()),
            DeStatus::Consumed { signing_id } => {
                println!("  {}  consumed by signing {}", public.key(), signing_id)
            }
        }
    }

    Ok(())
}
