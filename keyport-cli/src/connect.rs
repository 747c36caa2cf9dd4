//! `keyport connect`: activate a raw-secret connector and print the account panel.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::primitives::utils::format_ether;
use anyhow::{Context, anyhow, bail};
use clap::ArgGroup;
use futures::StreamExt;
use keyport::prelude::*;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Arguments of the `connect` command.
#[derive(clap::Args, Debug)]
#[command(group(
    ArgGroup::new("secret")
        .required(true)
        .args(["private_key", "mnemonic", "keystore"])
))]
pub struct ConnectArgs {
    /// Hex-encoded private key
    #[arg(long, env = "KEYPORT_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// BIP-39 mnemonic phrase; the first account is used
    #[arg(long)]
    mnemonic: Option<String>,

    /// Optional mnemonic passphrase
    #[arg(long, requires = "mnemonic")]
    passphrase: Option<String>,

    /// Path to an encrypted keystore file
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Keystore password
    #[arg(long, env = "KEYPORT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// JSON-RPC endpoint used for chain reads
    #[arg(long, env = "KEYPORT_RPC_URL", default_value = "http://localhost:8545")]
    rpc_url: String,

    /// Chain id the connector reports
    #[arg(long, env = "KEYPORT_CHAIN_ID", default_value_t = 1)]
    chain_id: ChainId,

    /// Chains the application accepts (comma separated)
    #[arg(long, value_delimiter = ',')]
    supported_chains: Vec<ChainId>,

    /// Block polling interval in milliseconds
    #[arg(long, default_value_t = keyport::config::DEFAULT_POLLING_INTERVAL_MS)]
    polling_interval_ms: u64,

    /// Sign this message with the connected account
    #[arg(long)]
    sign: Option<String>,

    /// Print new blocks until Ctrl-C
    #[arg(long)]
    watch: bool,
}

/// Run the `connect` command.
pub async fn run_connect(mut args: ConnectArgs) -> anyhow::Result<()> {
    let config = ConnectorConfig::new(args.chain_id, args.rpc_url.clone())
        .with_polling_interval(Duration::from_millis(args.polling_interval_ms));
    let connector = build_connector(&mut args, config).await?;
    info!(address = ?connector.address(), "secret material resolved");

    let mut coordinator_config = CoordinatorConfig::default();
    if !args.supported_chains.is_empty() {
        coordinator_config = coordinator_config.with_supported_chain_ids(args.supported_chains.clone());
    }
    let coordinator = ActivationCoordinator::new(coordinator_config);

    let result = session(&coordinator, Arc::new(connector), &args).await;
    coordinator.shutdown().await;
    result
}

async fn session(
    coordinator: &ActivationCoordinator,
    connector: Arc<RawSecretConnector>,
    args: &ConnectArgs,
) -> anyhow::Result<()> {
    coordinator.activate(connector).await.map_err(|e| report(&e))?;

    let snapshot = coordinator.snapshot();
    let (Some(client), Some(account)) = (snapshot.client(), snapshot.account) else {
        bail!("connector activated without an account");
    };
    print_panel(&client, account).await?;

    if let Some(message) = &args.sign {
        let signature = client
            .sign_message(account, message.as_bytes())
            .await
            .context("failed to sign message")?;
        println!("Signature:    {signature}");
    }

    if args.watch {
        watch_blocks(&client).await;
    }
    Ok(())
}

async fn build_connector(
    args: &mut ConnectArgs,
    config: ConnectorConfig,
) -> anyhow::Result<RawSecretConnector> {
    let connector = if let Some(key) = args.private_key.take().map(Zeroizing::new) {
        RawSecretConnector::from_private_key(config, &key)
    } else if let Some(phrase) = args.mnemonic.take().map(Zeroizing::new) {
        let passphrase = args.passphrase.take().map(Zeroizing::new);
        RawSecretConnector::from_mnemonic(config, &phrase, passphrase.as_deref().map(String::as_str))
    } else if let Some(path) = args.keystore.take() {
        let password = args
            .password
            .take()
            .map(Zeroizing::new)
            .ok_or_else(|| anyhow!("--password or KEYPORT_PASSWORD is required with --keystore"))?;
        let keystore = Zeroizing::new(
            tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read keystore {}", path.display()))?,
        );
        RawSecretConnector::from_keystore(config, &keystore, &password)
    } else {
        bail!("one of --private-key, --mnemonic or --keystore is required");
    };
    connector.map_err(|e| report(&e))
}

fn report(err: &ActivationError) -> anyhow::Error {
    debug!(error = ?err, "activation failed");
    anyhow!("{}: {err}", err.user_message())
}

async fn print_panel(client: &ChainClient, account: Address) -> anyhow::Result<()> {
    let chain_id = client.chain_id().await?;
    let block = client.block_number().await?;
    let balance = client.balance(account).await?;

    println!("Chain Id:     {chain_id}");
    println!("Block Number: {block}");
    println!("Account:      {account}");
    println!("Balance:      Ξ{}", format_ether(balance));
    Ok(())
}

async fn watch_blocks(client: &ChainClient) {
    let mut blocks = client.blocks();
    info!("watching for new blocks, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = blocks.next() => match next {
                Some(number) => println!("Block Number: {number}"),
                None => break,
            },
        }
    }
}
