//! Tokenization engine demo binary.
//!
//! Wires an [`Orchestrator`] over the in-memory reference store and KMS/
//! crypto implementations, then runs whichever subcommand was requested.
//! A real deployment swaps these in-memory pieces for persistent and
//! production-grade collaborators behind the same traits.

mod cli;

use std::sync::Arc;

use clap::Parser;
use eyre::Context;
use figment::providers::{Env, Serialized};
use figment::Figment;
use rand::Rng;
use tokenizer_core::{
    BatchVersionRegistry, Orchestrator, RegisterDocumentOptions, RegistrationExpectation,
    TokenizerConfig,
};
use tokenizer_crypto::{AesGcmContentEncryptor, ContentEncryptor, RecipientKey, RecipientSet};
use tokenizer_kms::{HmacSigner, InMemoryHmacSigner, StaticTokenizerProvider, TokenizerProvider};
use tokenizer_observability::{init_logging, LogLevel, LoggingConfig};
use tokenizer_store::{
    BatchVersionOptions, InMemoryBatchVersionStore, InMemoryEntityStore, InMemoryPairwiseTokenStore,
    InMemoryRegistrationStore, InMemoryTokenBatchStore,
};

use cli::{Cli, Command, DemoArgs};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "error" => LogLevel::Error,
        "warn" => LogLevel::Warn,
        "debug" => LogLevel::Debug,
        "trace" => LogLevel::Trace,
        _ => LogLevel::Info,
    };
    init_logging(&LoggingConfig { level, json: cli.json_logs })?;

    match cli.command {
        Command::Demo(args) => run_demo(args).await,
    }
}

async fn build_orchestrator(config: TokenizerConfig) -> eyre::Result<(Orchestrator, Arc<BatchVersionRegistry>)> {
    let entities = Arc::new(InMemoryEntityStore::new());
    let batches = Arc::new(InMemoryTokenBatchStore::new());
    let registrations = Arc::new(InMemoryRegistrationStore::new());
    let pairwise = Arc::new(InMemoryPairwiseTokenStore::new(config.ensure_pairwise_token_value_index));

    let batch_version_store = Arc::new(InMemoryBatchVersionStore::new());

    tokenizer_store::migrate(
        batch_version_store.as_ref(),
        entities.as_ref(),
        batches.as_ref(),
        registrations.as_ref(),
        pairwise.as_ref(),
    )
    .await
    .wrap_err("store migration failed")?;

    let mut key = vec![0u8; 32];
    rand::rng().fill(key.as_mut_slice());
    let signer: Arc<dyn HmacSigner> = Arc::new(InMemoryHmacSigner::new("tokenizer-demo", key));
    let tokenizers: Arc<dyn TokenizerProvider> = Arc::new(StaticTokenizerProvider::new(signer));

    let batch_versions = Arc::new(BatchVersionRegistry::new(batch_version_store, tokenizers.clone()));

    let encryptor: Arc<dyn ContentEncryptor> = Arc::new(AesGcmContentEncryptor::new());

    let orchestrator = Orchestrator::new(
        entities,
        batches,
        registrations,
        pairwise,
        batch_versions.clone(),
        tokenizers,
        encryptor,
        config,
    );
    Ok((orchestrator, batch_versions))
}

/// Load [`TokenizerConfig`], overriding defaults with any `TOKENIZER_*`
/// environment variables (e.g. `TOKENIZER_DEFAULT_VERSION_OPTIONS.TTL_MS`).
fn load_config() -> eyre::Result<TokenizerConfig> {
    Figment::from(Serialized::defaults(TokenizerConfig::default()))
        .merge(Env::prefixed("TOKENIZER_").split("_"))
        .extract()
        .wrap_err("failed to load configuration")
}

async fn run_demo(args: DemoArgs) -> eyre::Result<()> {
    let config = load_config()?;
    let batch_token_count = config.default_version_options.batch_token_count;
    let ttl_ms = config.default_version_options.ttl_ms;
    let options: BatchVersionOptions = config.default_version_options.into();
    let (orchestrator, batch_versions) = build_orchestrator(config)
        .await
        .wrap_err("failed to build the orchestrator")?;
    batch_versions
        .set_options(options)
        .await
        .wrap_err("failed to set the pending batch-version options")?;

    tracing::info!(
        token_count = args.token_count,
        batch_token_count,
        "registering a document and manufacturing tokens"
    );

    let mut recipient_key = [0u8; 32];
    rand::rng().fill(recipient_key.as_mut_slice());

    let register_options = RegisterDocumentOptions {
        external_id: args.external_id.clone().into_bytes(),
        document: args.document.clone().into_bytes(),
        recipient_chain: vec![RecipientSet(vec![RecipientKey(recipient_key)])],
        ttl_ms,
        creator: None,
        new_registration: RegistrationExpectation::Unknown,
        internal_id: None,
    };

    let result = orchestrator
        .register_document_and_create(register_options, Vec::new(), args.token_count, args.min_assurance)
        .await
        .wrap_err("register_document_and_create failed")?;

    println!("registered internal id: {}", hex::encode(result.registration.internal_id.as_bytes()));
    println!("manufactured {} token(s):", result.tokens.len());
    for token in &result.tokens {
        println!("  {}", hex::encode(token));
    }

    let sample = result.tokens.first().ok_or_else(|| eyre::eyre!("no tokens were manufactured"))?;
    let resolution = orchestrator
        .resolve_to_pairwise(&args.requester, sample, args.min_assurance.max(0), false)
        .await
        .wrap_err("resolve_to_pairwise failed")?;

    println!(
        "resolved for requester {:?}: pairwise token {}",
        args.requester,
        hex::encode(resolution.pairwise_token)
    );

    Ok(())
}

