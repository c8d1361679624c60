//! Command-line surface for the demo binary.
//!
//! This is not an administrative console for a running deployment — there's
//! no persistent store backing it, so state only lives for the duration of
//! one invocation. It exists to exercise the engine's public operations
//! end-to-end from the command line.

use clap::{Parser, Subcommand};

/// Tokenization engine demo binary.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Emit newline-delimited JSON logs instead of the human-readable format.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Verbosity, following `tracing-subscriber` directive syntax.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register a document, manufacture tokens for it, and resolve one of
    /// those tokens back to a pairwise pseudonym — exercising the engine's
    /// whole lifecycle in a single process.
    Demo(DemoArgs),
}

/// Arguments for [`Command::Demo`].
#[derive(Debug, clap::Args)]
pub struct DemoArgs {
    /// The external identifier to register (e.g. an email address).
    #[arg(long, default_value = "alice@example.com")]
    pub external_id: String,

    /// The document content to register and encrypt.
    #[arg(long, default_value = "{}")]
    pub document: String,

    /// Number of tokens to manufacture for the registered entity.
    #[arg(long, default_value_t = 3)]
    pub token_count: u16,

    /// Minimum level of assurance required to resolve a token. `-1` marks
    /// the batch unpinned.
    #[arg(long, default_value_t = 2)]
    pub min_assurance: i32,

    /// Identifier of the requester resolving the sample token.
    #[arg(long, default_value = "demo-requester")]
    pub requester: String,
}
