// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tally - usage accounting and low-balance notification.
//!
//! This is the binary entry point for the Tally service.

mod commands;
mod serve;
mod shutdown;

use std::path::PathBuf;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tally_config::TallyConfig;
use tally_core::Provider;

use crate::commands::RecordArgs;

/// Tally - usage accounting and low-balance notification.
#[derive(Parser, Debug)]
#[command(name = "tally", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the XDG hierarchy.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduled notification dispatcher until interrupted.
    Serve,
    /// Deliver pending notifications once and exit.
    Dispatch {
        #[arg(long)]
        json: bool,
    },
    /// Record one external API call.
    Record {
        user: String,
        provider: Provider,
        model: String,
        #[arg(long, default_value_t = 0)]
        prompt_tokens: u32,
        #[arg(long, default_value_t = 0)]
        completion_tokens: u32,
        /// Cost of the call; priced from the model table when omitted.
        #[arg(long)]
        cost: Option<BigDecimal>,
        /// Background task the call was made for.
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Add funds to a balance.
    Credit {
        user: String,
        provider: Provider,
        amount: BigDecimal,
        #[arg(long)]
        json: bool,
    },
    /// Show a user's balances.
    Balance {
        user: String,
        #[arg(long)]
        json: bool,
    },
    /// Summarize a user's usage.
    Usage {
        user: String,
        #[arg(long)]
        provider: Option<Provider>,
        /// Only count calls at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(path: Option<&std::path::Path>) -> TallyConfig {
    let loaded = match path {
        Some(path) => tally_config::load_and_validate_path(path),
        None => tally_config::load_and_validate(),
    };
    match loaded {
        Ok(config) => config,
        Err(errors) => {
            tally_config::render_errors(&errors);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    serve::init_tracing(&config.service.log_level);

    let result = match cli.command {
        Commands::Serve => serve::run_serve(&config).await,
        Commands::Dispatch { json } => commands::run_dispatch(&config, json).await,
        Commands::Record {
            user,
            provider,
            model,
            prompt_tokens,
            completion_tokens,
            cost,
            task,
            json,
        } => {
            let args = RecordArgs {
                user,
                provider,
                model,
                prompt_tokens,
                completion_tokens,
                cost,
                task,
            };
            commands::run_record(&config, args, json).await
        }
        Commands::Credit {
            user,
            provider,
            amount,
            json,
        } => commands::run_credit(&config, &user, provider, &amount, json).await,
        Commands::Balance { user, json } => commands::run_balance(&config, &user, json).await,
        Commands::Usage {
            user,
            provider,
            since,
            json,
        } => commands::run_usage(&config, &user, provider, since, json).await,
        Commands::Config => commands::run_config(&config),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_arguments_parse() {
        let cli = Cli::try_parse_from([
            "tally",
            "record",
            "alice",
            "OpenAI",
            "gpt-4o",
            "--prompt-tokens",
            "100",
            "--completion-tokens",
            "50",
            "--cost",
            "0.0125",
        ])
        .unwrap();
        match cli.command {
            Commands::Record {
                provider,
                prompt_tokens,
                completion_tokens,
                cost,
                ..
            } => {
                assert_eq!(provider, Provider::OpenAI);
                assert_eq!(prompt_tokens, 100);
                assert_eq!(completion_tokens, 50);
                assert_eq!(cost.unwrap().to_string(), "0.0125");
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(Cli::try_parse_from(["tally", "credit", "alice", "acme", "10"]).is_err());
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["tally", "dispatch", "--config", "/etc/tally/alt.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tally/alt.toml")));
    }

    #[test]
    fn usage_since_parses_rfc3339() {
        let cli = Cli::try_parse_from([
            "tally",
            "usage",
            "alice",
            "--provider",
            "google",
            "--since",
            "2026-03-01T00:00:00Z",
        ])
        .unwrap();
        let Commands::Usage { provider, since, .. } = cli.command else {
            panic!("expected usage");
        };
        assert_eq!(provider, Some(Provider::Google));
        assert!(since.is_some());
    }

    #[test]
    fn binary_loads_config_defaults() {
        let config = tally_config::load_and_validate_str("").expect("default config should be valid");
        assert_eq!(config.service.name, "tally");
    }
}
