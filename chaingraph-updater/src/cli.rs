use clap::{Args, Parser, Subcommand};

/// chaingraph delta updater
///
/// Keeps a transformed analytics keyspace in sync with its raw ledger
/// keyspace by incremental, idempotent batch updates.
#[derive(Parser, PartialEq, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    global_args: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn args(&self) -> GlobalArgs {
        self.global_args.clone()
    }

    pub fn command(&self) -> Command {
        self.command.clone()
    }
}

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
pub struct GlobalArgs {
    /// Environments configuration file
    #[clap(long, env = "CHAINGRAPH_CONFIG", default_value = "./config.yaml")]
    pub config: String,

    /// Environment to operate in
    #[clap(long, short)]
    pub env: String,

    /// Currency/network keyspace pair to operate on
    #[clap(long, short)]
    pub currency: String,
}

#[derive(Subcommand, Clone, PartialEq, Debug)]
pub enum Command {
    /// Shows the planned import range and the update history.
    Status,
    /// Advances the transformed keyspace towards the raw tip.
    Update(UpdateArgs),
    /// Cross-checks status history and re-derives sampled aggregates.
    Validate(ValidateArgs),
    /// Re-materializes per-block fiat vectors for a block range.
    PatchExchangeRates(PatchExchangeRatesArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct UpdateArgs {
    /// Stop after this block instead of following the raw tip
    #[clap(long)]
    pub end_block: Option<i64>,

    /// Rows per write chunk sent to the store
    #[clap(long, default_value = "2500")]
    pub write_batch_size: usize,

    /// Carry the last known exchange rate forward across gaps
    #[clap(long)]
    pub forward_fill_rates: bool,

    /// Re-check every emitted row against the store before writing
    #[clap(long)]
    pub pedantic: bool,

    /// Create keyspaces, tables and the configuration row first
    #[clap(long)]
    pub create_schema: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ValidateArgs {
    /// Number of addresses to re-derive from raw
    #[clap(long, default_value = "50")]
    pub sample_size: usize,

    /// Accept keyspaces without delta-updater history
    #[clap(long)]
    pub tolerate_missing_history: bool,

    /// Treat divergences as fatal (exit code 2)
    #[clap(long)]
    pub pedantic: bool,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct PatchExchangeRatesArgs {
    #[clap(long)]
    pub start_block: i64,

    #[clap(long)]
    pub end_block: i64,

    #[clap(long)]
    pub forward_fill_rates: bool,
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["chaingraph", "--env", "dev", "--currency", "btc"]
    }

    #[test]
    fn parses_update_command() {
        let mut args = base_args();
        args.extend([
            "update",
            "--end-block",
            "850000",
            "--write-batch-size",
            "500",
            "--forward-fill-rates",
            "--pedantic",
        ]);
        let cli = Cli::try_parse_from(args).expect("parse errored");
        assert_eq!(
            cli.command(),
            Command::Update(UpdateArgs {
                end_block: Some(850_000),
                write_batch_size: 500,
                forward_fill_rates: true,
                pedantic: true,
                create_schema: false,
            })
        );
        assert_eq!(cli.args().env, "dev");
        assert_eq!(cli.args().currency, "btc");
    }

    #[test]
    fn update_defaults_follow_the_tip() {
        let mut args = base_args();
        args.push("update");
        let cli = Cli::try_parse_from(args).expect("parse errored");
        let Command::Update(update) = cli.command() else {
            panic!("expected update");
        };
        assert_eq!(update.end_block, None);
        assert_eq!(update.write_batch_size, 2500);
        assert!(!update.forward_fill_rates);
    }

    #[test]
    fn env_and_currency_are_required() {
        assert!(Cli::try_parse_from(vec!["chaingraph", "status"]).is_err());
    }

    #[test]
    fn parses_validate_and_patch() {
        let mut args = base_args();
        args.extend(["validate", "--sample-size", "10"]);
        let cli = Cli::try_parse_from(args).expect("parse errored");
        assert!(matches!(cli.command(), Command::Validate(v) if v.sample_size == 10));

        let mut args = base_args();
        args.extend(["patch-exchange-rates", "--start-block", "10", "--end-block", "20"]);
        let cli = Cli::try_parse_from(args).expect("parse errored");
        assert!(matches!(cli.command(), Command::PatchExchangeRates(_)));
    }
}
