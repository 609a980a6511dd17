use chaingraph_common::storage::{RawGateway, TransformedGateway};
use chaingraph_storage::{
    retry::RetryPolicy, schema, ScyllaRawStore, ScyllaTransformedStore, StoreSession,
};
use chaingraph_updater::{
    cli::{Cli, Command, GlobalArgs, PatchExchangeRatesArgs, UpdateArgs, ValidateArgs},
    config::{AppConfig, EnvironmentConfig, KeyspaceConfig},
    updater::{
        lock::UpdateLock,
        rates::RateAttacher,
        status::validate_history,
        validator::Validator,
        DeltaUpdater, UpdateError, UpdaterSettings,
    },
};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn create_tracing_subscriber() {
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .event_format(format)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() {
    create_tracing_subscriber();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => {}
        Err(err @ UpdateError::LockHeld(_)) => {
            warn!(%err, "Is another updater running? If not, delete the lockfile.");
            std::process::exit(0);
        }
        Err(err) => {
            error!(%err, "Run failed");
            std::process::exit(err.exit_code());
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), UpdateError> {
    let global = cli.args();
    let config = AppConfig::from_yaml(&global.config)?;
    let (environment, keyspace) = config.keyspace(&global.env, &global.currency)?;

    match cli.command() {
        Command::Status => run_status(environment, keyspace).await,
        Command::Update(args) => run_update(&global, environment, keyspace, args).await,
        Command::Validate(args) => run_validate(&global, environment, keyspace, args).await,
        Command::PatchExchangeRates(args) => run_patch_rates(environment, keyspace, args).await,
    }
}

async fn build_stores(
    environment: &EnvironmentConfig,
    keyspace: &KeyspaceConfig,
    write_batch_size: usize,
) -> Result<(ScyllaRawStore, ScyllaTransformedStore), UpdateError> {
    let raw_session =
        StoreSession::connect(&environment.cassandra_nodes, &keyspace.raw_keyspace_name).await?;
    let transformed_session = StoreSession::connect(
        &environment.cassandra_nodes,
        &keyspace.transformed_keyspace_name,
    )
    .await?;
    let configuration = ScyllaTransformedStore::load_configuration(&transformed_session)
        .await?
        .ok_or_else(|| {
            UpdateError::Setup(format!(
                "keyspace {} has no configuration row; run update --create-schema first",
                keyspace.transformed_keyspace_name
            ))
        })?;
    let raw = ScyllaRawStore::new(
        raw_session,
        keyspace.schema_type,
        configuration.block_bucket_size,
    );
    let transformed = ScyllaTransformedStore::new(
        transformed_session,
        configuration,
        keyspace.schema_type,
        write_batch_size,
        RetryPolicy::default(),
    );
    Ok((raw, transformed))
}

async fn create_schema(
    environment: &EnvironmentConfig,
    keyspace: &KeyspaceConfig,
) -> Result<(), UpdateError> {
    let unscoped = StoreSession::connect_unscoped(&environment.cassandra_nodes).await?;
    schema::create_keyspace(&unscoped, &keyspace.raw_keyspace_name, None).await?;
    schema::create_keyspace(&unscoped, &keyspace.transformed_keyspace_name, None).await?;

    let raw_session =
        StoreSession::connect(&environment.cassandra_nodes, &keyspace.raw_keyspace_name).await?;
    schema::create_raw_tables(&raw_session, keyspace.schema_type).await?;

    let transformed_session = StoreSession::connect(
        &environment.cassandra_nodes,
        &keyspace.transformed_keyspace_name,
    )
    .await?;
    schema::create_transformed_tables(&transformed_session, keyspace.schema_type).await?;
    if ScyllaTransformedStore::load_configuration(&transformed_session)
        .await?
        .is_none()
    {
        ScyllaTransformedStore::write_configuration(
            &transformed_session,
            &keyspace.configuration_row(),
        )
        .await?;
    }
    Ok(())
}

async fn run_status(
    environment: &EnvironmentConfig,
    keyspace: &KeyspaceConfig,
) -> Result<(), UpdateError> {
    let (raw, transformed) = build_stores(environment, keyspace, 1).await?;
    let tip = raw.tip().await?;
    let target = tip - keyspace.safety_margin;
    let status = transformed.get_updater_status().await?;
    let last_synced = status
        .as_ref()
        .map(|s| s.last_synced_block)
        .unwrap_or(-1);

    info!(configuration = ?transformed.configuration(), "Transformed keyspace configuration");
    info!(last_synced, raw_tip = tip, target, behind = target - last_synced, "Import range");

    for row in transformed.get_updater_history().await? {
        info!(
            last_synced_block = row.last_synced_block,
            highest_address_id = row.highest_address_id,
            runtime_seconds = row.runtime_seconds,
            timestamp = %row.timestamp,
            "History"
        );
    }
    Ok(())
}

async fn run_update(
    global: &GlobalArgs,
    environment: &EnvironmentConfig,
    keyspace: &KeyspaceConfig,
    args: UpdateArgs,
) -> Result<(), UpdateError> {
    if keyspace.disable_delta_updates {
        return Err(UpdateError::Setup(format!(
            "delta updates are disabled for {} - {} in the configuration",
            global.env, global.currency
        )));
    }
    if args.create_schema {
        create_schema(environment, keyspace).await?;
    }

    let _lock = UpdateLock::acquire(
        &environment.lock_directory,
        &keyspace.raw_keyspace_name,
        &keyspace.transformed_keyspace_name,
    )?;

    let (raw, transformed) =
        build_stores(environment, keyspace, args.write_batch_size).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(%err, "Cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        warn!("Shutdown signal received, discarding the current batch");
        let _ = cancel_tx.send(true);
    });

    let settings = UpdaterSettings {
        schema_type: keyspace.schema_type,
        native_ticker: keyspace.native_ticker(&global.currency),
        batch_size: keyspace.batch_size,
        safety_margin: keyspace.safety_margin,
        end_block: args.end_block,
        forward_fill_rates: args.forward_fill_rates,
        pedantic: args.pedantic,
    };
    let mut updater = DeltaUpdater::new(&raw, &transformed, settings, cancel_rx).await?;
    match updater.run().await {
        Ok(summary) => {
            info!(batches = summary.batches, last_block = ?summary.last_block, "Update finished");
            Ok(())
        }
        Err(UpdateError::Cancelled) => {
            info!("Update cancelled cleanly, status row untouched for the open batch");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn run_validate(
    global: &GlobalArgs,
    environment: &EnvironmentConfig,
    keyspace: &KeyspaceConfig,
    args: ValidateArgs,
) -> Result<(), UpdateError> {
    let (raw, transformed) = build_stores(environment, keyspace, 1).await?;

    let history = transformed.get_updater_history().await?;
    validate_history(&history, args.tolerate_missing_history)?;
    info!(rows = history.len(), "History is consistent");

    // imported exchange rates must be gapless up to the synced block
    if let Some(status) = transformed.get_updater_status().await? {
        let from = (status.last_synced_block - 20).max(0);
        let mut missing = 0;
        for block in from..=status.last_synced_block {
            if transformed.get_exchange_rate(block).await?.is_none() {
                warn!(block, "Missing exchange rate row");
                missing += 1;
            }
        }
        if missing > 0 {
            return Err(UpdateError::InvariantViolation(format!(
                "{missing} gaps in imported exchange rates"
            )));
        }
    }

    let configuration = transformed.configuration().clone();
    let validator = Validator::new(
        &raw,
        &transformed,
        &configuration,
        keyspace.schema_type,
        &keyspace.native_ticker(&global.currency),
    );
    let divergences = validator
        .validate_sample(args.sample_size, keyspace.batch_size.max(100))
        .await?;
    if divergences.is_empty() {
        info!(sample = args.sample_size, "Sampled aggregates match raw data");
        return Ok(());
    }
    if args.pedantic {
        return Err(UpdateError::Divergence(format!(
            "{} of {} sampled addresses diverge",
            divergences.len(),
            args.sample_size
        )));
    }
    warn!(divergences = divergences.len(), "Validator found divergences (non-pedantic)");
    Ok(())
}

async fn run_patch_rates(
    environment: &EnvironmentConfig,
    keyspace: &KeyspaceConfig,
    args: PatchExchangeRatesArgs,
) -> Result<(), UpdateError> {
    let (raw, transformed) = build_stores(environment, keyspace, 1000).await?;
    let bundles = raw
        .block_bundles(args.start_block, args.end_block)
        .await?;
    let attacher = RateAttacher::new(
        transformed.configuration().fiat_currencies.clone(),
        args.forward_fill_rates,
    );
    let slice = attacher.build_slice(&raw, &bundles).await?;
    let ops = slice.to_row_ops();
    let rows = ops.len();
    transformed.batch_write(ops).await?;
    info!(rows, "Patched exchange rates");
    Ok(())
}
