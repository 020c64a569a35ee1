mod accounts;
mod approvals;
mod audit;
mod auth;
mod bank;
mod cari;
mod cash;
mod cli;
mod commitments;
mod db;
mod error;
mod fmt;
mod http;
mod idempotency;
mod journal;
mod models;
mod org;
mod period_close;
mod periods;
mod posting;
mod purpose_accounts;
mod query;
mod reconciler;
mod scope;
mod settings;
mod settlement;
#[cfg(test)]
mod test_support;
mod trial_balance;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{AccountsCommands, BankCommands, Cli, Commands, ReportCommands, TenantCommands};
use settings::{load_settings, Settings};

/// `RUST_LOG` wins; otherwise the server logs at the configured level and
/// one-shot commands only surface warnings.
fn init_tracing(settings: &Settings, server: bool) {
    let default_level = if server { settings.log_level.as_str() } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if settings.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { data_dir } => cli::init::run(data_dir)?,
        Commands::Serve { bind } => cli::serve::run(bind)?,
        Commands::Tenant { command } => match command {
            TenantCommands::Create {
                code,
                name,
                admin_email,
            } => cli::tenant::create(&code, &name, &admin_email)?,
        },
        Commands::Demo => cli::demo::run()?,
        Commands::Accounts { command } => match command {
            AccountsCommands::List { tenant, entity } => {
                cli::accounts::list(&tenant, entity.as_deref())?
            }
        },
        Commands::Bank { command } => match command {
            BankCommands::Import {
                file,
                tenant,
                entity,
                account,
            } => cli::bank::import(&file, &tenant, &entity, &account)?,
        },
        Commands::Report { command } => match command {
            ReportCommands::TrialBalance {
                tenant,
                book,
                period,
                rollup,
            } => cli::report::trial_balance(&tenant, &book, &period, rollup)?,
        },
        Commands::Backup { output } => cli::backup::run(output)?,
        Commands::Status => cli::status::run()?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let server = matches!(cli.command, Commands::Serve { .. });
    init_tracing(&load_settings(), server);

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
