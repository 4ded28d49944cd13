use balance_service::seed::{seed_accounts, DEFAULT_ACCOUNT_COUNT, DEFAULT_INITIAL_BALANCE};
use balance_service::{BalanceService, BalanceServiceConfig};
use clap::{Parser, Subcommand};
use common::decimal::Amount;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Balance Service CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Redis URL (overrides REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// Commands
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset both stores with freshly seeded accounts
    Seed {
        /// Number of accounts
        #[arg(short, long, default_value_t = DEFAULT_ACCOUNT_COUNT)]
        count: usize,

        /// Opening balance of every account
        #[arg(short, long, default_value_t = DEFAULT_INITIAL_BALANCE)]
        balance: Amount,
    },
    /// Show an account balance
    Balance {
        account: String,

        /// Read from the cache store
        #[arg(short, long)]
        fast: bool,
    },
    /// Deposit into an account
    Deposit {
        account: String,
        amount: Amount,

        /// Use the cache store
        #[arg(short, long)]
        fast: bool,
    },
    /// Withdraw from an account
    Withdraw {
        account: String,
        amount: Amount,

        /// Use the cache store
        #[arg(short, long)]
        fast: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "balance_service={level},common={level},audit={level}",
            level = cli.log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = BalanceServiceConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }

    info!(
        "Starting balance service with database pool size: {}, cache attempts: {}",
        config.db_pool_size, config.cache_retry.max_attempts
    );
    let service = BalanceService::with_config(&config).await?;

    // Process commands
    match cli.command {
        Commands::Seed { count, balance } => {
            let accounts = seed_accounts(&service, count, balance).await?;
            println!("seeded {} accounts with {}", accounts.len(), balance);
        }
        Commands::Balance { account, fast } => {
            let balance = if fast {
                service.fast_get_balance(&account).await?
            } else {
                service.get_balance(&account).await?
            };
            println!("{}", balance);
        }
        Commands::Deposit { account, amount, fast } => {
            let change = if fast {
                service.fast_deposit(&account, amount).await?
            } else {
                service.deposit(&account, amount).await?
            };
            println!("{} -> {}", change.before, change.after);
        }
        Commands::Withdraw { account, amount, fast } => {
            let change = if fast {
                service.fast_withdraw(&account, amount).await?
            } else {
                service.withdraw(&account, amount).await?
            };
            println!("{} -> {}", change.before, change.after);
        }
    }

    Ok(())
}
