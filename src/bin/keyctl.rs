//! Administrative tool for the plan directory.
//!
//! Covers the directory write paths (issue, revoke, plan change, billing
//! sync) and reads today's usage counter for a key.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use gateway::billing::{SubscriptionUpdate, apply_subscription};
use gateway::configuration::{ServerConfig, resolve};
use gateway::counter::RedisCounterStore;
use gateway::directory::SqlitePlanDirectory;
use gateway::limiter::RateLimiter;

#[derive(Parser, Debug)]
#[command(name = "keyctl", about = "Manage gateway API keys and plans")]
struct Args {
    /// Gateway config file (same file the gateway is started with).
    #[arg(short, long, default_value = "conf.yaml")]
    conf: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a new key on the free plan.
    Issue {
        #[arg(long)]
        email: String,
        #[arg(long)]
        customer: String,
    },
    /// List a user's keys.
    List {
        #[arg(long)]
        email: String,
    },
    /// Deactivate a key.
    Revoke {
        #[arg(long)]
        key: String,
    },
    /// Change the plan of every key of a user.
    SetPlan {
        #[arg(long)]
        email: String,
        #[arg(long)]
        plan: String,
    },
    /// Apply a subscription update received from billing.
    SyncSubscription {
        #[arg(long)]
        customer: String,
        #[arg(long)]
        price: String,
        #[arg(long)]
        status: String,
    },
    /// Show today's request count for a key, or every counter with --all.
    Usage {
        #[arg(long, required_unless_present = "all", conflicts_with = "all")]
        key: Option<String>,
        #[arg(long)]
        all: bool,
    },
}

// Scanning every counter can take far longer than a request-path call.
const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let conf = ServerConfig::from_yaml_file(&args.conf)?;
    let base = args.conf.parent().unwrap_or_else(|| Path::new("."));
    let plan_db = resolve(base, &conf.plan_db);
    let directory = SqlitePlanDirectory::open(&plan_db)
        .with_context(|| format!("opening plan directory {}", plan_db.display()))?;

    match args.command {
        Command::Issue { email, customer } => {
            let issued = directory.issue_key(&email, &customer)?;
            println!("{}\t{}", issued.key, issued.plan);
        }
        Command::List { email } => {
            for key in directory.keys_for_email(&email)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    key.key,
                    key.plan,
                    if key.active { "active" } else { "inactive" },
                    key.created_at
                );
            }
        }
        Command::Revoke { key } => {
            directory.revoke(&key)?;
            println!("API key revoked");
        }
        Command::SetPlan { email, plan } => {
            let updated = directory.set_plan_for_email(&email, &plan, &conf.quota_policy())?;
            println!("Plan updated to {plan} on {updated} key(s)");
        }
        Command::SyncSubscription {
            customer,
            price,
            status,
        } => {
            let update = SubscriptionUpdate {
                customer_id: customer,
                price_id: price,
                status,
            };
            let change = apply_subscription(&directory, &conf.billing, &update)?;
            println!("plan={} active={}", change.plan, change.active);
        }
        Command::Usage { key, all } => {
            let Some(url) = conf.redis_url.as_deref() else {
                bail!("usage needs redis_url; in-process counters live inside the gateway");
            };
            let counters = Arc::new(RedisCounterStore::open(url)?);
            let limiter = RateLimiter::new(Arc::new(directory), counters, conf.quota_policy());
            match key {
                Some(key) if !all => {
                    let limiter = limiter.with_store_timeout(conf.store_timeout());
                    println!("{}", limiter.usage(&key).await?);
                }
                _ => {
                    let limiter = limiter.with_store_timeout(REPORT_TIMEOUT);
                    for row in limiter.usage_report().await? {
                        println!("{}\t{}\t{}", row.window, row.credential, row.used);
                    }
                }
            }
        }
    }

    Ok(())
}
