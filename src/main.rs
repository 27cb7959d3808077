use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::limiter::{FileRuleProvider, RateLimiter, RequestDescriptor, RuleSet};
use floodgate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};
use floodgate::telemetry::DecisionMonitor;

#[derive(Parser)]
#[command(name = "floodgate", version, about = "Rate limiting decision engine")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DescriptorArgs {
    /// Source IP address of the request
    #[arg(long)]
    ip: IpAddr,

    /// API client identifier
    #[arg(long)]
    client: Option<String>,

    /// Organization identifier
    #[arg(long)]
    org: Option<String>,

    /// Request path
    #[arg(long)]
    path: String,

    /// HTTP method
    #[arg(long, default_value = "GET")]
    method: String,
}

impl DescriptorArgs {
    fn into_descriptor(self) -> RequestDescriptor {
        let mut descriptor = RequestDescriptor::new(self.ip, self.path, self.method);
        if let Some(client) = self.client {
            descriptor = descriptor.with_client_id(client);
        }
        if let Some(org) = self.org {
            descriptor = descriptor.with_organization_id(org);
        }
        descriptor
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run one admission check and print the decision as JSON.
    ///
    /// Exits non-zero when the request is denied.
    Check(DescriptorArgs),

    /// Print per-rule counter status without consuming quota
    Status(DescriptorArgs),

    /// Clear counters whose keys start with the given prefix
    Reset {
        /// Key prefix, e.g. `ip:192.168.1.100:`
        prefix: String,
    },

    /// Validate a rules file and report rejected rules
    Validate {
        /// Path to the rules file (YAML or JSON)
        rules: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => {
            FloodgateConfig::from_file(path).with_context(|| format!("loading config {}", path))?
        }
        None => FloodgateConfig::default(),
    };

    match cli.command {
        Command::Check(args) => {
            let limiter = build_limiter(&config).await?;
            let decision = limiter.check(&args.into_descriptor()).await;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            if !decision.allowed {
                std::process::exit(1);
            }
        }
        Command::Status(args) => {
            let limiter = build_limiter(&config).await?;
            let statuses = limiter.status(&args.into_descriptor()).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        Command::Reset { prefix } => {
            let store = build_store(&config).await?;
            let removed = store.reset(&prefix).await?;
            info!(prefix = %prefix, removed = removed, "Counters reset");
            println!("{}", removed);
        }
        Command::Validate { rules } => {
            let set = RuleSet::from_file(&rules)?;
            let total = set.rules.len();
            let mut rejected = 0;
            for rule in &set.rules {
                if let Err(e) = rule.validate() {
                    eprintln!("rejected: {}", e);
                    rejected += 1;
                }
            }
            println!("{} rules, {} rejected", total, rejected);
            if rejected > 0 {
                bail!("{} invalid rules in {}", rejected, rules.display());
            }
        }
    }

    Ok(())
}

async fn build_store(config: &FloodgateConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    if config.store.endpoint == "memory" {
        Ok(Arc::new(MemoryCounterStore::new()))
    } else {
        let store = RedisCounterStore::connect(&config.store.endpoint)
            .await
            .with_context(|| format!("connecting to store {}", config.store.endpoint))?;
        Ok(Arc::new(store))
    }
}

async fn build_limiter(config: &FloodgateConfig) -> anyhow::Result<RateLimiter> {
    let Some(rules_path) = config.rules.path.as_deref() else {
        bail!("no rules path configured; set rules.path in the config file");
    };

    let provider = FileRuleProvider::load(rules_path, config.rules.reload_interval())?;
    let store = build_store(config).await?;
    let monitor = Arc::new(DecisionMonitor::new(config.monitor_config()));

    Ok(RateLimiter::new(Arc::new(provider), store)
        .with_failure_policy(config.store.fail_policy)
        .with_store_timeout(config.store.timeout())
        .with_monitor(monitor))
}
