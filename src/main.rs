use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use fastratelimit::context::{Principal, SimpleRequest};
use fastratelimit::ratelimit::{EngineBuilder, KeySpec, LimiterRules};
use fastratelimit::{parse_rate, Action, Engine, Query, RatelimitError, RatelimitSettings};

#[derive(Parser, Debug)]
#[command(name = "fastratelimit", version, about = "Fixed-window rate limit decisions")]
struct Cli {
    /// Settings file (YAML); RATELIMIT_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse a rate expression such as `5/m`
    Parse { rate: String },

    /// Evaluate a rate limit and print the result of every call
    Hit {
        #[arg(long)]
        group: String,
        #[arg(long)]
        rate: String,
        /// Literal key
        #[arg(long, conflicts_with = "strategy")]
        key: Option<String>,
        /// Strategy reference such as `ip:56` or `user_or_ip`
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long, default_value = "increase")]
        action: Action,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long, default_value = "127.0.0.1")]
        remote_addr: String,
        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,
        /// Count in Redis instead of process memory
        #[arg(long)]
        redis: Option<String>,
    },

    /// Validate a limiter rules file and list its limiters
    Rules {
        /// Rules file; `rules_path` from the settings when absent
        file: Option<PathBuf>,
    },
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<RatelimitSettings> {
    let settings = match path {
        Some(path) => RatelimitSettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => RatelimitSettings::from_env().context("loading settings from environment")?,
    };
    debug!(?settings, "Settings loaded");
    Ok(settings)
}

#[cfg(feature = "redis")]
fn with_redis(builder: EngineBuilder, name: &str, url: &str) -> anyhow::Result<EngineBuilder> {
    let cache = fastratelimit::cache::RedisCache::connect(url)?;
    cache.ping()?;
    Ok(builder.cache(name, Arc::new(cache)))
}

#[cfg(not(feature = "redis"))]
fn with_redis(_builder: EngineBuilder, _name: &str, _url: &str) -> anyhow::Result<EngineBuilder> {
    bail!("built without the `redis` feature")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Parse { rate } => {
            let spec = parse_rate(&rate)?;
            println!(
                "{}",
                serde_json::json!({ "limit": spec.limit(), "period": spec.period() })
            );
        }

        Command::Hit {
            group,
            rate,
            key,
            strategy,
            action,
            repeat,
            method,
            remote_addr,
            user,
            redis,
        } => {
            let settings = load_settings(cli.config.as_ref())?;
            let cache_name = settings.default_cache.clone();
            let mut builder = Engine::builder().settings(settings);
            if let Some(url) = redis {
                builder = with_redis(builder, &cache_name, &url)?;
            }
            let engine = builder.build();

            let key = match (key, strategy) {
                (_, Some(strategy)) => KeySpec::strategy(&strategy),
                (Some(key), None) => KeySpec::bytes(key),
                (None, None) => bail!("either --key or --strategy is required"),
            };
            let mut request = SimpleRequest::new(method).with_remote_addr(remote_addr);
            if let Some(user) = user {
                request = request.with_principal(Principal::user(user));
            }

            let query = Query::new(group, key, parse_rate(&rate)?)
                .context(&request)
                .action(action);
            for _ in 0..repeat {
                let result = match engine.aget_ratelimit(&query).await {
                    Ok(result) => result,
                    Err(RatelimitError::Disabled(result)) => *result,
                    Err(e) => return Err(e.into()),
                };
                println!("{}", serde_json::to_string(&result.snapshot())?);
            }
        }

        Command::Rules { file } => {
            let settings = load_settings(cli.config.as_ref())?;
            let file = match file.or_else(|| settings.rules_path.clone().map(PathBuf::from)) {
                Some(file) => file,
                None => bail!("no rules file given and no rules_path configured"),
            };
            let rules = LimiterRules::from_file(&file)?;
            let engine = Arc::new(Engine::builder().settings(settings).build());
            let limiters = rules.build(engine)?;
            info!(count = limiters.len(), "Rules are valid");
            for rule in &rules.limits {
                println!(
                    "{}",
                    serde_json::json!({
                        "name": rule.name,
                        "group": rule.group(),
                        "rate": rule.rate.to_string(),
                        "block": rule.block,
                        "wait": rule.wait,
                    })
                );
            }
        }
    }

    Ok(())
}
