//! # KubeWise
//!
//! Watches Helm release records in a Kubernetes cluster and posts a short
//! message to Slack (or the log) whenever a release is installed, upgraded
//! or uninstalled.

mod demo;
mod wiring;

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use kubewise_config::{Config, ConfigLoad, ConfigLoader, ConfigWarnings};
use kubewise_core::Controller;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_LOG_FILTER: &str = "info,reqwest=warn,hyper=warn";

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "kubewise", version)]
#[command(about = "Notifies a chat channel about Helm release changes in a Kubernetes cluster")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Configuration file (defaults to kubewise.toml or config/kubewise.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dotenv file read before the environment (defaults to .env)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Namespace to watch (overrides config; all namespaces when unset)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Log filter directives, e.g. `debug` or `info,kubewise::watcher=debug`
    #[arg(long, env = "KW_LOG")]
    log: Option<String>,

    /// Run against an in-memory cluster with scripted release activity
    #[arg(long, env = "KW_DEMO", default_value_t = false)]
    demo: bool,

    /// Delay between scripted demo steps
    #[arg(long, value_parser = humantime_duration, default_value = "5s")]
    demo_interval: Duration,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration, print a summary and exit
    Check,
}

fn humantime_duration(raw: &str) -> Result<Duration, String> {
    kubewise_config::util::parse_duration(raw).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad {
        mut config,
        warnings,
    } = load_config(&cli.run).context("failed to load configuration")?;
    if let Some(namespace) = cli.run.namespace.clone().filter(|ns| !ns.trim().is_empty()) {
        config.namespace = Some(namespace);
    }

    init_tracing(cli.run.log.as_deref());
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    report_warnings(&warnings);

    match cli.command {
        Some(Command::Check) => {
            print_summary(&config, cli.run.demo);
            Ok(())
        }
        None => run(config, &cli.run).await,
    }
}

fn load_config(args: &RunArgs) -> Result<ConfigLoad, kubewise_config::ConfigLoadError> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    loader.load()
}

fn init_tracing(directives: Option<&str>) {
    let filter = match directives {
        Some(directives) => tracing_subscriber::EnvFilter::new(directives),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn report_warnings(warnings: &ConfigWarnings) {
    for warning in warnings {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
}

fn print_summary(config: &Config, demo: bool) {
    let handlers: Vec<_> = config.handlers.iter().map(|h| h.as_str()).collect();
    println!(
        "config file:    {}",
        config
            .metadata
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".into())
    );
    println!("namespace:      {}", config.namespace.as_deref().unwrap_or("<all>"));
    println!("handlers:       {}", handlers.join(", "));
    println!(
        "cluster API:    {}",
        if demo {
            "<in-memory demo>".to_string()
        } else {
            config
                .kube
                .api_url
                .as_ref()
                .map(|url| url.to_string())
                .unwrap_or_else(|| "<not configured>".into())
        }
    );
    println!("marker type:    {}", config.controller.watch.marker_type);
    println!("max retries:    {}", config.controller.retry.max_retries);
    match config.controller.dispatch.timeout() {
        Some(timeout) => println!("handler timeout {timeout:?}"),
        None => println!("handler timeout none"),
    }
}

async fn run(config: Config, args: &RunArgs) -> anyhow::Result<()> {
    let bundle = wiring::build_source(&config, args.demo)?;
    let handlers = wiring::build_handlers(&config)?;

    if let Some(cluster) = &bundle.demo_cluster {
        demo::seed(cluster).context("failed to seed demo cluster")?;
    }

    let controller = Controller::builder(bundle.source)
        .with_config(config.controller.clone())
        .with_handlers(handlers)
        .build();
    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        started_at = %controller.started_at(),
        "starting kubewise"
    );

    let shutdown = CancellationToken::new();
    if let Some(cluster) = bundle.demo_cluster {
        tokio::spawn(demo::play(cluster, args.demo_interval, shutdown.child_token()));
    }

    let mut task: JoinHandle<kubewise_core::Result<()>> = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run(shutdown).await })
    };

    tokio::select! {
        joined = &mut task => return settle(joined),
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    shutdown.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
        Ok(joined) => settle(joined),
        Err(_) => {
            error!(grace = ?SHUTDOWN_GRACE, "controller did not stop in time");
            task.abort();
            Ok(())
        }
    }
}

fn settle(
    joined: Result<kubewise_core::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    joined
        .context("controller task panicked")?
        .context("controller stopped with an error")?;
    info!("kubewise stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "kubewise",
            "--namespace",
            "team-a",
            "--demo",
            "--demo-interval",
            "250ms",
        ])
        .expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.run.namespace.as_deref(), Some("team-a"));
        assert!(cli.run.demo);
        assert_eq!(cli.run.demo_interval, Duration::from_millis(250));
    }

    #[test]
    fn check_subcommand_is_recognised() {
        let cli = Cli::try_parse_from(["kubewise", "--config", "kw.toml", "check"]).expect("parse");
        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.run.config, Some(PathBuf::from("kw.toml")));
    }
}
