use std::sync::Arc;

use anyhow::{Context, bail};
use kubewise_config::{Config, HandlerKind};
use kubewise_core::{
    BearerToken, KubeApiConfig, KubeApiSource, LogNotifier, MemoryCluster,
    NotificationHandler, SlackConfig, SlackNotifier, WatchSource,
};
use tracing::info;

/// Watch source plus, in demo mode, the in-memory cluster behind it.
pub struct SourceBundle {
    pub source: Arc<dyn WatchSource>,
    pub demo_cluster: Option<MemoryCluster>,
}

pub fn build_source(config: &Config, demo: bool) -> anyhow::Result<SourceBundle> {
    if demo {
        let cluster = MemoryCluster::new();
        let source = cluster.source(config.namespace.as_deref());
        return Ok(SourceBundle {
            source: Arc::new(source),
            demo_cluster: Some(cluster),
        });
    }

    let Some(base_url) = config.kube.api_url.clone() else {
        bail!(
            "no cluster API endpoint configured; set KW_KUBE_API or run inside a cluster \
             (KUBERNETES_SERVICE_HOST), or use --demo"
        );
    };

    let mut api = KubeApiConfig::new(base_url)
        .with_namespace(config.namespace.clone())
        .with_field_selector(format!("type={}", config.controller.watch.marker_type));
    if let Some(path) = &config.kube.token_file {
        api = api.with_token(BearerToken::File(path.clone()));
    }
    if let Some(path) = &config.kube.ca_file {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
        api = api.with_ca_pem(pem);
    }

    info!(
        api = %api.base_url,
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        "watching cluster API"
    );
    let source = KubeApiSource::new(api).context("failed to build cluster API client")?;
    Ok(SourceBundle {
        source: Arc::new(source),
        demo_cluster: None,
    })
}

pub fn build_handlers(config: &Config) -> anyhow::Result<Vec<Arc<dyn NotificationHandler>>> {
    let mut handlers: Vec<Arc<dyn NotificationHandler>> = Vec::new();
    for kind in &config.handlers {
        match kind {
            HandlerKind::Slack => {
                let Some(slack) = &config.slack else {
                    bail!("the slack handler requires KW_SLACK_TOKEN");
                };
                let settings = SlackConfig::new(slack.token.clone(), slack.channel.clone())
                    .context("invalid Slack settings")?;
                info!(channel = %settings.channel, "Slack notifications enabled");
                let notifier =
                    SlackNotifier::new(settings).context("failed to build Slack client")?;
                handlers.push(Arc::new(notifier));
            }
            HandlerKind::Log => handlers.push(Arc::new(LogNotifier::new())),
        }
    }
    Ok(handlers)
}
