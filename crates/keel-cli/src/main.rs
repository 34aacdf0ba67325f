//! keel - inspect cluster capabilities and migration plans

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::{Client, Config};
use serde::Serialize;

use keel_common::kube_utils::parse_api_version;
use keel_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use keel_common::ReconcilerConfig;
use keel_migrate::{planned_jobs, PersistenceSpec, SchemaJobFactory, SchemaScriptsBuilder};
use keel_reconcile::{ClusterClient, DiscoveryCache, KubeClusterClient, TypedBuilder};

/// keel - declarative reconciliation and schema migration tooling
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    /// Kubeconfig to use instead of the default resolution
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    #[command(flatten)]
    reconciler: ReconcilerConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report whether the cluster serves the given kinds
    Discover {
        /// Group/version, e.g. "v1" or "cert-manager.io/v1"
        api_version: String,
        /// Kinds to look up
        #[arg(required = true)]
        kinds: Vec<String>,
    },
    /// Print the schema scripts ConfigMap, job plan and Jobs for a
    /// persistence spec, without contacting the cluster
    RenderScripts(RenderArgs),
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Owner name the resources are derived from
    #[arg(long)]
    owner: String,
    /// Owner namespace
    #[arg(long, default_value = "default")]
    namespace: String,
    /// YAML file holding the persistence spec
    #[arg(long)]
    file: PathBuf,
    /// Image the migration Jobs run
    #[arg(long, env = "KEEL_ADMIN_TOOLS_IMAGE", default_value = "keel/admin-tools:latest")]
    image: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlannedJob {
    name: String,
    store: String,
    command: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Rendered {
    config_map: ConfigMap,
    plan: Vec<PlannedJob>,
    jobs: Vec<Job>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        default_filter: Some("warn".to_string()),
    })?;

    match cli.command {
        Commands::Discover { api_version, kinds } => {
            let client = kube_client(cli.kubeconfig.as_deref()).await?;
            discover(client, &cli.reconciler, &api_version, &kinds).await
        }
        Commands::RenderScripts(args) => render_scripts(&args),
    }
}

async fn kube_client(kubeconfig: Option<&std::path::Path>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        None => Config::infer().await.context("failed to infer kube config")?,
    };
    Client::try_from(config).context("failed to create kube client")
}

async fn discover(
    client: Client,
    config: &ReconcilerConfig,
    api_version: &str,
    kinds: &[String],
) -> anyhow::Result<()> {
    let client: Arc<dyn ClusterClient> =
        Arc::new(KubeClusterClient::new(client, config.field_manager.clone()));
    let cache = DiscoveryCache::new(client);
    let (group, version) = parse_api_version(api_version);

    for kind in kinds {
        let gvk = GroupVersionKind::gvk(&group, &version, kind);
        let verdict = match cache.resolve(&gvk).await? {
            Some(resource) => format!("supported ({})", resource.plural),
            None => "unsupported".to_string(),
        };
        println!("{api_version} {kind}: {verdict}");
    }
    Ok(())
}

fn render_scripts(args: &RenderArgs) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let spec: PersistenceSpec = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", args.file.display()))?;
    spec.validate()?;

    let namespace = Some(args.namespace.clone());
    let scripts = SchemaScriptsBuilder::for_spec(&args.owner, namespace.clone(), &spec)?;
    let mut config_map = scripts.build()?;
    scripts.update(&mut config_map)?;

    let plan = planned_jobs(&spec)
        .into_iter()
        .map(|p| PlannedJob {
            command: p.command(),
            store: p.role.slug().to_string(),
            name: p.name,
        })
        .collect();
    let jobs = SchemaJobFactory::new(args.image.clone(), scripts.name())
        .jobs_for_spec(&args.owner, namespace, &spec)?;

    let rendered = Rendered {
        config_map,
        plan,
        jobs,
    };
    print!("{}", serde_yaml::to_string(&rendered)?);
    Ok(())
}
