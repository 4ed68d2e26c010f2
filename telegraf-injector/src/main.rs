/// Admission webhook adding telegraf sidecars to pods, with secrets kept in sync
/// with the telegraf classes.
use std::{
    convert::Infallible,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use admission::{admission_handler, InjectorContext};
use anyhow::Context;
use class_data::ClassDataHandler;
use clap::Parser;
use config::Config;
use k8s::{KubeApi, KubeClient};
use kube::core::{
    admission::{AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use secrets::SecretManager;
use sidecar::SidecarHandler;
use tracing::{error, info, Level};
use updater::SecretsUpdater;
use warp::Filter;

mod admission;
mod annotations;
mod assemble;
mod class_data;
mod config;
mod error;
mod k8s;
mod quantity;
mod secrets;
mod sidecar;
mod updater;
mod watcher;

#[derive(Parser, Debug, Clone)]
#[command(name = "telegraf-injector")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config_file: Option<PathBuf>,
    /// Directory with the telegraf classes, overrides the configuration file.
    #[arg(long)]
    telegraf_classes_directory: Option<PathBuf>,
    /// The path to the TLS certificate.
    #[arg(long)]
    tls_cert: PathBuf,
    /// The path to the TLS key.
    #[arg(long)]
    tls_key: PathBuf,
    /// The port to listen on.
    #[arg(short, long, default_value = "9443")]
    port: u16,
    /// One of trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn webhook_task(
    tls_cert: &Path,
    tls_key: &Path,
    port: u16,
    context: Arc<InjectorContext>,
) -> impl Future<Output = ()> + 'static {
    let mutate = warp::path("mutate-v1-pod")
        .and(warp::path::end())
        .and(warp::body::json())
        .and_then(move |body: AdmissionReview<DynamicObject>| {
            let context = context.clone();
            async move {
                match admission_handler(body, &context).await {
                    Ok(reply) => Ok::<warp::reply::Json, Infallible>(reply),
                    Err(err) => {
                        error!("Error: {:?}", err);
                        let res = AdmissionResponse::invalid(err.to_string());
                        Ok(warp::reply::json(&res.into_review()))
                    }
                }
            }
        })
        .with(warp::trace::request());

    info!("Starting webhook server on port {}", port);
    let (_addr, fut) = warp::serve(warp::post().and(mutate))
        .tls()
        .cert_path(tls_cert)
        .key_path(tls_key)
        .bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Failed to install CTRL+C signal handler: {}", err);
            }
        });
    fut
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config_file {
        Some(config_file) => {
            Config::from_file(config_file).context("Failed to load configuration file")?
        }
        None => Config::default(),
    };

    if let Some(classes_directory) = &args.telegraf_classes_directory {
        config.classes_directory = classes_directory.clone();
    }

    config.validate_requests_and_limits()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse the CLI arguments
    let args = Args::try_parse()?;

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Parsed CLI arguments: {:?}", args);

    let config = load_config(&args)?;
    info!("Loaded configuration: {:?}", config);

    let classes = ClassDataHandler::new(&config.classes_directory);
    classes.validate_class_data()?;

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let kube: Arc<dyn KubeApi> = Arc::new(KubeClient::new(client));

    let sidecar = Arc::new(SidecarHandler::new(config.clone(), Arc::new(classes)));
    let updater = Arc::new(SecretsUpdater::new(kube.clone(), sidecar.clone()));

    // Keep the watcher alive until the process exits.
    let _watcher = watcher::spawn_watcher(
        &config.classes_directory,
        Duration::from_secs(config.watch_delay_seconds),
        updater,
    )?;

    let context = Arc::new(InjectorContext {
        sidecar,
        secrets: SecretManager::new(kube, config.require_annotations_for_secret),
    });

    // Run the server on an async task
    tokio::spawn(async move {
        webhook_task(&args.tls_cert, &args.tls_key, args.port, context).await
    });

    let ctrl_c = tokio::signal::ctrl_c();
    ctrl_c.await?;

    info!("Exiting admission server");

    Ok(())
}
