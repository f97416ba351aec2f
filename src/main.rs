//! Certgate operator - ACME HTTP-01 certificate renewal for ingresses

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResourceExt};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use certgate::challenge::{ChallengeObserver, ObserveStrategy};
use certgate::config::{
    RunMode, Settings, DEFAULT_ANNOTATION_REMOVAL_DELAY_SECS, DEFAULT_RENEWAL_CHECK_INTERVAL_MINS,
    DEFAULT_RENEWAL_THRESHOLD_DAYS,
};
use certgate::crd::RenewalPolicy;
use certgate::dispatcher::EventDispatcher;
use certgate::lock::LockTable;
use certgate::metrics::{self, Metrics};
use certgate::renewal::Renewer;
use certgate::scanner::AuditScanner;
use certgate::secrets::SecretRotator;
use certgate::store::{KubeStore, ObjectStore};
use certgate::FIELD_MANAGER;

/// Certgate - Kubernetes operator for ACME HTTP-01 certificate renewal
#[derive(Parser, Debug)]
#[command(name = "certgate", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Deployment mode (dev or prod)
    #[arg(long, env = "RUN_MODE", default_value = "prod")]
    run_mode: RunMode,

    /// Renew certificates with fewer than this many days of validity left
    #[arg(
        long,
        env = "CERTIFICATE_RENEWAL_THRESHOLD",
        default_value_t = DEFAULT_RENEWAL_THRESHOLD_DAYS
    )]
    certificate_renewal_threshold: u32,

    /// Seconds to wait for a challenge to clear before giving up
    #[arg(
        long,
        env = "ANNOTATION_REMOVAL_DELAY",
        default_value_t = DEFAULT_ANNOTATION_REMOVAL_DELAY_SECS
    )]
    annotation_removal_delay: u32,

    /// Allow deleting expiring TLS secrets to force reissuance
    #[arg(long, env = "ADMIN_USER_PERMISSION")]
    admin_user_permission: bool,

    /// Minutes between audit passes
    #[arg(
        long,
        env = "RENEWAL_CHECK_INTERVAL",
        default_value_t = DEFAULT_RENEWAL_CHECK_INTERVAL_MINS
    )]
    renewal_check_interval: u32,

    /// Observe challenges via a watch stream instead of polling
    #[arg(long, env = "CHALLENGE_WATCH")]
    challenge_watch: bool,

    /// Address for the /metrics endpoint
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS \
             implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let default_filter = match cli.run_mode {
        RunMode::Dev => "certgate=debug,info",
        RunMode::Prod => "certgate=info,warn",
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    if cli.crd {
        let crd = serde_yaml::to_string(&RenewalPolicy::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let settings = Settings {
        run_mode: cli.run_mode,
        certificate_renewal_threshold: cli.certificate_renewal_threshold,
        annotation_removal_delay: cli.annotation_removal_delay,
        admin_user_permission: cli.admin_user_permission,
        renewal_check_interval: cli.renewal_check_interval,
        challenge_watch: cli.challenge_watch,
    };
    settings.validate()?;
    info!(
        run_mode = %settings.run_mode,
        threshold_days = settings.certificate_renewal_threshold,
        delay_secs = settings.annotation_removal_delay,
        interval_mins = settings.renewal_check_interval,
        admin = settings.admin_user_permission,
        "Starting certgate operator"
    );

    let client = Client::try_default().await?;
    ensure_crds_installed(&client).await?;

    let registry = Registry::new();
    let operator_metrics = Metrics::new(&registry)?;

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client));
    let locks = Arc::new(LockTable::new());
    let strategy = if settings.challenge_watch {
        ObserveStrategy::Watch
    } else {
        ObserveStrategy::Poll
    };
    let observer = ChallengeObserver::new(Arc::clone(&store), strategy);
    let renewer = Renewer::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        observer,
        operator_metrics,
    );
    let rotator = SecretRotator::new(Arc::clone(&store), locks);
    let scanner = Arc::new(AuditScanner::new(
        Arc::clone(&store),
        renewer,
        rotator,
        settings,
    ));
    let dispatcher = EventDispatcher::new(Arc::clone(&store), Arc::clone(&scanner));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        });
    }

    // Bind up front so a bad address fails startup, not shutdown
    let metrics_listener = tokio::net::TcpListener::bind(cli.metrics_bind_address)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to bind metrics endpoint {}: {}",
                cli.metrics_bind_address,
                e
            )
        })?;
    info!(addr = %cli.metrics_bind_address, "Metrics server listening");

    let (_, _, served) = tokio::join!(
        scanner.run(shutdown.clone()),
        dispatcher.run(shutdown.clone()),
        serve_metrics(registry, metrics_listener, shutdown.clone()),
    );
    served?;

    info!("Certgate operator stopped");
    Ok(())
}

/// Ensure the RenewalPolicy CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing RenewalPolicy CRD...");
    crds.patch(
        "renewalpolicies.certgate.dev",
        &params,
        &Patch::Apply(&RenewalPolicy::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install RenewalPolicy CRD: {}", e))?;

    Ok(())
}

/// Serve Prometheus metrics on an already-bound listener until shutdown
async fn serve_metrics(
    registry: Registry,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let registry = registry.clone();
            async move {
                match metrics::render(&registry) {
                    Ok(body) => (StatusCode::OK, body),
                    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
        }),
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
