use std::{process, sync::Arc};

use ppsc::{
    application::{
        admin::AdminCacheService,
        error::AppError,
        repos::{AntiForgery, GatedResourceCatalog, PreloadFetcher},
    },
    cache::{CacheCoordinator, GateEvaluator},
    config,
    infra::{
        error::InfraError,
        http::{self, AdminState},
        manifest::ResourceManifest,
        preload::HttpPreloadFetcher,
        telemetry,
        tokens::ActionTokens,
        upstream::UpstreamRenderer,
    },
};
use tokio::try_join;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Coverage(args) => run_coverage(settings, args).await,
        config::Command::Clear(args) => run_clear(settings, args).await,
        config::Command::ClearAll => run_clear_all(settings).await,
        config::Command::Preload(_) => run_preload(settings).await,
        config::Command::Log(args) => run_log(settings, args).await,
    }
}

struct ApplicationContext {
    coordinator: Arc<CacheCoordinator>,
    admin: Arc<AdminCacheService>,
    gate: Arc<dyn GateEvaluator>,
}

fn build_application_context(settings: &config::Settings) -> Result<ApplicationContext, AppError> {
    let manifest = Arc::new(
        ResourceManifest::load(&settings.manifest.path)?
            .with_operator_digest(settings.operator.token_digest.clone()),
    );
    let gate: Arc<dyn GateEvaluator> = manifest.clone();
    let catalog: Arc<dyn GatedResourceCatalog> = manifest;

    let coordinator = Arc::new(CacheCoordinator::new(
        settings.cache_config(),
        Arc::clone(&gate),
    ));

    let fetcher: Arc<dyn PreloadFetcher> = Arc::new(HttpPreloadFetcher::new(&settings.preload)?);
    let tokens: Arc<dyn AntiForgery> =
        Arc::new(ActionTokens::new(settings.operator.form_secret.clone()));
    let admin = Arc::new(AdminCacheService::new(
        Arc::clone(coordinator.store()),
        Arc::clone(coordinator.audit()),
        catalog,
        fetcher,
        tokens,
    ));

    Ok(ApplicationContext {
        coordinator,
        admin,
        gate,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    app.coordinator.activate().await;

    let upstream = Arc::new(UpstreamRenderer::new(settings.upstream.origin.clone())?);
    let renderer = http::upstream_router(Arc::clone(&upstream));
    let public_router = http::build_router(app.coordinator, renderer);
    let admin_router = http::build_admin_router(AdminState {
        cache: app.admin,
        gate: app.gate,
    });

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "ppsc::serve",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        upstream = %upstream.origin(),
        cache_directory = %settings.cache.directory.display(),
        "listeners bound"
    );

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    try_join!(public_server, admin_server)
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!(target = "ppsc::serve", "listeners stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            target = "ppsc::serve",
            error = %err,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}

async fn run_coverage(
    settings: config::Settings,
    args: config::OutputArgs,
) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let rows = app.admin.list_coverage().await?;

    if args.json {
        let text = serde_json::to_string_pretty(&rows)
            .map_err(|err| AppError::unexpected(format!("failed to encode coverage: {err}")))?;
        println!("{text}");
        return Ok(());
    }

    println!("{:<12} {:<10} {:<10} {:<7} PATH", "ID", "KIND", "STATUS", "CACHED");
    for row in &rows {
        println!(
            "{:<12} {:<10} {:<10} {:<7} {}",
            row.id.to_string(),
            row.kind,
            row.status,
            if row.cached { "yes" } else { "no" },
            row.path.as_deref().unwrap_or("-"),
        );
    }
    let cached = rows.iter().filter(|row| row.cached).count();
    println!("{cached}/{} gated resources cached", rows.len());
    Ok(())
}

async fn run_clear(settings: config::Settings, args: config::ClearArgs) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let outcome = app.admin.clear_one(args.id).await?;
    info!(
        target = "ppsc::cli::clear",
        id = %args.id,
        outcome = ?outcome,
        "cache entry cleared"
    );
    Ok(())
}

async fn run_clear_all(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let report = app.admin.clear_all().await?;
    info!(
        target = "ppsc::cli::clear_all",
        removed = report.removed,
        failed = report.failed,
        "cache directory purged"
    );
    if report.failed > 0 {
        return Err(AppError::unexpected(format!(
            "{} cache files could not be removed",
            report.failed
        )));
    }
    Ok(())
}

async fn run_preload(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let report = app.admin.preload_all().await?;
    info!(
        target = "ppsc::cli::preload",
        base_url = %settings.preload.public_base_url,
        attempted = report.attempted,
        failed = report.failed,
        "preload finished"
    );
    Ok(())
}

async fn run_log(settings: config::Settings, args: config::LogArgs) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;
    let lines = app.admin.recent_log().await?;
    let limit = args.limit.unwrap_or(lines.len());
    for line in lines.iter().take(limit) {
        println!("{line}");
    }
    Ok(())
}
