use std::{future::IntoFuture, process, time::Instant};

use rasterd::{
    application::{error::AppError, render::RenderService},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        shutdown::shutdown_signal,
        telemetry,
    },
    pool::WorkerPool,
};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
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
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let pool = WorkerPool::new(settings.pool.pool_config())?;
    pool.initialize()?;

    let service = RenderService::new(pool.clone(), &settings.render);
    let state = HttpState::new(service, settings.render.max_document_bytes);

    let result = serve_http(&settings, state).await;

    pool.shutdown(settings.pool.shutdown_grace).await;
    info!(target = "rasterd::serve", "Shutdown complete");
    result
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "rasterd::serve",
        addr = %settings.server.addr,
        "Listening"
    );

    let stop = CancellationToken::new();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(stop.clone().cancelled_owned())
        .into_future();
    tokio::pin!(server);

    let outcome = tokio::select! {
        outcome = &mut server => outcome,
        () = shutdown_signal() => {
            stop.cancel();
            let grace = settings.server.graceful_shutdown;
            match tokio::time::timeout(grace, &mut server).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        target = "rasterd::serve",
                        grace_ms = grace.as_millis() as u64,
                        "In-flight requests outlived the graceful shutdown window"
                    );
                    Ok(())
                }
            }
        }
    };

    outcome.map_err(|err| AppError::from(InfraError::server(err.to_string())))
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let started = Instant::now();
    let document = tokio::fs::read(&args.file)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let pool = WorkerPool::new(settings.pool.one_off_pool_config())?;
    pool.initialize()?;
    let service = RenderService::new(pool.clone(), &settings.render);

    let result = async {
        let request = service.request(document.into(), args.page, args.dpi)?;
        let image = service.render(request).await?;
        tokio::fs::write(&args.output, &image.jpeg)
            .await
            .map_err(InfraError::from)?;
        Ok::<_, AppError>(image)
    }
    .await;

    pool.shutdown(settings.pool.shutdown_grace).await;
    let image = result?;

    info!(
        target = "rasterd::render",
        file = %args.file.display(),
        output = %args.output.display(),
        page = image.page.get(),
        page_count = image.page_count,
        width = image.width,
        height = image.height,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Page written"
    );
    Ok(())
}
