use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use clap::Parser;
use serde_json::json;
use tower_http::trace::TraceLayer;

use pagewatch::app::dispatcher::{DispatchOutcome, Job, JobDispatcher};
use pagewatch::app::runner::CheckError;
use pagewatch::model::{NewPage, PageId, PageUpdate};
use pagewatch::store::{Store, StoreError};
use pagewatch::watch::Runtime;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// YAML config file (PAGEWATCH_* environment variables override it).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn JobDispatcher>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    pagewatch::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting pagewatch-app");

    let config =
        pagewatch::config::Config::load(args.config.as_deref()).context("load config")?;
    let runtime = Runtime::from_config(&config).await?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let scheduler = Arc::clone(&runtime.scheduler);
    let scheduler_task = tokio::spawn(async move {
        scheduler
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
    });

    let state = AppState {
        store: runtime.store,
        dispatcher: runtime.dispatcher,
    };
    let app = Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/pages", get(list_pages).post(create_page))
        .route(
            "/pages/:id",
            get(get_page).put(update_page).delete(delete_page),
        )
        .route("/pages/:id/check", post(check_page))
        .route("/pages/:id/changes", get(list_changes))
        .route("/pages/:id/files", get(list_files))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(pagewatch::watch::shutdown_signal())
        .await?;

    let _ = stop_tx.send(());
    if let Err(err) = scheduler_task.await {
        tracing::error!(?err, "scheduler task panicked");
    }
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::PageNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::DuplicateUrl(_) | StoreError::DuplicateFile { .. } => StatusCode::CONFLICT,
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(?err, "store request failed");
        }
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl From<CheckError> for ApiError {
    fn from(err: CheckError) -> Self {
        match err {
            CheckError::PageNotFound(page_id) => StoreError::PageNotFound(page_id).into(),
            err @ CheckError::InProgress(_) => ApiError {
                status: StatusCode::CONFLICT,
                message: err.to_string(),
            },
            CheckError::Failed(err) => internal(err),
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(?err, "request failed");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("{err:#}"),
    }
}

async fn list_pages(State(state): State<AppState>) -> Result<Response, ApiError> {
    let pages = state.store.list_pages().await?;
    Ok(Json(pages).into_response())
}

async fn create_page(
    State(state): State<AppState>,
    Json(page): Json<NewPage>,
) -> Result<Response, ApiError> {
    let page = state.store.create_page(page).await?;
    tracing::info!(page_id = page.id, url = %page.url, "page registered");
    Ok((StatusCode::CREATED, Json(page)).into_response())
}

async fn get_page(
    State(state): State<AppState>,
    Path(page_id): Path<PageId>,
) -> Result<Response, ApiError> {
    let page = state
        .store
        .get_page(page_id)
        .await?
        .ok_or(StoreError::PageNotFound(page_id))?;
    Ok(Json(page).into_response())
}

async fn update_page(
    State(state): State<AppState>,
    Path(page_id): Path<PageId>,
    Json(update): Json<PageUpdate>,
) -> Result<Response, ApiError> {
    let page = state.store.update_page(page_id, update).await?;
    Ok(Json(page).into_response())
}

async fn delete_page(
    State(state): State<AppState>,
    Path(page_id): Path<PageId>,
) -> Result<Response, ApiError> {
    let page = state.store.delete_page(page_id).await?;
    tracing::info!(page_id = page.id, url = %page.url, "page removed");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Queues a check now. Only one check per page runs at a time.
async fn check_page(
    State(state): State<AppState>,
    Path(page_id): Path<PageId>,
) -> Result<Response, ApiError> {
    if state.store.get_page(page_id).await?.is_none() {
        return Err(CheckError::PageNotFound(page_id).into());
    }
    let outcome = state
        .dispatcher
        .dispatch(Job::CheckPage { page_id })
        .await
        .map_err(internal)?;
    let status = match outcome {
        DispatchOutcome::Queued => StatusCode::ACCEPTED,
        DispatchOutcome::AlreadyInFlight => StatusCode::CONFLICT,
    };
    Ok((status, Json(json!({ "page_id": page_id, "dispatch": outcome }))).into_response())
}

async fn list_changes(
    State(state): State<AppState>,
    Path(page_id): Path<PageId>,
) -> Result<Response, ApiError> {
    let changes = state.store.list_changes(page_id).await?;
    Ok(Json(changes).into_response())
}

async fn list_files(
    State(state): State<AppState>,
    Path(page_id): Path<PageId>,
) -> Result<Response, ApiError> {
    let files = state.store.list_files(page_id).await?;
    Ok(Json(files).into_response())
}
