use axum::{
    Router,
    http::Method,
    routing::get,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod channels;
mod config;
mod database;
mod error;
mod events;
mod handlers;
mod pagination;
mod queue;
mod store;
mod workflows;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};


use channels::{ChannelRegistry, EmailChannel, SmsChannel};
use events::EventBus;
use queue::{EnqueueOptions, JobQueue};
use std::time::Duration;
use store::{PgStore, Store};
use workflows::{ActionExecutor, TriggerMatcher, WorkflowRunner};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(db_pool));
    let bus = EventBus::new();

    let email = Arc::new(EmailChannel::new(&config.smtp));
    let sms = Arc::new(SmsChannel::new(&config.sms));
    let channels = Arc::new(ChannelRegistry::new(
        email,
        sms,
        config.queue.send_concurrency,
    ));

    let enqueue_defaults = EnqueueOptions {
        delay: Duration::ZERO,
        attempts: config.queue.max_attempts,
        backoff: Duration::from_secs(config.queue.backoff_secs),
    };

    // The queue and the runner reference each other (wait continuations go
    // back onto the queue), so wire the queue with a late-bound runner slot.
    let runner_slot: Arc<tokio::sync::OnceCell<Arc<WorkflowRunner>>> =
        Arc::new(tokio::sync::OnceCell::new());

    let queue = {
        let runner_slot = runner_slot.clone();
        Arc::new(JobQueue::start(
            config.queue.clone(),
            Arc::new(move |message| {
                let runner_slot = runner_slot.clone();
                Box::pin(async move {
                    let runner = runner_slot
                        .get()
                        .ok_or_else(|| anyhow::anyhow!("workflow runner not initialized"))?;
                    runner.process(message).await?;
                    Ok(())
                })
            }),
        ))
    };

    let executor = ActionExecutor::new(
        store.clone(),
        channels,
        queue.clone(),
        bus.clone(),
        enqueue_defaults.clone(),
    );
    let runner = Arc::new(WorkflowRunner::new(
        store.clone(),
        queue.clone(),
        bus.clone(),
        executor,
        enqueue_defaults.clone(),
    ));
    runner_slot
        .set(runner)
        .map_err(|_| anyhow::anyhow!("workflow runner initialized twice"))?;

    let matcher = Arc::new(TriggerMatcher::new(
        store.clone(),
        queue,
        bus.clone(),
        enqueue_defaults,
    ));
    matcher.bind(&bus).await;
    TriggerMatcher::verify_coverage(&bus).await?;

    let app_state = Arc::new(AppState {
        store,
        bus: bus.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Cadence CRM API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflows::workflow_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
