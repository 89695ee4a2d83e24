use chrono::Duration;
use photocontest_backend::doc::ApiDoc;
use photocontest_backend::error::{AppError, AppResult};
use photocontest_backend::repo::{ContestStore, InMemoryStore, PgStore};
use photocontest_backend::roles::AccessPolicy;
use photocontest_backend::routes::{app_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

const DEFAULT_FILTER: &str = "debug,sqlx=warn,sqlx::query=off";

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let cfg = Config::from_env();
    let policy = AccessPolicy::new(cfg.admin_user_id);
    if cfg.admin_user_id.is_none() {
        warn!("ADMIN_USER_ID not set, role and subscription management limited to role managers");
    }

    match cfg.database_url.as_deref() {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url).await?);
            serve(store, policy, &cfg).await
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store (data is lost on exit)");
            serve(Arc::new(InMemoryStore::default()), policy, &cfg).await
        }
    }
}

async fn serve<S>(store: Arc<S>, policy: AccessPolicy, cfg: &Config) -> AppResult<()>
where
    S: ContestStore + Send + Sync + 'static,
{
    let state = AppState::new(
        store,
        policy,
        cfg.password_pepper.clone(),
        Duration::hours(cfg.session_ttl_hours),
    );
    let app = app_router(state)
        .merge(SwaggerUi::new("/docs").url("/docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::very_permissive());

    let addr: SocketAddr = cfg
        .bind
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid bind addr {}", cfg.bind)))?;
    info!("Starting photo contest backend on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;
    Ok(())
}

#[derive(Clone, Debug)]
struct Config {
    database_url: Option<String>,
    bind: String,
    admin_user_id: Option<i64>,
    password_pepper: String,
    session_ttl_hours: i64,
}

impl Config {
    fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.is_empty());
        let bind = std::env::var("BIND").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let admin_user_id = std::env::var("ADMIN_USER_ID")
            .ok()
            .and_then(|s| s.parse().ok());
        let password_pepper = std::env::var("PASSWORD_PEPPER").unwrap_or_default();
        let session_ttl_hours = std::env::var("SESSION_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|h: &i64| *h > 0)
            .unwrap_or(168);
        Self {
            database_url,
            bind,
            admin_user_id,
            password_pepper,
            session_ttl_hours,
        }
    }
}
