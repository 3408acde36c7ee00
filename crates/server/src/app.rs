use std::{sync::Arc, time::Duration, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    access::AccessGate,
    api,
    auth::jwt::JwtIdentityService,
    config::ServerConfig,
    cors::cors_layer,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    documents::DocumentStore,
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    metrics::{self, SyncMetrics},
    presence::PresenceSet,
    relay::{RelayBus, RelayListener},
    ws::{self, announce_presence, registry::ConnectionRegistry},
};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Everything a room connection needs, shared by every handler on one
/// instance.
#[derive(Clone)]
pub struct RoomServices {
    pub instance_id: Uuid,
    pub identity: Arc<JwtIdentityService>,
    pub access: AccessGate,
    pub documents: DocumentStore,
    pub presence: PresenceSet,
    pub relay: RelayBus,
    pub registry: Arc<ConnectionRegistry>,
    /// Largest edit accepted from a client.
    pub max_frame_bytes: usize,
}

impl RoomServices {
    /// Single-process services with in-memory backends.
    pub fn in_memory(identity: Arc<JwtIdentityService>, instance_id: Uuid) -> Self {
        Self {
            instance_id,
            identity,
            access: AccessGate::memory(),
            documents: DocumentStore::memory(),
            presence: PresenceSet::memory(instance_id),
            relay: RelayBus::memory(),
            registry: Arc::new(ConnectionRegistry::default()),
            max_frame_bytes: 1024 * 1024,
        }
    }

    /// Services backed by PostgreSQL: pool, migrations and a health check.
    pub async fn connect_postgres(
        database_url: &str,
        pool_config: PoolConfig,
        identity: Arc<JwtIdentityService>,
        instance_id: Uuid,
    ) -> anyhow::Result<Self> {
        let pool = create_pg_pool(database_url, pool_config)
            .await
            .context("failed to initialize syncroom PostgreSQL pool")?;
        check_pool_health(&pool).await?;
        run_migrations(&pool).await?;

        Ok(Self {
            instance_id,
            identity,
            access: AccessGate::Postgres(pool.clone()),
            documents: DocumentStore::Postgres(pool.clone()),
            presence: PresenceSet::postgres(pool.clone(), instance_id),
            relay: RelayBus::Postgres(pool),
            registry: Arc::new(ConnectionRegistry::default()),
            max_frame_bytes: 1024 * 1024,
        })
    }

    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let identity = Arc::new(
            JwtIdentityService::new(&config.jwt_secret).context("invalid SYNCROOM_JWT_SECRET")?,
        );

        let mut services = match &config.database_url {
            Some(database_url) => {
                Self::connect_postgres(
                    database_url,
                    PoolConfig::from_env(),
                    identity,
                    config.instance_id,
                )
                .await?
            }
            None => {
                warn!("SYNCROOM_DATABASE_URL is not set; using in-memory backends (single instance only)");
                Self::in_memory(identity, config.instance_id)
            }
        };
        services.max_frame_bytes = config.max_frame_bytes;
        Ok(services)
    }

    /// Another instance attached to the same shared backends: same store,
    /// presence data and relay, but its own connections.
    pub fn peer(&self, instance_id: Uuid) -> Self {
        Self {
            instance_id,
            identity: self.identity.clone(),
            access: self.access.clone(),
            documents: self.documents.clone(),
            presence: self.presence.for_instance(instance_id),
            relay: self.relay.clone(),
            registry: Arc::new(ConnectionRegistry::default()),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    /// Delete every presence row this instance holds and re-announce the
    /// member list of each room that lost rows. Returns the rooms touched.
    pub async fn purge_own_presence(&self) -> anyhow::Result<Vec<String>> {
        let rooms = self.presence.purge_instance().await?;
        for room_id in &rooms {
            announce_presence(self, room_id).await;
        }
        Ok(rooms)
    }

    /// Close every live connection, give them `grace` to run their departure
    /// path, then purge whatever presence this instance still holds.
    pub async fn shutdown(&self, grace: Duration) -> anyhow::Result<Vec<String>> {
        self.registry.begin_shutdown();
        let remaining = self.registry.drain(grace).await;
        if remaining > 0 {
            warn!(remaining, "connections still open after shutdown grace period");
        }
        self.purge_own_presence().await
    }

    pub fn relay_listener(&self, retry_delay: Duration) -> RelayListener {
        RelayListener::new(
            self.relay.clone(),
            self.registry.clone(),
            self.documents.clone(),
            self.instance_id,
            retry_delay,
        )
    }
}

/// Register process-wide metrics. Later calls keep the first registry.
pub fn install_metrics() {
    metrics::set_global_metrics(Arc::new(SyncMetrics::default()));
}

pub fn build_router(services: RoomServices, cors_origins: &str) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics))
            .merge(ws::router(services.clone()))
            .merge(api::router(services))
            .layer(cors_layer(cors_origins)),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics() -> Response {
    let body = match metrics::global_metrics() {
        Some(metrics) => metrics.render_prometheus(),
        None => SyncMetrics::default().render_prometheus(),
    };
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
