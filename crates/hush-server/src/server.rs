use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clock::{Clock, SystemClock},
    handlers::{burn_secret, create_secret, get_secret, health, issue_token, unmatched},
    store::{secrets::DEFAULT_IDEMPOTENCY_WINDOW_SECS, Backend, MemoryBackend, RedbBackend, SecretStore},
    token::{DifficultyPolicy, SigningKey, TokenIssuer, DEFAULT_TOKEN_TTL_SECS, SIGNING_KEY_LEN},
    AppState,
};

/// Requests above this are rejected before any handler runs.
pub const MAX_BODY_BYTES: usize = 128 * 1024;

const KEY_FILE: &str = "hush.key";
const DB_FILE: &str = "hush.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Disk,
    Memory,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disk" | "redb" => Ok(StorageKind::Disk),
            "memory" | "mem" => Ok(StorageKind::Memory),
            other => anyhow::bail!("unknown storage kind {other:?} (expected disk or memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub storage: StorageKind,
    pub sweep_interval: Duration,
    /// Comma-separated allowed origins; any origin when unset.
    pub cors_origins: Option<String>,
    /// Signing secret for capability tokens ($HUSH_TOKEN_SECRET).
    /// Falls back to a key persisted in the data directory.
    pub token_secret: Option<String>,
    pub token_ttl_secs: i64,
    pub pow: DifficultyPolicy,
    pub idempotency_window_secs: i64,
    /// Reject a second create with an already spent token nonce.
    pub single_use_tokens: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: None,
            storage: StorageKind::Disk,
            sweep_interval: Duration::from_secs(300),
            cors_origins: None,
            token_secret: None,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            pow: DifficultyPolicy::default(),
            idempotency_window_secs: DEFAULT_IDEMPOTENCY_WINDOW_SECS,
            single_use_tokens: true,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `HUSH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(host) = std::env::var("HUSH_HOST") {
            cfg.host = host;
        }
        if let Some(port) = env_parse("HUSH_PORT")? {
            cfg.port = port;
        }
        cfg.data_dir = std::env::var("HUSH_DATA_DIR").ok().map(PathBuf::from);
        if let Ok(kind) = std::env::var("HUSH_STORAGE") {
            cfg.storage = kind.parse()?;
        }
        if let Some(secs) = env_parse("HUSH_SWEEP_INTERVAL_SECS")? {
            cfg.sweep_interval = Duration::from_secs(secs);
        }
        cfg.cors_origins = std::env::var("HUSH_CORS_ORIGINS").ok();
        cfg.token_secret = std::env::var("HUSH_TOKEN_SECRET").ok().filter(|s| !s.is_empty());
        if let Some(secs) = env_parse("HUSH_TOKEN_TTL_SECS")? {
            cfg.token_ttl_secs = secs;
        }
        if let Some(bits) = env_parse("HUSH_POW_BASE")? {
            cfg.pow.base = bits;
        }
        if let Some(bits) = env_parse("HUSH_POW_MAX")? {
            cfg.pow.max = bits;
        }
        if let Some(n) = env_parse("HUSH_POW_STEP_EVERY")? {
            cfg.pow.step_every = n;
        }
        if let Some(secs) = env_parse("HUSH_POW_WINDOW_SECS")? {
            cfg.pow.window_secs = secs;
        }
        if let Some(secs) = env_parse("HUSH_IDEMPOTENCY_WINDOW_SECS")? {
            cfg.idempotency_window_secs = secs;
        }
        if let Ok(v) = std::env::var("HUSH_SINGLE_USE_TOKENS") {
            cfg.single_use_tokens = v != "false" && v != "0";
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.pow.max < self.pow.base {
            anyhow::bail!("HUSH_POW_MAX ({}) is below HUSH_POW_BASE ({})", self.pow.max, self.pow.base);
        }
        if self.pow.max > 32 {
            anyhow::bail!("proof-of-work difficulty above 32 bits is not solvable in a browser");
        }
        if self.token_ttl_secs <= 0 {
            anyhow::bail!("HUSH_TOKEN_TTL_SECS must be positive");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("HUSH_SWEEP_INTERVAL_SECS must be positive");
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}

/// The configured data directory (`HUSH_DATA_DIR` via [`ServerConfig::from_env`]),
/// or the platform default when unset.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// All routes, with the body limit applied. CORS and tracing are added by [`run`].
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/token", post(issue_token))
        .route("/api/secrets", post(create_secret))
        .route("/api/secrets/{id}", get(get_secret))
        .route("/api/secrets/{id}/burn", post(burn_secret))
        .fallback(unmatched)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (backend, signing_key): (Arc<dyn Backend>, SigningKey) = match cfg.storage {
        StorageKind::Disk => {
            let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
            info!(data_dir = %data_dir.display(), "using data directory");
            let key = match cfg.token_secret.as_deref() {
                Some(secret) => SigningKey::from_secret(secret),
                None => load_or_create_key(&data_dir)?,
            };
            let backend = RedbBackend::open(&data_dir.join(DB_FILE)).context("open store")?;
            (Arc::new(backend), key)
        }
        StorageKind::Memory => {
            warn!("using in-memory storage; secrets will not survive a restart");
            let key = match cfg.token_secret.as_deref() {
                Some(secret) => SigningKey::from_secret(secret),
                None => SigningKey::generate(),
            };
            (Arc::new(MemoryBackend::new()), key)
        }
    };

    let store = SecretStore::new(backend, clock.clone())
        .with_idempotency_window(cfg.idempotency_window_secs);
    store.clone().spawn_sweep(cfg.sweep_interval);

    let issuer = TokenIssuer::new(signing_key, cfg.pow, clock).with_ttl(cfg.token_ttl_secs);
    info!(
        base = cfg.pow.base,
        max = cfg.pow.max,
        single_use_tokens = cfg.single_use_tokens,
        "proof-of-work gate configured"
    );

    let state = AppState {
        store,
        issuer,
        single_use_tokens: cfg.single_use_tokens,
    };

    let app = router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "hush server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn load_or_create_key(data_dir: &Path) -> Result<SigningKey> {
    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read hush.key")?;
        SigningKey::from_bytes(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "hush.key is corrupt (expected {SIGNING_KEY_LEN} bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = SigningKey::generate();
        std::fs::write(&key_path, key.as_bytes()).context("write hush.key")?;
        info!("generated new token signing key");
        Ok(key)
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
