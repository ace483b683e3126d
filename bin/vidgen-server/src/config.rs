//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for vidgen-server.
///
/// Every field has a default so the server starts without any environment
/// variables set (open session, local media storage, SQLite file ledger).
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// sqlx SQLite URL of the task ledger (default: `"sqlite://vidgen.db"`).
    pub database_url: String,

    /// Path of the TOML generation config (groups, models, relocation).
    pub generation_config_path: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Token exchanged for a session on `POST /v1/session`. When unset every
    /// request runs under an anonymous, never-expiring session.
    pub api_token: Option<String>,

    /// Lifetime of a session created from `api_token`.
    pub session_ttl_secs: u64,

    /// Directory for relocated media when no hosted storage is configured.
    pub storage_dir: String,

    /// Externally reachable base URL of this server; local media is served
    /// under `{public_base_url}/media`.
    pub public_base_url: String,

    /// Hosted object storage API. Takes precedence over `storage_dir`.
    pub storage_url: Option<String>,
    pub storage_key: Option<String>,
    pub storage_bucket: String,

    /// Serve Swagger UI at `/swagger-ui`.
    pub enable_swagger: bool,

    /// Comma-separated allowed CORS origins; wildcard when unset.
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let bind_address = env_or("VIDGEN_BIND", "0.0.0.0:3000");
        let default_public = format!("http://{}", bind_address.replace("0.0.0.0", "127.0.0.1"));
        Self {
            database_url: env_or("VIDGEN_DATABASE_URL", "sqlite://vidgen.db"),
            generation_config_path: env_or("VIDGEN_CONFIG", "vidgen.toml"),
            log_level: env_or("VIDGEN_LOG", "info"),
            log_json: parse_bool("VIDGEN_LOG_JSON", false),
            api_token: env_opt("VIDGEN_API_TOKEN"),
            session_ttl_secs: parse_env("VIDGEN_SESSION_TTL_SECS", 12 * 60 * 60),
            storage_dir: env_or("VIDGEN_STORAGE_DIR", "media"),
            public_base_url: env_or("VIDGEN_PUBLIC_BASE_URL", &default_public),
            storage_url: env_opt("VIDGEN_STORAGE_URL"),
            storage_key: env_opt("VIDGEN_STORAGE_KEY"),
            storage_bucket: env_or("VIDGEN_STORAGE_BUCKET", "generated"),
            enable_swagger: parse_bool("VIDGEN_ENABLE_SWAGGER", true),
            cors_allowed_origins: env_opt("VIDGEN_CORS_ORIGINS"),
            bind_address,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
