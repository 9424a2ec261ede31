//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time.

use axum::http::HeaderValue;
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Authentication provider mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProvider {
    /// Debug mode: accepts X-Debug-User header (DO NOT USE IN PRODUCTION)
    None,
    /// Ask the Supabase auth server who the bearer token belongs to
    Supabase,
    /// Verify Supabase access tokens locally with the project JWT secret
    Jwt,
}

impl AuthProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("none") {
            Self::None
        } else if s.eq_ignore_ascii_case("jwt") {
            Self::Jwt
        } else {
            Self::Supabase
        }
    }
}

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on restart)
    Memory,
    /// SQLite file-based storage
    Sqlite,
    /// Supabase PostgREST table, queried as the calling user
    Postgrest,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("sqlite") {
            Self::Sqlite
        } else if s.eq_ignore_ascii_case("memory") {
            Self::Memory
        } else {
            Self::Postgrest
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 3001)
    pub port: u16,
    /// Authentication provider
    pub auth_provider: AuthProvider,
    /// Supabase project URL (auth server and REST root)
    pub supabase_url: Option<String>,
    /// Supabase anon key sent as `apikey`
    pub supabase_anon_key: Option<String>,
    /// HS256 secret for `AUTH_PROVIDER=jwt`
    pub supabase_jwt_secret: Option<String>,
    /// Whether to skip JWT signature verification (dev only)
    pub insecure_skip_signature: bool,
    /// CORS allow origin
    pub cors_allow_origin: HeaderValue,
    /// Storage provider
    pub storage_provider: StorageProvider,
    /// SQLite database path (when using sqlite storage)
    pub db_path: PathBuf,
    /// Remote table holding replacement rows
    pub replacements_table: String,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset
        let var = |name: &str| get(name).filter(|s| !s.trim().is_empty());

        // Port
        let port = match var("PORT") {
            Some(s) => s.trim().parse().map_err(|_| ConfigError {
                field: "PORT",
                message: format!("Invalid port '{}'", s),
            })?,
            None => 3001,
        };

        // Auth provider
        let auth_provider =
            AuthProvider::from_str(&var("AUTH_PROVIDER").unwrap_or_else(|| "supabase".into()));

        // Storage provider
        let storage_provider = StorageProvider::from_str(
            &var("STORAGE_PROVIDER").unwrap_or_else(|| "postgrest".into()),
        );

        let supabase_url = var("SUPABASE_URL");
        let supabase_anon_key = var("SUPABASE_ANON_KEY");

        // Validate: the auth server and the REST store both need the project URL and key
        let needs_project = auth_provider == AuthProvider::Supabase
            || storage_provider == StorageProvider::Postgrest;
        if needs_project {
            let why = if auth_provider == AuthProvider::Supabase {
                "Required when AUTH_PROVIDER=supabase"
            } else {
                "Required when STORAGE_PROVIDER=postgrest"
            };
            if supabase_url.is_none() {
                return Err(ConfigError {
                    field: "SUPABASE_URL",
                    message: why.into(),
                });
            }
            if supabase_anon_key.is_none() {
                return Err(ConfigError {
                    field: "SUPABASE_ANON_KEY",
                    message: why.into(),
                });
            }
        }
        if let Some(url) = &supabase_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError {
                    field: "SUPABASE_URL",
                    message: format!("Expected an http(s) URL, got '{}'", url),
                });
            }
        }

        // Insecure skip signature
        let skip_sig = var("SUPABASE_AUTH_INSECURE_SKIP_SIGNATURE").unwrap_or_default();
        let insecure_skip_signature =
            matches!(skip_sig.to_lowercase().as_str(), "1" | "true" | "yes");

        let supabase_jwt_secret = var("SUPABASE_JWT_SECRET");
        if auth_provider == AuthProvider::Jwt
            && supabase_jwt_secret.is_none()
            && !insecure_skip_signature
        {
            return Err(ConfigError {
                field: "SUPABASE_JWT_SECRET",
                message: "Required when AUTH_PROVIDER=jwt".into(),
            });
        }

        // CORS allow origin
        let cors_origin_str = var("CORS_ALLOW_ORIGIN").unwrap_or_else(|| "*".into());
        let cors_allow_origin = if cors_origin_str == "*" {
            HeaderValue::from_static("*")
        } else {
            HeaderValue::from_str(&cors_origin_str).map_err(|e| ConfigError {
                field: "CORS_ALLOW_ORIGIN",
                message: format!("Invalid header value '{}': {}", cors_origin_str, e),
            })?
        };

        // DB path (for sqlite)
        let db_path = PathBuf::from(var("DB_PATH").unwrap_or_else(|| "./data/replacements.db".into()));

        let replacements_table = var("REPLACEMENTS_TABLE")
            .unwrap_or_else(|| postgrest_adapter::DEFAULT_TABLE.into());

        // Log format
        let log_format = LogFormat::from_str(&var("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            port,
            auth_provider,
            supabase_url,
            supabase_anon_key,
            supabase_jwt_secret,
            insecure_skip_signature,
            cors_allow_origin,
            storage_provider,
            db_path,
            replacements_table,
            log_format,
        })
    }

    /// Log warnings about insecure configuration.
    pub fn warn_if_insecure(&self) {
        if self.auth_provider == AuthProvider::None {
            tracing::warn!(
                "AUTH_PROVIDER=none: Using debug authentication via X-Debug-User header. \
                 DO NOT USE IN PRODUCTION."
            );
            if self.storage_provider == StorageProvider::Postgrest {
                tracing::warn!(
                    "AUTH_PROVIDER=none with STORAGE_PROVIDER=postgrest: the debug user id is \
                     forwarded as the bearer token and will be rejected by row-level security."
                );
            }
        }
        if self.auth_provider == AuthProvider::Jwt && self.insecure_skip_signature {
            tracing::warn!(
                "SUPABASE_AUTH_INSECURE_SKIP_SIGNATURE is set: access token signature \
                 verification is DISABLED. DO NOT USE IN PRODUCTION."
            );
        }
        if self.storage_provider == StorageProvider::Memory {
            tracing::warn!("STORAGE_PROVIDER=memory: replacements are lost on restart.");
        }
    }
}
