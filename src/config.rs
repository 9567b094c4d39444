use std::path::PathBuf;

/// Runtime configuration, read once from the environment at process start.
#[derive(Debug, Clone)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub chroma: ChromaConfig,
    pub embedding: EmbeddingConfig,
    /// Root directory under which worker clones live. Each repository gets
    /// a subdirectory named by its state id.
    pub local_storage_path: PathBuf,
    /// Batch size for vector upserts.
    pub vector_store_batch_size: usize,
    /// Override for the listen port; role defaults apply when unset.
    pub port: Option<u16>,
    pub memory_monitoring: bool,
    /// RSS warning threshold in megabytes.
    pub memory_warn_mb: u64,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl PostgresConfig {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChromaConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub collection_name: String,
}

impl ChromaConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_key: Option<String>,
    pub organization_id: Option<String>,
    pub project_id: Option<String>,
    pub model: String,
    /// Per-input token cap; inputs are truncated at roughly 4 chars/token.
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub poll_interval_ms: u64,
    /// Completed jobs older than this are pruned.
    pub completed_retention_secs: i64,
    /// Completed jobs beyond the most recent N are pruned.
    pub completed_retention_count: i64,
    /// Failed jobs older than this are pruned.
    pub failed_retention_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 5_000,
            poll_interval_ms: 1_000,
            completed_retention_secs: 3_600,
            completed_retention_count: 100,
            failed_retention_secs: 86_400,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let postgres = PostgresConfig {
            host: env_or("POSTGRES_HOST", "localhost"),
            port: env_parse("POSTGRES_PORT", 5432),
            user: env_or("POSTGRES_USER", "postgres"),
            password: env_or("POSTGRES_PASSWORD", "postgres"),
            database: env_or("POSTGRES_DB", "rephole"),
        };

        let chroma = ChromaConfig {
            host: env_or("CHROMA_HOST", "localhost"),
            port: env_parse("CHROMA_PORT", 8000),
            ssl: env_parse("CHROMA_SSL", false),
            collection_name: env_or("CHROMA_COLLECTION_NAME", "rephole-collection"),
        };

        let embedding = EmbeddingConfig {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            organization_id: std::env::var("OPENAI_ORGANIZATION_ID").ok(),
            project_id: std::env::var("OPENAI_PROJECT_ID").ok(),
            model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
            max_tokens: env_parse("OPENAI_EMBEDDING_MAX_TOKENS", 8_000),
            timeout_secs: env_parse("OPENAI_TIMEOUT_SECS", 30),
        };

        Self {
            postgres,
            chroma,
            embedding,
            local_storage_path: PathBuf::from(env_or("LOCAL_STORAGE_PATH", "./data/repos")),
            vector_store_batch_size: env_parse("VECTOR_STORE_BATCH_SIZE", 1_000),
            port: std::env::var("PORT").ok().and_then(|v| v.parse().ok()),
            memory_monitoring: env_parse("MEMORY_MONITORING", false),
            memory_warn_mb: env_parse("MEMORY_WARN_MB", 1_024),
            queue: QueueConfig::default(),
        }
    }

    /// Listen port for the API process (default 3000).
    pub fn api_port(&self) -> u16 {
        self.port.unwrap_or(3000)
    }

    /// Listen port for the worker health endpoint (default 3002).
    pub fn worker_port(&self) -> u16 {
        self.port.unwrap_or(3002)
    }
}
