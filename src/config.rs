use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Default similarity threshold above which a generated spec counts as a duplicate.
pub const DEFAULT_SIM_THRESHOLD: f64 = 0.86;
/// Default number of nearest neighbours requested from the similarity gateway.
pub const DEFAULT_TOP_K: usize = 5;
/// Commit message used for generated game folders unless overridden.
pub const DEFAULT_COMMIT_TEMPLATE: &str = "Generated game: %s (ID: %s)";

/// Runtime configuration for the factory server.
///
/// Built once at process start (see [`ServeArgs::into_config`]) and passed
/// explicitly to every coordinator and driver. Nothing below the binary reads
/// the process environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub gateway: GatewayConfig,
    pub git: GitConfig,
    pub agent: AgentConfig,
    pub worker: WorkerConfig,
}

/// Spec generation + similarity gateway (the LLM/vector service).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub top_k: usize,
    pub threshold: f64,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_SIM_THRESHOLD,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Shared git checkout that receives one folder per generated spec.
#[derive(Debug, Clone)]
pub struct GitConfig {
    pub repo_path: PathBuf,
    pub repo_url: String,
    pub username: Option<String>,
    pub token: String,
    pub auto_push: bool,
    pub commit_message_template: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::new(),
            repo_url: String::new(),
            username: None,
            token: String::new(),
            auto_push: false,
            commit_message_template: DEFAULT_COMMIT_TEMPLATE.to_string(),
        }
    }
}

impl GitConfig {
    pub fn is_configured(&self) -> bool {
        !self.repo_path.as_os_str().is_empty() && !self.repo_url.is_empty() && !self.token.is_empty()
    }
}

/// External coding agent (session-creation API).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub session_base_url: String,
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.devin.ai/v1/sessions".to_string(),
            api_key: None,
            session_base_url: "https://app.devin.ai/sessions".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Code job worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    /// Jobs whose heartbeat (`updated_at`) is older than this are reaped as orphaned.
    pub stale_after: Duration,
    pub reap_interval: Duration,
    /// How long shutdown waits for in-flight workers before failing their jobs.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 64,
            stale_after: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from(".gamesmith/gamesmith.db"),
            dev_mode: false,
            gateway: GatewayConfig::default(),
            git: GitConfig::default(),
            agent: AgentConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Command-line / environment options for `gamesmith serve`.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Port to serve on
    #[arg(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = ".gamesmith/gamesmith.db")]
    pub db_path: PathBuf,

    /// Enable dev mode (permissive CORS, bind on all interfaces)
    #[arg(long, env = "DEV_MODE")]
    pub dev: bool,

    /// Base URL of the spec generation / similarity service
    #[arg(long, env = "LLM_BACKEND_URL", default_value = "http://localhost:8000")]
    pub llm_backend_url: String,

    #[arg(long, env = "TOP_K", default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    #[arg(long, env = "SIM_THRESHOLD", default_value_t = DEFAULT_SIM_THRESHOLD)]
    pub sim_threshold: f64,

    /// Timeout for every outbound HTTP call, in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,

    #[arg(long, env = "GIT_REPO_PATH", default_value = "")]
    pub git_repo_path: PathBuf,

    #[arg(long, env = "GIT_REPO_URL", default_value = "")]
    pub git_repo_url: String,

    #[arg(long, env = "GIT_USERNAME")]
    pub git_username: Option<String>,

    #[arg(long, env = "GIT_TOKEN", default_value = "", hide_env_values = true)]
    pub git_token: String,

    /// Push folder deletions to the remote as well as committing them
    #[arg(long, env = "GIT_AUTO_PUSH")]
    pub git_auto_push: bool,

    #[arg(long, env = "GIT_COMMIT_MESSAGE_TEMPLATE", default_value = DEFAULT_COMMIT_TEMPLATE)]
    pub git_commit_message_template: String,

    #[arg(long, env = "DEVIN_API_URL", default_value = "https://api.devin.ai/v1/sessions")]
    pub devin_api_url: String,

    #[arg(long, env = "DEVIN_API_KEY", hide_env_values = true)]
    pub devin_api_key: Option<String>,

    #[arg(long, env = "DEVIN_SESSION_BASE_URL", default_value = "https://app.devin.ai/sessions")]
    pub devin_session_base_url: String,

    #[arg(long, env = "WORKER_CONCURRENCY", default_value = "4")]
    pub worker_concurrency: usize,

    #[arg(long, env = "WORKER_QUEUE_CAPACITY", default_value = "64")]
    pub worker_queue_capacity: usize,

    #[arg(long, env = "JOB_STALE_AFTER_SECS", default_value = "1800")]
    pub job_stale_after_secs: u64,

    #[arg(long, env = "JOB_REAP_INTERVAL_SECS", default_value = "60")]
    pub job_reap_interval_secs: u64,

    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "10")]
    pub shutdown_grace_secs: u64,
}

impl ServeArgs {
    pub fn into_config(self) -> AppConfig {
        let timeout = Duration::from_secs(self.http_timeout_secs.max(1));
        AppConfig {
            port: self.port,
            db_path: self.db_path,
            dev_mode: self.dev,
            gateway: GatewayConfig {
                base_url: self.llm_backend_url.trim_end_matches('/').to_string(),
                top_k: self.top_k.max(1),
                threshold: self.sim_threshold,
                timeout,
            },
            git: GitConfig {
                repo_path: self.git_repo_path,
                repo_url: self.git_repo_url,
                username: self.git_username.filter(|u| !u.is_empty()),
                token: self.git_token,
                auto_push: self.git_auto_push,
                commit_message_template: self.git_commit_message_template,
            },
            agent: AgentConfig {
                api_url: self.devin_api_url,
                api_key: self.devin_api_key.filter(|k| !k.is_empty()),
                session_base_url: self.devin_session_base_url.trim_end_matches('/').to_string(),
                timeout,
            },
            worker: WorkerConfig {
                concurrency: self.worker_concurrency.max(1),
                queue_capacity: self.worker_queue_capacity.max(1),
                stale_after: Duration::from_secs(self.job_stale_after_secs),
                reap_interval: Duration::from_secs(self.job_reap_interval_secs.max(1)),
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            },
        }
    }
}
