use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment,
    parse_oracle_quality, parse_u16, parse_u32, parse_u64,
};
use super::types::{
    ApiSettings, ConfigError, CorsSettings, DatabaseSettings, GradebookSettings, HostSettings,
    OracleSettings, QueueSettings, RedisSettings, RuntimeSettings, ServerHost, ServerPort,
    ServerSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("AUTOGRADE_HOST", "0.0.0.0");
        let port = env_or_default("AUTOGRADE_PORT", "8000");

        let environment = parse_environment(
            env_optional("AUTOGRADE_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("AUTOGRADE_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Autograde API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");
        let batch_rate_limit =
            parse_u64("BATCH_RATE_LIMIT", env_or_default("BATCH_RATE_LIMIT", "5"))?;
        let batch_rate_window_seconds = parse_u64(
            "BATCH_RATE_WINDOW_SECONDS",
            env_or_default("BATCH_RATE_WINDOW_SECONDS", "60"),
        )?;

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "autograde");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "autograde");
        let database_url = env_optional("DATABASE_URL");
        let database_max_connections = parse_u32(
            "DATABASE_MAX_CONNECTIONS",
            env_or_default("DATABASE_MAX_CONNECTIONS", "10"),
        )?;
        let database_acquire_timeout = parse_u64(
            "DATABASE_ACQUIRE_TIMEOUT_SECONDS",
            env_or_default("DATABASE_ACQUIRE_TIMEOUT_SECONDS", "30"),
        )?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let oracle_base_url = env_or_default("ORACLE_BASE_URL", "");
        let oracle_api_key = env_or_default("ORACLE_API_KEY", "");
        let oracle_quality = parse_oracle_quality(env_or_default("ORACLE_QUALITY", "balanced"))?;
        let oracle_timeout = parse_u64(
            "ORACLE_REQUEST_TIMEOUT",
            env_or_default("ORACLE_REQUEST_TIMEOUT", "120"),
        )?;
        let oracle_max_attempts =
            parse_u32("ORACLE_MAX_ATTEMPTS", env_or_default("ORACLE_MAX_ATTEMPTS", "2"))?;

        let gradebook_webhook_url = env_or_default("GRADEBOOK_WEBHOOK_URL", "");
        let gradebook_timeout = parse_u64(
            "GRADEBOOK_REQUEST_TIMEOUT",
            env_or_default("GRADEBOOK_REQUEST_TIMEOUT", "30"),
        )?;

        let host_submissions_url = env_or_default("HOST_SUBMISSIONS_URL", "");
        let host_api_token = env_or_default("HOST_API_TOKEN", "");
        let host_timeout =
            parse_u64("HOST_REQUEST_TIMEOUT", env_or_default("HOST_REQUEST_TIMEOUT", "30"))?;

        let queue_batch_size =
            parse_u32("QUEUE_BATCH_SIZE", env_or_default("QUEUE_BATCH_SIZE", "10"))?;
        let queue_poll_interval = parse_u64(
            "QUEUE_POLL_INTERVAL_SECONDS",
            env_or_default("QUEUE_POLL_INTERVAL_SECONDS", "60"),
        )?;
        let queue_backoff_step = parse_u64(
            "QUEUE_BACKOFF_STEP_MINUTES",
            env_or_default("QUEUE_BACKOFF_STEP_MINUTES", "5"),
        )?;
        let queue_retention_days =
            parse_u64("QUEUE_RETENTION_DAYS", env_or_default("QUEUE_RETENTION_DAYS", "30"))?;
        let queue_maintenance_interval = parse_u64(
            "QUEUE_MAINTENANCE_INTERVAL_SECONDS",
            env_or_default("QUEUE_MAINTENANCE_INTERVAL_SECONDS", "900"),
        )?;

        let log_level = env_or_default("AUTOGRADE_LOG_LEVEL", "info");
        let json = env_optional("AUTOGRADE_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings {
                project_name,
                version,
                api_v1_str,
                batch_rate_limit,
                batch_rate_window_seconds,
            },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections: database_max_connections,
                acquire_timeout_seconds: database_acquire_timeout,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            oracle: OracleSettings {
                base_url: oracle_base_url.trim_end_matches('/').to_string(),
                api_key: oracle_api_key,
                quality: oracle_quality,
                request_timeout_seconds: oracle_timeout,
                max_attempts: oracle_max_attempts,
            },
            gradebook: GradebookSettings {
                webhook_url: gradebook_webhook_url,
                request_timeout_seconds: gradebook_timeout,
            },
            host: HostSettings {
                submissions_url: host_submissions_url.trim_end_matches('/').to_string(),
                api_token: host_api_token,
                request_timeout_seconds: host_timeout,
            },
            queue: QueueSettings {
                batch_size: queue_batch_size,
                poll_interval_seconds: queue_poll_interval,
                backoff_step_minutes: queue_backoff_step,
                retention_days: queue_retention_days,
                maintenance_interval_seconds: queue_maintenance_interval,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn oracle(&self) -> &OracleSettings {
        &self.oracle
    }

    pub(crate) fn gradebook(&self) -> &GradebookSettings {
        &self.gradebook
    }

    pub(crate) fn host(&self) -> &HostSettings {
        &self.host
    }

    pub(crate) fn queue(&self) -> &QueueSettings {
        &self.queue
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    /// Seconds after which a `processing` claim is considered abandoned by its worker.
    pub(crate) fn stale_claim_seconds(&self) -> u64 {
        self.oracle
            .request_timeout_seconds
            .saturating_mul(u64::from(self.oracle.max_attempts.max(1)))
            .saturating_add(120)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "QUEUE_BATCH_SIZE",
                value: String::from("0"),
            });
        }

        if self.queue.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "QUEUE_POLL_INTERVAL_SECONDS",
                value: String::from("0"),
            });
        }

        if self.queue.maintenance_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "QUEUE_MAINTENANCE_INTERVAL_SECONDS",
                value: String::from("0"),
            });
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_MAX_CONNECTIONS",
                value: String::from("0"),
            });
        }

        if self.oracle.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ORACLE_MAX_ATTEMPTS",
                value: String::from("0"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        if self.oracle.is_enabled() && self.oracle.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("ORACLE_API_KEY"));
        }

        if !self.host.submissions_url.is_empty() && self.host.api_token.is_empty() {
            return Err(ConfigError::MissingSecret("HOST_API_TOKEN"));
        }

        Ok(())
    }
}
