use std::path::PathBuf;

/// Agent configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to
    pub bind_address: String,
    /// SQLite database URL (printer registry)
    pub database_url: String,
    /// Directory for static web files
    pub static_dir: String,
    /// Root directory for per-printer local storage (print records, etc.)
    pub local_storage_root: PathBuf,
    /// First port in the range handed out to printers' local brokers; each
    /// connected printer gets the next free port in the range.
    pub local_broker_port_base: u16,
    /// Run ffmpeg at a more verbose log level for the RTSP webcam variant.
    pub camera_debug: bool,
}

impl Config {
    /// Load configuration from environment variables with defaults. Fails
    /// fast: a bad `CONNECTION_MODE` has no sensible degraded behavior, so
    /// this panics rather than silently running in an unsupported mode.
    pub fn from_env() -> Self {
        let connection_mode =
            std::env::var("CONNECTION_MODE").unwrap_or_else(|_| "local".into());
        if connection_mode != "local" {
            panic!(
                "unsupported CONNECTION_MODE {connection_mode:?}: only \"local\" is supported, \
                 cloud relay mode is out of scope for this agent"
            );
        }

        Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:bambu-agent.db?mode=rwc".into()),
            static_dir: std::env::var("STATIC_DIR").unwrap_or_else(|_| "../web/dist".into()),
            local_storage_root: std::env::var("LOCAL_STORAGE_ROOT")
                .unwrap_or_else(|_| "./storage".into())
                .into(),
            local_broker_port_base: std::env::var("LOCAL_BROKER_PORT_BASE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(18830),
            camera_debug: std::env::var("CAMERA_DEBUG")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}
