// src/config.rs

use std::env;
use std::time::Duration;

use dotenvy::dotenv;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub rust_log: String,
    pub bind_addr: String,

    /// Base URL of the code execution service.
    pub code_server_url: String,

    /// Upper bound on a code-run wait when the attempt has no time left (regrade).
    pub code_server_timeout: Duration,

    /// Root under which per-user work directories are named.
    pub code_workdir_root: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set");

        let jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let code_server_url = env::var("CODE_SERVER_URL")
            .unwrap_or_else(|_| "http://localhost:55555".to_string());

        let code_server_timeout = env::var("CODE_SERVER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        let code_workdir_root = env::var("CODE_WORKDIR_ROOT")
            .unwrap_or_else(|_| "output".to_string());

        Self {
            database_url,
            jwt_secret,
            rust_log,
            bind_addr,
            code_server_url,
            code_server_timeout,
            code_workdir_root,
        }
    }
}
