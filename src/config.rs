//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};

use crate::validation::Policy;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Oldest accepted event age in seconds.
    pub max_event_age: u64,
    /// Seconds an event may be ahead of the relay clock.
    pub max_future_skew: u64,
    /// Reader pool size; the writer pool always has one connection.
    pub db_readers: u32,
    /// Buffered events per bus topic before slow listeners lag.
    pub broadcast_capacity: usize,
    /// Queued outbound messages per connection.
    pub outbound_buffer: usize,
    /// Upper bound on every per-filter `limit`.
    pub query_limit_max: u64,
    /// Filters accepted in one REQ or COUNT.
    pub max_filters: usize,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let db_path = PathBuf::from(env::var("DB_PATH").context("DB_PATH")?);
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS").context("BIND_WS")?;
        Ok(Self {
            db_path,
            bind_http,
            bind_ws,
            max_event_age: number("MAX_EVENT_AGE", 7 * 24 * 60 * 60)?,
            max_future_skew: number("MAX_FUTURE_SKEW", 0)?,
            db_readers: number("DB_READERS", 4)?,
            broadcast_capacity: number("BROADCAST_CAPACITY", 1024)?,
            outbound_buffer: number("OUTBOUND_BUFFER", 256)?,
            query_limit_max: number("QUERY_LIMIT_MAX", 500)?,
            max_filters: number("MAX_FILTERS", 100)?,
        })
    }

    /// Admission policy built from the timestamp settings.
    pub fn policy(&self) -> Policy {
        Policy {
            max_age: self.max_event_age,
            max_future_skew: self.max_future_skew,
        }
    }
}

/// Read a numeric variable, falling back to `default` when unset or empty.
fn number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} is not a valid number: {raw}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    pub(crate) const VARS: [&str; 10] = [
        "DB_PATH",
        "BIND_HTTP",
        "BIND_WS",
        "MAX_EVENT_AGE",
        "MAX_FUTURE_SKEW",
        "DB_READERS",
        "BROADCAST_CAPACITY",
        "OUTBOUND_BUFFER",
        "QUERY_LIMIT_MAX",
        "MAX_FILTERS",
    ];

    pub(crate) fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DB_PATH=/tmp/strand.db\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "MAX_EVENT_AGE=60\n",
                "MAX_FUTURE_SKEW=5\n",
                "DB_READERS=2\n",
                "BROADCAST_CAPACITY=16\n",
                "OUTBOUND_BUFFER=8\n",
                "QUERY_LIMIT_MAX=50\n",
                "MAX_FILTERS=20\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/strand.db"));
        assert_eq!(cfg.bind_http, "127.0.0.1:8080");
        assert_eq!(cfg.bind_ws, "127.0.0.1:8081");
        assert_eq!(cfg.db_readers, 2);
        assert_eq!(cfg.broadcast_capacity, 16);
        assert_eq!(cfg.outbound_buffer, 8);
        assert_eq!(cfg.query_limit_max, 50);
        assert_eq!(cfg.max_filters, 20);
        let policy = cfg.policy();
        assert_eq!(policy.max_age, 60);
        assert_eq!(policy.max_future_skew, 5);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DB_PATH=/tmp/strand.db\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "DB_READERS=\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.max_event_age, 604_800);
        assert_eq!(cfg.max_future_skew, 0);
        assert_eq!(cfg.db_readers, 4);
        assert_eq!(cfg.broadcast_capacity, 1024);
        assert_eq!(cfg.outbound_buffer, 256);
        assert_eq!(cfg.query_limit_max, 500);
        assert_eq!(cfg.max_filters, 100);
    }

    #[test]
    fn missing_required_fields_error() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!("BIND_HTTP=127.0.0.1:8080\n", "BIND_WS=127.0.0.1:8081\n"),
        )
        .unwrap();
        let err = Settings::from_env(env_path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("DB_PATH"));
    }

    #[test]
    fn invalid_number_errors() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "DB_PATH=/tmp/strand.db\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "BIND_WS=127.0.0.1:8081\n",
                "QUERY_LIMIT_MAX=lots\n",
            ),
        )
        .unwrap();
        let err = Settings::from_env(env_path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("QUERY_LIMIT_MAX"));
    }
}
