//! # RKV Tools Support
//!
//! Purpose: Shared startup for the command-line tools: logging setup and
//! endpoint resolution.
//!
//! Resolution order: a `*.json` first argument is read as an `Endpoint`
//! config file; otherwise `RKV_HOST`, `RKV_PORT` and `RKV_PASSWORD` override
//! the defaults.

use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rkv_client::Endpoint;
use tracing_subscriber::EnvFilter;

/// Installs the `fmt` subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Splits off a leading config path and resolves the endpoint.
///
/// Returns the endpoint and the remaining arguments.
pub fn endpoint_from_args(mut args: Vec<String>) -> Result<(Endpoint, Vec<String>)> {
    let endpoint = match args.first() {
        Some(first) if first.ends_with(".json") => {
            let path = args.remove(0);
            Endpoint::from_json_file(Path::new(&path))
                .with_context(|| format!("loading config from {}", path))?
        }
        _ => endpoint_from_env(|name| std::env::var(name).ok())?,
    };
    endpoint.validate().context("invalid endpoint")?;
    Ok((endpoint, args))
}

/// Builds an endpoint from `RKV_*` variables looked up through `lookup`.
pub fn endpoint_from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Endpoint> {
    let mut endpoint = Endpoint::default();
    if let Some(host) = lookup("RKV_HOST") {
        endpoint.host = host;
    }
    if let Some(port) = lookup("RKV_PORT") {
        endpoint.port = port
            .parse()
            .with_context(|| format!("RKV_PORT is not a valid port: {:?}", port))?;
    }
    if let Some(password) = lookup("RKV_PASSWORD") {
        endpoint = endpoint.with_password(password);
    }
    Ok(endpoint)
}

/// Parks the calling thread until `running` reports false.
pub fn wait_while(running: impl Fn() -> bool) {
    while running() {
        thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let endpoint = endpoint_from_env(lookup(&[])).unwrap();
        assert_eq!(endpoint, Endpoint::default());
    }

    #[test]
    fn test_env_overrides() {
        let endpoint = endpoint_from_env(lookup(&[
            ("RKV_HOST", "cache.internal"),
            ("RKV_PORT", "7000"),
            ("RKV_PASSWORD", "secret"),
        ]))
        .unwrap();
        assert_eq!(endpoint.host, "cache.internal");
        assert_eq!(endpoint.port, 7000);
        assert_eq!(endpoint.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_env_rejects_bad_port() {
        assert!(endpoint_from_env(lookup(&[("RKV_PORT", "99999")])).is_err());
    }

    #[test]
    fn test_args_without_config_are_kept() {
        let args = vec!["news".to_string(), "alerts".to_string()];
        let (_, rest) = endpoint_from_args(args.clone()).unwrap();
        assert_eq!(rest, args);
    }

    #[test]
    fn test_missing_config_file_fails() {
        let err = endpoint_from_args(vec!["/nonexistent/rkv.json".to_string()]).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rkv.json"));
    }
}
