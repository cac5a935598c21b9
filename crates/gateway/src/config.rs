//! Gateway configuration, read from environment variables.

use crate::codec::{is_valid_rid, is_valid_rid_part};
use crate::error::{GatewayError, Result};
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Encoding of resources returned by the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiEncoding {
    /// References are wrapped as `{"href", "model"|"collection"|"error"}`.
    #[default]
    Json,
    /// References are replaced by the referenced resource.
    JsonFlat,
}

impl FromStr for ApiEncoding {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ApiEncoding::Json),
            "jsonflat" => Ok(ApiEncoding::JsonFlat),
            _ => Err(GatewayError::Config(format!(
                "invalid API_ENCODING ({}): must be json or jsonflat",
                s
            ))),
        }
    }
}

impl fmt::Display for ApiEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiEncoding::Json => f.write_str("json"),
            ApiEncoding::JsonFlat => f.write_str("jsonflat"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nats_url: String,
    pub request_timeout: Duration,
    pub addr: String,
    pub port: u16,
    /// Prometheus exporter port. 0 disables the exporter.
    pub metrics_port: u16,
    pub ws_path: String,
    pub api_path: String,
    pub api_encoding: ApiEncoding,
    /// `<rid>.<method>` called with the HTTP headers of each new client.
    pub header_auth: Option<String>,
    pub put_method: Option<String>,
    pub delete_method: Option<String>,
    pub patch_method: Option<String>,
    pub reset_throttle: usize,
    pub reference_throttle: usize,
    pub cache_workers: usize,
    pub unsubscribe_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nats_url: "nats://127.0.0.1:4222".to_string(),
            request_timeout: Duration::from_millis(3000),
            addr: "0.0.0.0".to_string(),
            port: 8080,
            metrics_port: 0,
            ws_path: "/".to_string(),
            api_path: "/api/".to_string(),
            api_encoding: ApiEncoding::Json,
            header_auth: None,
            put_method: None,
            delete_method: None,
            patch_method: None,
            reset_throttle: 0,
            reference_throttle: 0,
            cache_workers: 10,
            unsubscribe_delay: Duration::from_millis(5000),
        }
    }
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load the configuration from a variable lookup. Unset variables keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("NATS_URL") {
            c.nats_url = v;
        }
        if let Some(ms) = parse_var::<u64>(&var, "REQUEST_TIMEOUT_MS")? {
            c.request_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = var("ADDR") {
            c.addr = v;
        }
        if let Some(port) = parse_var(&var, "PORT")? {
            c.port = port;
        }
        if let Some(port) = parse_var(&var, "METRICS_PORT")? {
            c.metrics_port = port;
        }
        if let Some(v) = var("WS_PATH") {
            c.ws_path = v;
        }
        if let Some(v) = var("API_PATH") {
            c.api_path = v;
        }
        if let Some(v) = var("API_ENCODING") {
            c.api_encoding = v.parse()?;
        }
        c.header_auth = var("HEADER_AUTH");
        c.put_method = var("PUT_METHOD");
        c.delete_method = var("DELETE_METHOD");
        c.patch_method = var("PATCH_METHOD");
        if let Some(n) = parse_var(&var, "RESET_THROTTLE")? {
            c.reset_throttle = n;
        }
        if let Some(n) = parse_var(&var, "REFERENCE_THROTTLE")? {
            c.reference_throttle = n;
        }
        if let Some(n) = parse_var(&var, "CACHE_WORKERS")? {
            c.cache_workers = n;
        }
        if let Some(ms) = parse_var::<u64>(&var, "UNSUBSCRIBE_DELAY_MS")? {
            c.unsubscribe_delay = Duration::from_millis(ms);
        }

        c.normalize();
        Ok(c)
    }

    fn normalize(&mut self) {
        if !self.ws_path.starts_with('/') {
            self.ws_path.insert(0, '/');
        }
        if !self.api_path.starts_with('/') {
            self.api_path.insert(0, '/');
        }
        if !self.api_path.ends_with('/') {
            self.api_path.push('/');
        }
    }

    /// Check the settings that cannot be verified while parsing.
    pub fn validate(&self) -> Result<()> {
        if self.addr.parse::<IpAddr>().is_err() {
            return Err(GatewayError::Config(format!(
                "invalid ADDR ({}): must be a valid IPv4 or IPv6 address",
                self.addr
            )));
        }
        if let Some(s) = &self.header_auth {
            if self.header_auth_method().is_none() {
                return Err(GatewayError::Config(format!(
                    "invalid HEADER_AUTH ({}): must be a valid resource method",
                    s
                )));
            }
        }
        for (name, method) in [
            ("PUT_METHOD", &self.put_method),
            ("DELETE_METHOD", &self.delete_method),
            ("PATCH_METHOD", &self.patch_method),
        ] {
            if let Some(m) = method {
                if !is_valid_rid_part(m) {
                    return Err(GatewayError::Config(format!(
                        "invalid {} ({}): must be a valid call method name",
                        name, m
                    )));
                }
            }
        }
        if self.cache_workers == 0 {
            return Err(GatewayError::Config("CACHE_WORKERS must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Split `HEADER_AUTH` into resource ID and method.
    pub fn header_auth_method(&self) -> Option<(String, String)> {
        let s = self.header_auth.as_deref()?;
        if !is_valid_rid(s, false) {
            return None;
        }
        let (rid, method) = s.rsplit_once('.')?;
        Some((rid.to_string(), method.to_string()))
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> String {
        match self.addr.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.addr, self.port),
        }
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match var(key) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| GatewayError::Config(format!("{} must be a number ({})", key, v))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = load(&[]).unwrap();
        assert_eq!(c.nats_url, "nats://127.0.0.1:4222");
        assert_eq!(c.port, 8080);
        assert_eq!(c.api_path, "/api/");
        assert_eq!(c.ws_path, "/");
        assert_eq!(c.api_encoding, ApiEncoding::Json);
        assert_eq!(c.cache_workers, 10);
        assert_eq!(c.unsubscribe_delay, Duration::from_secs(5));
        c.validate().unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_overrides() {
        let c = load(&[
            ("PORT", "9000"),
            ("API_PATH", "v1"),
            ("API_ENCODING", "JSONFlat"),
            ("REQUEST_TIMEOUT_MS", "500"),
            ("HEADER_AUTH", "auth.user.login"),
            ("PUT_METHOD", "set"),
            ("ADDR", "::1"),
        ])
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.api_path, "/v1/");
        assert_eq!(c.api_encoding, ApiEncoding::JsonFlat);
        assert_eq!(c.request_timeout, Duration::from_millis(500));
        assert_eq!(c.put_method.as_deref(), Some("set"));
        assert_eq!(
            c.header_auth_method(),
            Some(("auth.user".to_string(), "login".to_string()))
        );
        c.validate().unwrap();
        assert_eq!(c.listen_addr(), "[::1]:9000");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(load(&[("PORT", "http")]), Err(GatewayError::Config(_))));
        assert!(matches!(load(&[("API_ENCODING", "xml")]), Err(GatewayError::Config(_))));

        for vars in [
            [("ADDR", "localhost")],
            [("HEADER_AUTH", "noaction")],
            [("HEADER_AUTH", "auth.user.")],
            [("DELETE_METHOD", "a.b")],
            [("CACHE_WORKERS", "0")],
        ] {
            let c = load(&vars).unwrap();
            assert!(matches!(c.validate(), Err(GatewayError::Config(_))), "{:?}", vars);
        }
    }
}
