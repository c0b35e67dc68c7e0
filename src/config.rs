use anyhow::{Context, Result, anyhow};
use http::Method;
use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::ratelimit::RateLimitAlgorithm;

const DEFAULT_UPSTREAMS: &str = "auth-service=http://127.0.0.1:5001,\
user-service=http://127.0.0.1:5002,\
task-service=http://127.0.0.1:5003,\
logs-service=http://127.0.0.1:5004";

const DEFAULT_ROUTES: &str = "/auth=auth-service@POST@strip,\
/user=user-service@GET|POST|PUT|DELETE@strip,\
/tasks=task-service@GET|POST|PUT|DELETE@keep@GET|POST,\
/logs=logs-service@GET@keep";

const DEFAULT_ROUTE_LIMITS: &str = "/auth=10/minute,/user=50/minute,/tasks=200/hour,/logs=20/minute";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub max_body_bytes: usize,
    pub log_format: LogFormat,
    pub identity: IdentityConfig,
    pub rate_limit: RateLimitConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub routes: Vec<RouteConfig>,
    pub audit: AuditConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// HS256 shared secret. Without it no token can verify and every caller is anonymous.
    pub secret: Option<String>,
    pub principal_claim: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub algorithm: RateLimitAlgorithm,
    pub default_quota: QuotaConfig,
    pub route_quotas: Vec<RouteQuotaConfig>,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub quota: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuotaConfig {
    pub path_prefix: String,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub upstream: String,
    pub methods: Vec<Method>,
    pub root_methods: Option<Vec<Method>>,
    pub rewrite: PathRewrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathRewrite {
    /// Drop the route prefix before appending the path to the backend URL.
    #[default]
    StripPrefix,
    /// Forward the inbound path unchanged.
    Keep,
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub log_dir: PathBuf,
    pub log_file: String,
    pub rotation: AuditRotation,
    pub redis_url: Option<String>,
    pub redis_key: String,
    pub store_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Exact origins, or `*` for any.
    pub allow_origins: Vec<String>,
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allow_origins.iter().any(|o| o == "*")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5000".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "compact".to_string())
            .parse::<LogFormat>()
            .map_err(|e| anyhow!(e))?;

        let identity = IdentityConfig {
            secret: env::var("SECRET_KEY").ok().filter(|s| !s.trim().is_empty()),
            principal_claim: env::var("JWT_PRINCIPAL_CLAIM")
                .unwrap_or_else(|_| "username".to_string()),
        };

        let algorithm = env::var("RATE_LIMIT_ALGORITHM")
            .unwrap_or_else(|_| "fixed_window".to_string())
            .parse::<RateLimitAlgorithm>()
            .map_err(|e| anyhow!(e))?;

        let default_quota = parse_quota(
            &env::var("RATE_LIMIT_DEFAULT").unwrap_or_else(|_| "100/minute".to_string()),
        )
        .context("invalid RATE_LIMIT_DEFAULT")?;

        let route_quotas = parse_route_quotas(
            &env::var("RATE_LIMITS").unwrap_or_else(|_| DEFAULT_ROUTE_LIMITS.to_string()),
        )
        .context("invalid RATE_LIMITS")?;

        let rate_limit = RateLimitConfig {
            enabled: parse_env("RATE_LIMIT_ENABLED", true),
            algorithm,
            default_quota,
            route_quotas,
            reap_interval_secs: parse_env("RATE_LIMIT_REAP_SECONDS", 60u64),
        };

        let upstreams = parse_upstreams(
            &env::var("UPSTREAMS").unwrap_or_else(|_| DEFAULT_UPSTREAMS.to_string()),
        )?;

        let routes =
            parse_routes(&env::var("ROUTES").unwrap_or_else(|_| DEFAULT_ROUTES.to_string()))?;

        let audit = AuditConfig {
            log_dir: PathBuf::from(env::var("AUDIT_LOG_DIR").unwrap_or_else(|_| "logs".into())),
            log_file: env::var("AUDIT_LOG_FILE").unwrap_or_else(|_| "api_gateway.log".into()),
            rotation: env::var("AUDIT_LOG_ROTATION")
                .unwrap_or_else(|_| "never".to_string())
                .parse::<AuditRotation>()
                .map_err(|e| anyhow!(e))?,
            redis_url: env::var("AUDIT_REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            redis_key: env::var("AUDIT_REDIS_KEY").unwrap_or_else(|_| "gateway:audit".into()),
            store_timeout_ms: parse_env("AUDIT_STORE_TIMEOUT_MS", 500u64).max(1),
        };

        let cors = CorsConfig {
            enabled: parse_env("CORS_ENABLED", true),
            allow_origins: parse_origins(
                &env::var("CORS_ALLOW_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
        };

        Ok(Self {
            bind_addr,
            max_body_bytes: parse_env("MAX_BODY_BYTES", 1_048_576usize),
            log_format,
            identity,
            rate_limit,
            upstreams,
            routes,
            audit,
            cors,
        })
    }
}

impl FromStr for PathRewrite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strip" => Ok(Self::StripPrefix),
            "keep" => Ok(Self::Keep),
            other => Err(format!("unsupported path rewrite: {other}")),
        }
    }
}

impl FromStr for AuditRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(format!("unsupported AUDIT_LOG_ROTATION: {other}")),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported LOG_FORMAT: {other}")),
        }
    }
}

/// Parses `10/minute`, `10 per minute` or `200/hour` style quotas.
pub fn parse_quota(raw: &str) -> Result<QuotaConfig> {
    let raw = raw.trim();
    let (count, unit) = raw
        .split_once('/')
        .or_else(|| raw.split_once(" per "))
        .ok_or_else(|| anyhow!("invalid quota: {raw}"))?;

    let quota = count
        .trim()
        .parse::<u64>()
        .with_context(|| format!("invalid quota count in {raw}"))?;

    let secs = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        other => return Err(anyhow!("invalid quota unit {other} in {raw}")),
    };

    Ok(QuotaConfig {
        quota,
        window: Duration::from_secs(secs),
    })
}

fn parse_route_quotas(raw: &str) -> Result<Vec<RouteQuotaConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (prefix, quota) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid rate limit entry: {chunk}"))?;
        let path_prefix = prefix.trim();
        if !path_prefix.starts_with('/') {
            return Err(anyhow!("rate limit prefix must start with '/': {chunk}"));
        }

        out.push(RouteQuotaConfig {
            path_prefix: normalize_prefix(path_prefix),
            quota: parse_quota(quota)?,
        });
    }
    Ok(out)
}

fn parse_upstreams(raw: &str) -> Result<Vec<UpstreamConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?
            .to_string();
        let rhs = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?;

        let fields: Vec<&str> = rhs.split('@').collect();
        let base_url = fields
            .first()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream URL for {name}"))?;
        let timeout_ms = fields
            .get(1)
            .map(|s| s.trim().parse::<u64>().context("invalid upstream timeout"))
            .transpose()?
            .unwrap_or(3_000)
            .max(100);

        out.push(UpstreamConfig {
            name,
            base_url,
            timeout_ms,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no upstreams configured"));
    }
    Ok(out)
}

fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let path_prefix = parts
            .next()
            .map(str::trim)
            .filter(|s| s.starts_with('/'))
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?;

        let fields: Vec<&str> = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?
            .split('@')
            .map(str::trim)
            .collect();

        let upstream = fields
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("route has no upstream: {chunk}"))?
            .to_string();

        let methods = parse_methods(
            fields.get(1)
                .ok_or_else(|| anyhow!("route has no methods: {chunk}"))?,
            chunk,
        )?;

        let rewrite = fields
            .get(2)
            .map(|s| s.parse::<PathRewrite>().map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or_default();

        let root_methods = fields
            .get(3)
            .map(|raw| parse_methods(raw, chunk))
            .transpose()?;

        out.push(RouteConfig {
            path_prefix: normalize_prefix(path_prefix),
            upstream,
            methods,
            root_methods,
            rewrite,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

fn parse_methods(raw: &str, chunk: &str) -> Result<Vec<Method>> {
    let methods = raw
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid method {m} in route {chunk}"))
        })
        .collect::<Result<Vec<_>>>()?;

    if methods.is_empty() {
        return Err(anyhow!("route has no methods: {chunk}"));
    }
    Ok(methods)
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
