//! Runtime configuration handed in by the launcher.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

/// One KV endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KvEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for KvEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for KvEndpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("endpoint {s:?} is not host:port"))?;
        anyhow::ensure!(!host.is_empty(), "endpoint {s:?} has an empty host");
        let port = port
            .parse::<u16>()
            .map_err(|err| anyhow::anyhow!("endpoint {s:?} has a bad port: {err}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Paths to the client TLS material. All three files are required when TLS
/// is enabled.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsPaths {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Proxy configuration, fixed for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KV endpoints to pull work from; at least one.
    pub endpoints: Vec<KvEndpoint>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsPaths>,
    /// Per-pipeline parallelism.
    pub max_tasks: usize,
    /// Per-query accepted-row budget.
    pub max_rows: u32,
    /// Local name used to build the `ENGINE:<host>` in-progress list.
    pub hostname: String,
}
