use std::net::SocketAddr;
use std::time::Duration;

use crate::error::SpecError;

pub const KERNEL_ENV_PREFIX: &str = "NBRUN_KERNEL_";

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub http: HttpServerConfig,
    /// How long an unretrieved terminal request is kept.
    pub result_ttl: Duration,
    /// Period of the expired-request sweep.
    pub sweep_interval: Duration,
    /// Whether kernels may block on interactive input.
    pub allow_stdin: bool,
    pub kernel_specs: Vec<KernelSpec>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            http: HttpServerConfig::default(),
            result_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            allow_stdin: true,
            kernel_specs: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `NBRUN_*` environment variables.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(bind) = env_parse::<SocketAddr>("NBRUN_BIND") {
            config.http.bind = bind;
        }
        if let Some(secs) = env_parse::<u64>("NBRUN_RESULT_TTL_SECS") {
            config.result_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NBRUN_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(allow) = env_parse::<bool>("NBRUN_ALLOW_STDIN") {
            config.allow_stdin = allow;
        }
        let mut specs: Vec<KernelSpec> = std::env::vars()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(KERNEL_ENV_PREFIX)?.to_ascii_lowercase();
                match KernelSpec::from_command_line(&name, &value) {
                    Ok(spec) => Some(spec),
                    Err(err) => {
                        tracing::warn!("ignoring {key}: {err}");
                        None
                    }
                }
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        config.kernel_specs = specs;
        config
    }

    pub fn kernel_spec(&self, name: &str) -> Option<&KernelSpec> {
        self.kernel_specs.iter().find(|spec| spec.name == name)
    }

    /// Add or replace a kernel spec by name.
    pub fn upsert_kernel_spec(&mut self, spec: KernelSpec) {
        self.kernel_specs.retain(|s| s.name != spec.name);
        self.kernel_specs.push(spec);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("ignoring {key}={raw}: {err}");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8888)),
        }
    }
}

/// How to launch a kernel process speaking newline-delimited JSON messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    pub name: String,
    pub argv: Vec<String>,
}

impl KernelSpec {
    pub fn from_command_line(name: &str, command: &str) -> Result<Self, SpecError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
        if argv.is_empty() {
            return Err(SpecError::EmptyCommand(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            argv,
        })
    }

    /// Parse `name=command arg...`, the CLI form.
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let (name, command) = raw
            .split_once('=')
            .ok_or_else(|| SpecError::MissingSeparator(raw.to_string()))?;
        Self::from_command_line(name, command)
    }
}
