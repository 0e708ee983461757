use crate::server::issuer::{MAX_KEY_BITS, MIN_KEY_BITS, parse_distinguished_name};
use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments. Every option can also come from the environment
/// or a `.env` file.
#[derive(Parser, Debug)]
#[command(
    name = "certforge-server",
    version,
    about = "Issues RSA keys and X.509 certificates over a compact TCP protocol"
)]
pub struct CliArgs {
    /// TCP port to listen on
    #[arg(value_name = "PORT")]
    pub port: u16,

    /// Number of concurrent key generation workers
    #[arg(value_name = "WORKERS")]
    pub workers: usize,

    /// PKCS#8 PEM file holding the issuer's private key
    #[arg(value_name = "ISSUER_KEY")]
    pub issuer_key: PathBuf,

    /// Issuer distinguished name, e.g. "CN=Example CA,O=Example"
    #[arg(value_name = "ISSUER_DN")]
    pub issuer_dn: String,

    /// Address to bind
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// RSA modulus size for issued keys
    #[arg(long, env = "KEY_BITS", default_value_t = 2048)]
    pub key_bits: usize,

    /// Validity of issued certificates, in days
    #[arg(long, env = "CERT_VALIDITY_DAYS", default_value_t = 365)]
    pub cert_validity_days: u32,

    /// How long an issued pair is reused for the same name
    #[arg(long, env = "CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Maximum number of names held by the dedup cache
    #[arg(long, env = "CACHE_CAPACITY", default_value_t = 1000)]
    pub cache_capacity: usize,

    /// Refuse new jobs once this many are queued (0 = unbounded)
    #[arg(long, env = "MAX_PENDING_JOBS", default_value_t = 0)]
    pub max_pending_jobs: usize,

    /// How long shutdown waits for in-flight jobs before cancelling them
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Interval between pool monitor samples
    #[arg(long, env = "MONITOR_INTERVAL_SECS", default_value_t = 10)]
    pub monitor_interval_secs: u64,

    /// Upper bound on a single readiness wait
    #[arg(long, env = "POLL_TIMEOUT_MS", default_value_t = 500)]
    pub poll_timeout_ms: u64,

    /// Fraction of busy workers that triggers a utilization warning
    #[arg(long = "high-water", env = "POOL_HIGH_WATER", default_value_t = 0.8)]
    pub high_water: f64,
}

/// Validated server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub num_workers: usize,
    pub issuer_key: PathBuf,
    pub issuer_dn: String,
    pub key_bits: usize,
    pub cert_validity_days: u32,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub max_pending_jobs: Option<usize>,
    pub shutdown_grace: Duration,
    pub monitor_interval: Duration,
    pub poll_timeout: Duration,
    pub high_water: f64,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.workers == 0 {
            bail!("WORKERS must be greater than 0");
        }
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&args.key_bits) {
            bail!(
                "--key-bits must be between {MIN_KEY_BITS} and {MAX_KEY_BITS}, got {}",
                args.key_bits
            );
        }
        if args.cert_validity_days == 0 {
            bail!("--cert-validity-days must be greater than 0");
        }
        if args.cache_capacity == 0 {
            bail!("--cache-capacity must be greater than 0");
        }
        if args.monitor_interval_secs == 0 {
            bail!("--monitor-interval-secs must be greater than 0");
        }
        if args.poll_timeout_ms == 0 {
            bail!("--poll-timeout-ms must be greater than 0");
        }
        if !(args.high_water > 0.0 && args.high_water <= 1.0) {
            bail!("--high-water must be in (0, 1], got {}", args.high_water);
        }
        parse_distinguished_name(&args.issuer_dn)?;

        Ok(Self {
            bind_addr: SocketAddr::new(args.host, args.port),
            num_workers: args.workers,
            issuer_key: args.issuer_key,
            issuer_dn: args.issuer_dn,
            key_bits: args.key_bits,
            cert_validity_days: args.cert_validity_days,
            cache_ttl: Duration::from_secs(args.cache_ttl_secs),
            cache_capacity: args.cache_capacity,
            max_pending_jobs: (args.max_pending_jobs > 0).then_some(args.max_pending_jobs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            monitor_interval: Duration::from_secs(args.monitor_interval_secs),
            poll_timeout: Duration::from_millis(args.poll_timeout_ms),
            high_water: args.high_water,
        })
    }
}

#[cfg(test)]
impl ServerConfig {
    /// A loopback configuration on an ephemeral port with short timers.
    pub fn loopback(num_workers: usize) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            num_workers,
            issuer_key: PathBuf::from("unused.pem"),
            issuer_dn: "CN=Test CA".to_owned(),
            key_bits: MIN_KEY_BITS,
            cert_validity_days: 1,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1000,
            max_pending_jobs: None,
            shutdown_grace: Duration::from_secs(5),
            monitor_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            high_water: 0.8,
        }
    }
}
