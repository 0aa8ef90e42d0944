use std::io;
use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take defaults; set but
    /// unparseable values are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let d = Self::default();
        Ok(Self {
            port: parsed(&lookup, "SLOTD_PORT")?.unwrap_or(d.port),
            bind: lookup("SLOTD_BIND").unwrap_or(d.bind),
            data_dir: lookup("SLOTD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SLOTD_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "SLOTD_MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "SLOTD_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            metrics_port: parsed(&lookup, "SLOTD_METRICS_PORT")?,
            tls_cert: lookup("SLOTD_TLS_CERT"),
            tls_key: lookup("SLOTD_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotd.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> io::Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("{key}: invalid value {raw:?}"))
            })
        })
        .transpose()
}
