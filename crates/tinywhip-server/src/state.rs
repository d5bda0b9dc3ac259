use crate::sfu::SfuManager;
use anyhow::Context;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tinywhip_media::SupportedCodec;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_FEEDBACK_INTERVAL_MS: u64 = 2000;
const DEFAULT_GATHERING_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Codec families offered to publishers
    pub codecs: Vec<SupportedCodec>,
    /// Period of the PLI (and optional REMB) sent upstream per video track
    pub feedback_interval: Duration,
    /// Bitrate advertised in REMB feedback, in bits per second
    pub remb_bitrate: Option<u64>,
    /// Upper bound on waiting for ICE candidate gathering
    pub gathering_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", DEFAULT_PORT),
            stun_servers: vec![],
            turn_servers: vec![],
            codecs: SupportedCodec::ALL.to_vec(),
            feedback_interval: Duration::from_millis(DEFAULT_FEEDBACK_INTERVAL_MS),
            remb_bitrate: None,
            gathering_timeout: Duration::from_millis(DEFAULT_GATHERING_TIMEOUT_MS),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // Load from environment variables (a .env file is read first by main)
        let port: u16 = parse_env("PORT")?.unwrap_or(DEFAULT_PORT);
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| format!("0.0.0.0:{}", port));

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let turn_servers = match std::env::var("TURN_URL") {
            Ok(url) => vec![TurnServer {
                url,
                username: std::env::var("TURN_USERNAME").unwrap_or_default(),
                credential: std::env::var("TURN_CREDENTIAL").unwrap_or_default(),
            }],
            Err(_) => vec![],
        };

        let mut codecs: Vec<SupportedCodec> = SupportedCodec::ALL
            .into_iter()
            .filter(|codec| std::env::var_os(codec.env_var()).is_some())
            .collect();
        if codecs.is_empty() {
            tracing::warn!("No SUPPORT_* codec flags set, enabling every supported codec");
            codecs = SupportedCodec::ALL.to_vec();
        }

        let feedback_interval = Duration::from_millis(
            parse_env("RTCP_FEEDBACK_INTERVAL_MS")?.unwrap_or(DEFAULT_FEEDBACK_INTERVAL_MS),
        );
        if feedback_interval.is_zero() {
            anyhow::bail!("RTCP_FEEDBACK_INTERVAL_MS must be greater than zero");
        }

        let remb_bitrate = parse_env("REMB_BITRATE")?;

        let gathering_timeout = Duration::from_millis(
            parse_env("ICE_GATHERING_TIMEOUT_MS")?.unwrap_or(DEFAULT_GATHERING_TIMEOUT_MS),
        );

        Ok(Config {
            bind_address,
            stun_servers,
            turn_servers,
            codecs,
            feedback_interval,
            remb_bitrate,
            gathering_timeout,
        })
    }
}

fn parse_env<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", name, value)),
        Err(_) => Ok(None),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sfu: Arc<SfuManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let sfu = Arc::new(SfuManager::new(&config));
        Self { config, sfu }
    }
}
