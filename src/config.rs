use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Idle seconds before a conversation is recycled
    #[arg(long, env = "CONVERSATION_TIMEOUT_SECS")]
    pub conversation_timeout_secs: Option<u64>,

    /// Seconds between recycling sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS")]
    pub sweep_interval_secs: Option<u64>,

    /// Database URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub conversation: ConversationConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    /// Idle period after which a conversation is eligible for recycling.
    pub timeout_secs: u64,
    /// Period between recycling sweeps.
    pub sweep_interval_secs: u64,
    /// Semicolon-delimited regex lists matched against request signatures.
    pub initiators: String,
    pub terminators: String,
    /// Cookie carrying the web-session identifier.
    pub session_cookie: String,
}

impl ConversationConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    pub database_url: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("conversation.timeout_secs", 1800)?
            .set_default("conversation.sweep_interval_secs", 300)?
            .set_default("conversation.initiators", "/checkout/start.*")?
            .set_default("conversation.terminators", "/checkout/confirm.*")?
            .set_default("conversation.session_cookie", "sid")?
            .set_default(
                "persistence.database_url",
                "postgres://localhost/conversations",
            )?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }

        // CLI flags (and their env fallbacks, handled by clap) win over the
        // config file.
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", u64::from(port))?;
        }
        if let Some(secs) = cli.conversation_timeout_secs {
            builder = builder.set_override("conversation.timeout_secs", secs)?;
        }
        if let Some(secs) = cli.sweep_interval_secs {
            builder = builder.set_override("conversation.sweep_interval_secs", secs)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }

        // E.g. CONVO_CONVERSATION__TIMEOUT_SECS=600
        builder = builder.add_source(
            Environment::with_prefix("CONVO")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
