//! Command line / environment configuration.

use std::{fmt, net::SocketAddr, time::Duration};

use clap::Parser;
use thiserror::Error;

use crate::{
    delivery::RetryPolicy,
    message::TELEGRAM_MAX_TEXT_LENGTH,
    smtp::SessionSettings,
    telegram::DEFAULT_API_URL,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bot token is required (--token or TELEGRAM_BOT_TOKEN)")]
    MissingToken,

    #[error("bot token must look like <bot id>:<secret>")]
    InvalidToken,

    #[error("invalid local domain '{0}'")]
    InvalidDomain(String),

    #[error("invalid listen address '{0}'")]
    InvalidListen(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// SMTP to Telegram relay. Mail sent to <chat_id>[!<thread_id>][.s]@<domain>
/// is forwarded to that Telegram chat.
#[derive(Parser, Debug, Clone)]
#[command(name = "smtp2tg-router", version)]
pub struct Cli {
    /// Telegram bot token
    #[arg(short = 't', long = "token", env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Local domain recipients must use
    #[arg(short = 'd', long, env = "SMTP_LOCAL_DOMAIN")]
    pub domain: String,

    /// Address to accept SMTP connections on
    #[arg(short = 'l', long, env = "SMTP_LISTEN", default_value = "127.0.0.1:2525")]
    pub listen: String,

    /// Name announced in the SMTP greeting
    #[arg(long, env = "SMTP_HOSTNAME", default_value = "smtp2tg")]
    pub hostname: String,

    /// Telegram Bot API base URL
    #[arg(long, env = "TELEGRAM_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// sendMessage attempts per recipient, the first one included
    #[arg(long, env = "DELIVERY_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled for each further retry
    #[arg(long, env = "DELIVERY_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,

    /// Upper bound for a single retry delay
    #[arg(long, env = "DELIVERY_MAX_BACKOFF_MS", default_value_t = 30_000)]
    pub max_backoff_ms: u64,

    /// Timeout of one Bot API request
    #[arg(long, env = "TELEGRAM_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Longer texts are truncated
    #[arg(long, env = "TELEGRAM_MAX_TEXT_LENGTH", default_value_t = TELEGRAM_MAX_TEXT_LENGTH)]
    pub max_text_length: usize,

    /// Largest accepted message in bytes
    #[arg(long, env = "SMTP_MAX_MESSAGE_SIZE", default_value_t = 10 * 1024 * 1024)]
    pub max_message_size: usize,

    /// Idle SMTP connections are closed after this many seconds
    #[arg(long, env = "SMTP_READ_TIMEOUT_SECS", default_value_t = 300)]
    pub read_timeout_secs: u64,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Immutable runtime configuration, built once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub bot_token: String,
    pub domain: String,
    pub listen: SocketAddr,
    pub hostname: String,
    pub api_url: String,
    pub retry: RetryPolicy,
    pub request_timeout_secs: u64,
    pub max_text_length: usize,
    pub max_message_size: usize,
    pub read_timeout_secs: u64,
    pub verbose: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"***")
            .field("domain", &self.domain)
            .field("listen", &self.listen)
            .field("hostname", &self.hostname)
            .field("api_url", &self.api_url)
            .field("retry", &self.retry)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_text_length", &self.max_text_length)
            .field("max_message_size", &self.max_message_size)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl Cli {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let bot_token = self
            .token
            .map(|token| token.trim().to_owned())
            .filter(|token| !token.is_empty())
            .ok_or(ConfigError::MissingToken)?;
        if !bot_token
            .split_once(':')
            .is_some_and(|(id, secret)| !id.is_empty() && !secret.is_empty())
        {
            return Err(ConfigError::InvalidToken);
        }

        let domain = self.domain.trim().to_owned();
        if domain.is_empty()
            || domain.contains('@')
            || domain.chars().any(char::is_whitespace)
        {
            return Err(ConfigError::InvalidDomain(self.domain));
        }

        let listen = self
            .listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;

        for (name, value) in [
            ("--max-attempts", u64::from(self.max_attempts)),
            ("--request-timeout-secs", self.request_timeout_secs),
            ("--max-text-length", self.max_text_length as u64),
            ("--max-message-size", self.max_message_size as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        Ok(Config {
            bot_token,
            domain,
            listen,
            hostname: self.hostname,
            api_url: self.api_url,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.backoff_ms),
                max_delay: Duration::from_millis(self.max_backoff_ms),
            },
            request_timeout_secs: self.request_timeout_secs,
            max_text_length: self.max_text_length,
            max_message_size: self.max_message_size,
            read_timeout_secs: self.read_timeout_secs,
            verbose: self.verbose,
        })
    }
}

impl Config {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            hostname: self.hostname.clone(),
            max_message_size: self.max_message_size,
        }
    }

    /// `None` disables the idle timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }
}
