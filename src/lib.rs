//! # smtp2tg-router
//!
//! Accepts mail over SMTP and forwards it to Telegram. The recipient address
//! picks the destination:
//!
//! ```text
//! <chat_id>[!<thread_id>][.<flags>]@<local_domain>
//! ```
//!
//! - `-1001234567890@example.com` posts to the chat
//! - `-1001234567890!55@example.com` posts into topic 55 of that chat
//! - `12345.s@example.com` posts without a notification
//!
//! Bad recipients are refused at `RCPT TO`. Telegram outages and rate limits are
//! retried with backoff and, if they persist, answered with a temporary failure
//! so the sending server queues the message and tries again later.

pub mod address;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod message;
pub mod relay;
pub mod smtp;
pub mod telegram;

pub use address::{DecodeError, Flag, Flags, RoutingTarget, decode, encode};
pub use config::{Cli, Config, ConfigError};
pub use delivery::{DeliveryClient, DeliveryOutcome, DeliveryStatus, RetryPolicy};
pub use domain::validate_domain;
pub use message::{MailContent, translate};
pub use relay::{InboundMessage, Relay, RelayReport, RelayRequest};
pub use smtp::{SmtpResponse, SmtpServer};
pub use telegram::{ApiError, SendMessage, SendMessageRequest, TelegramApi};
