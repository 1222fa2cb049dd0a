//! Recipient address codec.
//!
//! The local-part of every accepted recipient encodes where the message goes:
//!
//! ```text
//! [id]<chat_id>[!<thread_id>][.<flags>]@<local_domain>
//! ```
//!
//! `-1001234567890!55.s@example.com` is chat `-1001234567890`, topic `55`,
//! delivered without a notification.

use std::fmt;

use thiserror::Error;

const THREAD_SEPARATOR: char = '!';
const FLAGS_SEPARATOR: char = '.';
const CHAT_PREFIX: &str = "id";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty recipient")]
    Empty,

    #[error("invalid chat id '{0}'")]
    InvalidChatId(String),

    #[error("invalid thread id '{0}'")]
    InvalidThreadId(String),

    #[error("unknown flag '{0}'")]
    UnknownFlag(char),

    #[error("empty flag list after '.'")]
    EmptyFlags,
}

/// Per-recipient behaviour switches carried after the `.` of the local-part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    /// Deliver with `disable_notification` set.
    Silent,
}

impl Flag {
    pub const ALL: [Flag; 1] = [Flag::Silent];

    pub fn as_char(self) -> char {
        match self {
            Flag::Silent => 's',
        }
    }

    pub fn from_char(c: char) -> Result<Self, DecodeError> {
        Flag::ALL
            .into_iter()
            .find(|flag| flag.as_char() == c)
            .ok_or(DecodeError::UnknownFlag(c))
    }
}

/// Closed set of [`Flag`]s. Iteration order is the declaration order of `Flag`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags {
    silent: bool,
}

impl Flags {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: Flag) -> Self {
        self.insert(flag);
        self
    }

    pub fn insert(&mut self, flag: Flag) {
        match flag {
            Flag::Silent => self.silent = true,
        }
    }

    pub fn contains(&self, flag: Flag) -> bool {
        match flag {
            Flag::Silent => self.silent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = Flag> + '_ {
        Flag::ALL.into_iter().filter(|flag| self.contains(*flag))
    }
}

/// Where a single recipient's copy of a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingTarget {
    pub chat_id: i64,
    pub thread_id: Option<u64>,
    pub flags: Flags,
}

impl RoutingTarget {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
            flags: Flags::empty(),
        }
    }

    pub fn with_thread(mut self, thread_id: u64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flags.insert(flag);
        self
    }

    pub fn is_silent(&self) -> bool {
        self.flags.contains(Flag::Silent)
    }
}

impl fmt::Display for RoutingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

/// Decode a recipient local-part into a [`RoutingTarget`].
pub fn decode(local_part: &str) -> Result<RoutingTarget, DecodeError> {
    if local_part.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (route, flags) = match local_part.split_once(FLAGS_SEPARATOR) {
        Some((route, flags)) => (route, Some(flags)),
        None => (local_part, None),
    };

    let (chat, thread) = match route.split_once(THREAD_SEPARATOR) {
        Some((chat, thread)) => (chat, Some(thread)),
        None => (route, None),
    };

    let chat_id = parse_chat_id(chat.strip_prefix(CHAT_PREFIX).unwrap_or(chat))?;

    let thread_id = thread
        .map(|thread| {
            if is_digits(thread) {
                thread
                    .parse::<u64>()
                    .map_err(|_| DecodeError::InvalidThreadId(thread.to_owned()))
            } else {
                Err(DecodeError::InvalidThreadId(thread.to_owned()))
            }
        })
        .transpose()?;

    if flags == Some("") {
        return Err(DecodeError::EmptyFlags);
    }

    let mut parsed = Flags::empty();
    for c in flags.unwrap_or_default().chars() {
        parsed.insert(Flag::from_char(c)?);
    }

    Ok(RoutingTarget {
        chat_id,
        thread_id,
        flags: parsed,
    })
}

/// Inverse of [`decode`]. Never emits the optional `id` prefix.
pub fn encode(target: &RoutingTarget) -> String {
    let mut out = target.chat_id.to_string();

    if let Some(thread_id) = target.thread_id {
        out.push(THREAD_SEPARATOR);
        out.push_str(&thread_id.to_string());
    }

    if !target.flags.is_empty() {
        out.push(FLAGS_SEPARATOR);
        out.extend(target.flags.iter().map(Flag::as_char));
    }

    out
}

/// Split `local@domain` at the last `@`, tolerating surrounding angle brackets.
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    let address = address.trim();
    let address = address
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(address);

    address.rsplit_once('@')
}

fn parse_chat_id(chat: &str) -> Result<i64, DecodeError> {
    let digits = chat.strip_prefix('-').unwrap_or(chat);
    if !is_digits(digits) {
        return Err(DecodeError::InvalidChatId(chat.to_owned()));
    }

    chat.parse::<i64>()
        .map_err(|_| DecodeError::InvalidChatId(chat.to_owned()))
}

// `str::parse` accepts a leading `+`, the grammar does not.
fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
