//! SMTP session state machine.
//!
//! The session consumes one input line at a time and produces the reply to
//! send back. Socket handling lives in [`super::server`].

use log::{debug, info, warn};

use super::{
    error::{SmtpError, SmtpLimits},
    response::SmtpResponse,
};
use crate::{
    message::{MailContent, ParseError},
    relay::{InboundMessage, Relay, rejection_reply},
    telegram::SendMessage,
};

/// Per-listener session parameters.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Waiting for HELO/EHLO
    Initial,
    /// Ready for MAIL
    Greeted,
    /// MAIL accepted, waiting for RCPT
    MailReceived,
    /// At least one RCPT accepted
    RecipientsReceived,
    /// Collecting message content
    Data,
}

/// What the connection loop should do after a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Reply(SmtpResponse),
    /// Reply, then close the connection.
    Close(SmtpResponse),
    /// More DATA expected, nothing to send.
    Continue,
}

pub struct SmtpSession<'a, A> {
    relay: &'a Relay<A>,
    settings: &'a SessionSettings,
    pub state: SmtpState,
    pub client_domain: Option<String>,
    /// Envelope sender; empty for the null reverse-path
    pub from: Option<String>,
    pub to: Vec<String>,
    data: Vec<u8>,
    data_overflow: bool,
}

impl<'a, A: SendMessage> SmtpSession<'a, A> {
    pub fn new(relay: &'a Relay<A>, settings: &'a SessionSettings) -> Self {
        Self {
            relay,
            settings,
            state: SmtpState::Initial,
            client_domain: None,
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            data_overflow: false,
        }
    }

    pub fn greeting(&self) -> SmtpResponse {
        SmtpResponse::greeting(&self.settings.hostname)
    }

    /// Clear the mail transaction; HELO state is kept.
    pub fn reset(&mut self) {
        if self.state != SmtpState::Initial {
            self.state = SmtpState::Greeted;
        }
        self.from = None;
        self.to.clear();
        self.data.clear();
        self.data_overflow = false;
    }

    /// Longest line, terminator included, the connection should read in the current state.
    pub fn line_limit(&self) -> usize {
        if self.state == SmtpState::Data {
            self.settings.max_message_size + 2
        } else {
            SmtpLimits::COMMAND_LINE_MAX_LENGTH
        }
    }

    /// A line reached [`Self::line_limit`] without a terminator. The caller
    /// discards the rest of it.
    pub fn handle_overlong_line(&mut self) -> Step {
        if self.state == SmtpState::Data {
            self.data_overflow = true;
            self.data.clear();
            return Step::Continue;
        }

        let err = SmtpError::LineTooLong {
            max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
        };
        warn!("[smtp2tg] {err}");
        Step::Reply(err.to_response())
    }

    /// Feed one line as read from the wire, line terminator included or not.
    pub fn handle_line(&mut self, line: &[u8]) -> Step {
        if self.state == SmtpState::Data {
            return self.handle_data_line(line);
        }

        let command = String::from_utf8_lossy(line);
        let command = command.trim_end_matches(['\r', '\n']);
        debug!("[smtp2tg] SMTP command: {command}");

        match self.process_command(command) {
            Ok(step) => step,
            Err(err) => {
                warn!("[smtp2tg] {err}");
                Step::Reply(err.to_response())
            }
        }
    }

    fn process_command(&mut self, command_line: &str) -> Result<Step, SmtpError> {
        if command_line.len() + 2 > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let (verb, args) = match command_line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (command_line, ""),
        };

        let reply = match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.handle_helo(args, false)?,
            "EHLO" => self.handle_helo(args, true)?,
            "MAIL" => self.handle_mail(args)?,
            "RCPT" => self.handle_rcpt(args)?,
            "DATA" => self.handle_data(args)?,
            "RSET" => {
                self.reset();
                SmtpResponse::ok()
            }
            "NOOP" => SmtpResponse::ok(),
            "VRFY" => SmtpResponse::new(252, "2.5.2 Cannot VRFY user, but will accept message"),
            "QUIT" => return Ok(Step::Close(SmtpResponse::quit(&self.settings.hostname))),
            _ => return Err(SmtpError::InvalidCommand),
        };

        Ok(Step::Reply(reply))
    }

    fn handle_helo(&mut self, args: &str, extended: bool) -> Result<SmtpResponse, SmtpError> {
        let client_domain = args.split_whitespace().next().ok_or_else(|| {
            SmtpError::InvalidSyntax("HELO/EHLO requires domain argument".to_owned())
        })?;

        // a new greeting aborts any transaction in progress
        self.reset();
        self.state = SmtpState::Greeted;
        self.client_domain = Some(client_domain.to_owned());

        Ok(if extended {
            SmtpResponse::ehlo(
                &self.settings.hostname,
                client_domain,
                self.settings.max_message_size,
            )
        } else {
            SmtpResponse::helo(&self.settings.hostname, client_domain)
        })
    }

    fn handle_mail(&mut self, args: &str) -> Result<SmtpResponse, SmtpError> {
        match self.state {
            SmtpState::Initial => return Err(SmtpError::InvalidState("send HELO/EHLO first")),
            SmtpState::Greeted => {}
            _ => return Err(SmtpError::InvalidState("nested MAIL command")),
        }

        let (address, params) = parse_path(args, "FROM:")?;

        for param in params.split_whitespace() {
            if let Some(size) = param
                .split_once('=')
                .filter(|(key, _)| key.eq_ignore_ascii_case("SIZE"))
                .and_then(|(_, value)| value.parse::<usize>().ok())
            {
                if size > self.settings.max_message_size {
                    return Err(SmtpError::MessageTooLarge {
                        max: self.settings.max_message_size,
                    });
                }
            }
        }

        self.from = Some(address.to_owned());
        self.state = SmtpState::MailReceived;
        Ok(SmtpResponse::new(250, "2.1.0 Sender OK"))
    }

    fn handle_rcpt(&mut self, args: &str) -> Result<SmtpResponse, SmtpError> {
        if !matches!(
            self.state,
            SmtpState::MailReceived | SmtpState::RecipientsReceived
        ) {
            return Err(SmtpError::InvalidState("send MAIL first"));
        }

        let (address, _) = parse_path(args, "TO:")?;
        if address.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_owned(),
            ));
        }

        if self.to.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        match self.relay.resolve(address) {
            Ok(target) => {
                debug!("[smtp2tg] Recipient <{address}> routes to {target}");
                self.to.push(address.to_owned());
                self.state = SmtpState::RecipientsReceived;
                Ok(SmtpResponse::new(250, "2.1.5 Recipient OK"))
            }
            Err(outcome) => {
                warn!("[smtp2tg] Rejecting recipient <{address}>: {outcome}");
                Ok(rejection_reply(address, &outcome))
            }
        }
    }

    fn handle_data(&mut self, args: &str) -> Result<SmtpResponse, SmtpError> {
        if !args.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_owned(),
            ));
        }

        match self.state {
            SmtpState::RecipientsReceived => {}
            SmtpState::MailReceived => {
                return Ok(SmtpResponse::new(554, "5.5.1 No valid recipients"));
            }
            _ => return Err(SmtpError::InvalidState("send MAIL and RCPT first")),
        }

        self.state = SmtpState::Data;
        self.data.clear();
        self.data_overflow = false;
        Ok(SmtpResponse::data_start())
    }

    fn handle_data_line(&mut self, line: &[u8]) -> Step {
        let content = line
            .strip_suffix(b"\n")
            .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
            .unwrap_or(line);

        if content == b"." {
            let reply = self.finish_data();
            self.reset();
            return Step::Reply(reply);
        }

        if self.data_overflow {
            return Step::Continue;
        }

        // dot-stuffing, RFC 5321 section 4.5.2
        let content = content.strip_prefix(b".").unwrap_or(content);
        if self.data.len() + content.len() + 2 > self.settings.max_message_size {
            self.data_overflow = true;
            self.data.clear();
            return Step::Continue;
        }

        self.data.extend_from_slice(content);
        self.data.extend_from_slice(b"\r\n");
        Step::Continue
    }

    fn finish_data(&mut self) -> SmtpResponse {
        if self.data_overflow {
            return SmtpError::MessageTooLarge {
                max: self.settings.max_message_size,
            }
            .to_response();
        }

        let content = match MailContent::parse(&self.data) {
            Ok(content) => content,
            Err(err @ ParseError::MissingFrom) => {
                return SmtpResponse::new(550, format!("5.6.0 {err}"));
            }
            Err(err) => return SmtpResponse::new(554, format!("5.6.0 {err}")),
        };

        let sender = match self.from.as_deref() {
            Some(from) if !from.is_empty() => from.to_owned(),
            _ => content.from.clone(),
        };

        info!(
            "[smtp2tg] Message from <{sender}> to {} recipient(s), subject: {}",
            self.to.len(),
            content.subject
        );

        let message = InboundMessage {
            sender,
            recipients: self.to.clone(),
            subject: content.subject,
            body: content.body,
        };

        self.relay.process(&message).reply
    }
}

/// Parse `FROM:<addr> params` / `TO:<addr> params`.
fn parse_path<'l>(args: &'l str, keyword: &str) -> Result<(&'l str, &'l str), SmtpError> {
    let invalid = || SmtpError::InvalidSyntax(format!("expected {keyword}<address>"));

    let prefix = args.get(..keyword.len()).ok_or_else(invalid)?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return Err(invalid());
    }

    let rest = args[keyword.len()..].trim_start();
    let rest = rest.strip_prefix('<').ok_or_else(invalid)?;
    let (address, params) = rest.split_once('>').ok_or_else(invalid)?;

    Ok((address.trim(), params.trim()))
}
