//! Turns one received message into one Telegram send per recipient and
//! folds the results into the SMTP reply.
//!
//! A message passes through [`Stage::Received`], [`Stage::Resolving`],
//! [`Stage::Delivering`], [`Stage::Responding`] and [`Stage::Done`]. Failures
//! while resolving or delivering are recorded against the recipient they
//! belong to and never stop processing of the other recipients.

use std::{fmt, time::Duration};

use log::{debug, info, warn};

use crate::{
    address::{self, RoutingTarget},
    config::Config,
    delivery::{DeliveryClient, DeliveryOutcome, DeliveryStatus},
    domain::validate_domain,
    message::translate,
    smtp::SmtpResponse,
    telegram::{SendMessage, TelegramApi},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Resolving,
    Delivering,
    Responding,
    Done,
}

/// What the SMTP side hands over once DATA is complete.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// One message bound to one resolved recipient.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub target: RoutingTarget,
}

#[derive(Debug, Clone)]
pub struct RelayReport {
    pub outcomes: Vec<(String, DeliveryOutcome)>,
    pub reply: SmtpResponse,
}

impl RelayReport {
    fn new(outcomes: Vec<(String, DeliveryOutcome)>) -> Self {
        let reply = aggregate(&outcomes);
        Self { outcomes, reply }
    }

    pub fn outcome(&self, recipient: &str) -> Option<&DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(rcpt, _)| rcpt == recipient)
            .map(|(_, outcome)| outcome)
    }
}

pub struct Relay<A = TelegramApi> {
    domain: String,
    max_text_length: usize,
    client: DeliveryClient<A>,
}

impl<A> fmt::Debug for Relay<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("domain", &self.domain)
            .field("max_text_length", &self.max_text_length)
            .finish_non_exhaustive()
    }
}

impl Relay<TelegramApi> {
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let api = TelegramApi::new(
            &config.api_url,
            &config.bot_token,
            Duration::from_secs(config.request_timeout_secs),
        )?;

        Ok(Self::new(
            &config.domain,
            config.max_text_length,
            DeliveryClient::new(api, config.retry),
        ))
    }
}

impl<A: SendMessage> Relay<A> {
    pub fn new(domain: &str, max_text_length: usize, client: DeliveryClient<A>) -> Self {
        Self {
            domain: domain.to_owned(),
            max_text_length,
            client,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Domain check, then local-part decoding. Used at RCPT time and again for every
    /// recipient of a completed message.
    pub fn resolve(&self, recipient: &str) -> Result<RoutingTarget, DeliveryOutcome> {
        let Some((local_part, domain)) = address::split_address(recipient) else {
            return Err(DeliveryOutcome::rejected_address(
                "address must be of the form <chat_id>@<domain>",
            ));
        };

        if !validate_domain(domain, &self.domain) {
            return Err(DeliveryOutcome::rejected_domain(format!(
                "domain '{domain}' is not served here"
            )));
        }

        address::decode(local_part)
            .map_err(|err| DeliveryOutcome::rejected_address(err.to_string()))
    }

    pub fn process(&self, message: &InboundMessage) -> RelayReport {
        let mut stage = Stage::Received;
        debug!(
            "[smtp2tg] {stage:?}: message from <{}> for {} recipient(s)",
            message.sender,
            message.recipients.len()
        );

        stage = Stage::Resolving;
        debug!("[smtp2tg] {stage:?}");
        let mut outcomes: Vec<(String, Option<DeliveryOutcome>)> = Vec::new();
        let mut requests = Vec::new();
        for recipient in &message.recipients {
            match self.resolve(recipient) {
                Ok(target) => {
                    requests.push((
                        outcomes.len(),
                        RelayRequest {
                            sender: message.sender.clone(),
                            subject: message.subject.clone(),
                            body: message.body.clone(),
                            target,
                        },
                    ));
                    outcomes.push((recipient.clone(), None));
                }
                Err(outcome) => {
                    warn!("[smtp2tg] Rejecting <{recipient}>: {outcome}");
                    outcomes.push((recipient.clone(), Some(outcome)));
                }
            }
        }

        stage = Stage::Delivering;
        debug!("[smtp2tg] {stage:?}: {} request(s)", requests.len());
        for (index, request) in requests {
            outcomes[index].1 = Some(self.deliver(request));
        }

        stage = Stage::Responding;
        let report = RelayReport::new(
            outcomes
                .into_iter()
                .filter_map(|(rcpt, outcome)| outcome.map(|outcome| (rcpt, outcome)))
                .collect(),
        );
        debug!("[smtp2tg] {stage:?}: {}", report.reply.code);

        stage = Stage::Done;
        debug!("[smtp2tg] {stage:?}");
        report
    }

    fn deliver(&self, request: RelayRequest) -> DeliveryOutcome {
        let text = match translate(
            &request.sender,
            &request.subject,
            &request.body,
            self.max_text_length,
        ) {
            Ok(text) => text,
            Err(err) => return DeliveryOutcome::permanent_failure(err.to_string()),
        };

        let outcome = self.client.send(&request.target, &text);
        info!("[smtp2tg] {} -> {}", request.target, outcome.status.as_str());
        outcome
    }
}

/// Reply for a recipient refused at RCPT time.
pub fn rejection_reply(recipient: &str, outcome: &DeliveryOutcome) -> SmtpResponse {
    let (code, enhanced) = match outcome.status {
        DeliveryStatus::RejectedDomain => (550, "5.1.2"),
        DeliveryStatus::TransientFailure => (451, "4.4.1"),
        _ => (553, "5.1.3"),
    };
    SmtpResponse::new(code, format!("{enhanced} <{recipient}>: {}", outcome.detail))
}

/// Fold per-recipient outcomes into the single reply SMTP allows after DATA.
///
/// Any transient failure defers the whole message (451). Otherwise the message
/// is accepted (250) as soon as one recipient got it. Recipients that failed
/// permanently next to a delivered one are only listed in that 250 reply and
/// the sender will not bounce them, so they are logged here.
fn aggregate(outcomes: &[(String, DeliveryOutcome)]) -> SmtpResponse {
    let describe = |filter: fn(&DeliveryOutcome) -> bool| -> Vec<String> {
        outcomes
            .iter()
            .filter(|(_, outcome)| filter(outcome))
            .map(|(rcpt, outcome)| format!("<{rcpt}> {outcome}"))
            .collect()
    };

    let deferred = describe(DeliveryOutcome::is_transient);
    if !deferred.is_empty() {
        return SmtpResponse::new(
            451,
            format!(
                "4.4.1 Delivery deferred, try again later\n{}",
                deferred.join("\n")
            ),
        );
    }

    let failed = describe(|outcome| !outcome.is_delivered());
    if !outcomes.iter().any(|(_, outcome)| outcome.is_delivered()) {
        let detail = if failed.is_empty() {
            "no recipients".to_owned()
        } else {
            failed.join("\n")
        };
        return SmtpResponse::new(554, format!("5.0.0 Delivery failed\n{detail}"));
    }

    if failed.is_empty() {
        SmtpResponse::new(250, "2.0.0 Message accepted for delivery")
    } else {
        for line in &failed {
            warn!("[smtp2tg] Accepted message not delivered to {line}");
        }
        SmtpResponse::new(
            250,
            format!(
                "2.0.0 Message accepted, some recipients failed\n{}",
                failed.join("\n")
            ),
        )
    }
}
