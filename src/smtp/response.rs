//! SMTP replies

/// A reply line (or multiline reply) sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
    /// Extra lines of a multiline reply, e.g. EHLO capabilities
    pub lines: Vec<String>,
}

impl SmtpResponse {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            lines: Vec::new(),
        }
    }

    pub fn multiline(code: u16, message: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            code,
            message: message.into(),
            lines,
        }
    }

    pub fn ok() -> Self {
        Self::new(250, "2.0.0 OK")
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{hostname} ESMTP smtp2tg ready"))
    }

    pub fn helo(hostname: &str, client_domain: &str) -> Self {
        Self::new(250, format!("{hostname} Hello {client_domain}"))
    }

    pub fn ehlo(hostname: &str, client_domain: &str, max_message_size: usize) -> Self {
        Self::multiline(
            250,
            format!("{hostname} Hello {client_domain}"),
            vec![
                "8BITMIME".to_owned(),
                "ENHANCEDSTATUSCODES".to_owned(),
                "PIPELINING".to_owned(),
                format!("SIZE {max_message_size}"),
            ],
        )
    }

    pub fn data_start() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn quit(hostname: &str) -> Self {
        Self::new(221, format!("2.0.0 {hostname} closing connection"))
    }

    /// Wire form. Embedded line breaks in the message become separate reply lines.
    pub fn format(&self) -> String {
        let all: Vec<&str> = self
            .message
            .lines()
            .chain(self.lines.iter().map(String::as_str))
            .collect();

        if all.is_empty() {
            return format!("{}\r\n", self.code);
        }

        let mut out = String::new();
        for (i, line) in all.iter().enumerate() {
            let sep = if i + 1 == all.len() { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }
}
