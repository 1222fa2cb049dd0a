//! Mail content extraction and the Telegram text template.

use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use thiserror::Error;

/// Appended when the body had to be cut to fit the transport limit.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Telegram rejects `sendMessage` texts longer than this many characters.
pub const TELEGRAM_MAX_TEXT_LENGTH: usize = 4096;

const NO_SUBJECT: &str = "[No Subject]";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("message header is {length} characters, limit is {max}")]
    HeaderTooLong { length: usize, max: usize },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),

    #[error("missing required header: From")]
    MissingFrom,
}

/// The parts of a received message that are forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailContent {
    pub from: String,
    pub subject: String,
    pub body: String,
}

impl MailContent {
    /// Parse raw DATA. Only the first readable text part is kept; attachments are ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let mail = mailparse::parse_mail(raw)?;

        let from = mail
            .headers
            .get_first_value("From")
            .filter(|from| !from.trim().is_empty())
            .ok_or(ParseError::MissingFrom)?;

        let subject = mail.headers.get_first_value("Subject").unwrap_or_default();

        let body = match find_part(&mail, "text/plain") {
            Some(part) => part.get_body()?,
            None => match find_part(&mail, "text/html") {
                Some(part) => html_to_text(&part.get_body()?),
                None => String::new(),
            },
        };

        Ok(Self {
            from: from.trim().to_owned(),
            subject: subject.trim().to_owned(),
            body: body.replace("\r\n", "\n").trim_end().to_owned(),
        })
    }
}

fn find_part<'a>(mail: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if mail.subparts.is_empty() {
        let is_attachment =
            mail.get_content_disposition().disposition == DispositionType::Attachment;
        return (mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) && !is_attachment)
            .then_some(mail);
    }

    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}

/// Strip markup from an HTML body, keeping line structure of block elements.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;
    let mut skip_until: Option<&'static str> = None;

    let mut chars = html.chars().peekable();
    while let Some(c) = chars.next() {
        if in_tag {
            if c == '>' {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|ch: char| ch.is_whitespace() || ch == '/')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let closing = tag.starts_with('/');

                match skip_until {
                    Some(end) if closing && name == end => skip_until = None,
                    Some(_) => {}
                    None => match name.as_str() {
                        "script" if !closing => skip_until = Some("script"),
                        "style" if !closing => skip_until = Some("style"),
                        "br" => out.push('\n'),
                        "p" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
                            if closing =>
                        {
                            out.push('\n')
                        }
                        _ => {}
                    },
                }
                tag.clear();
            } else {
                tag.push(c);
            }
        } else if c == '<'
            && chars
                .peek()
                .is_some_and(|&next| next.is_ascii_alphabetic() || next == '/' || next == '!')
        {
            in_tag = true;
        } else if skip_until.is_none() {
            out.push(c);
        }
    }

    let text = unescape_entities(&out);
    let mut lines: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() && lines.last().is_some_and(|last| last.is_empty()) {
            continue;
        }
        lines.push(line);
    }

    lines.join("\n").trim().to_owned()
}

fn unescape_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Render the text sent to Telegram.
///
/// The header (`From:` and `Subject:` lines) is always sent whole. When the rendered
/// text is longer than `max_len` characters, the body is cut and [`TRUNCATION_MARKER`]
/// appended, or cut bare when the marker itself would not fit after the header.
/// Only a header longer than `max_len` makes the message unsendable.
pub fn translate(
    sender: &str,
    subject: &str,
    body: &str,
    max_len: usize,
) -> Result<String, TranslateError> {
    let subject = if subject.trim().is_empty() {
        NO_SUBJECT
    } else {
        subject
    };

    let header = format!("From: {sender}\nSubject: {subject}");
    let text = if body.trim().is_empty() {
        header.clone()
    } else {
        format!("{header}\n\n{body}")
    };

    let length = text.chars().count();
    if length <= max_len {
        return Ok(text);
    }

    let header_len = header.chars().count();
    if header_len > max_len {
        return Err(TranslateError::HeaderTooLong {
            length: header_len,
            max: max_len,
        });
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if header_len + marker_len > max_len {
        // no room for the marker, cut the body bare
        return Ok(text.chars().take(max_len).collect());
    }

    let mut truncated: String = text.chars().take(max_len - marker_len).collect();
    truncated.push_str(TRUNCATION_MARKER);
    Ok(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_template() {
        let text = translate("cron@host", "Alert", "disk full", 4096).unwrap();
        assert_eq!(text, "From: cron@host\nSubject: Alert\n\ndisk full");
    }

    #[test]
    fn test_translate_empty_parts() {
        assert_eq!(
            translate("a@b", "", "", 4096).unwrap(),
            "From: a@b\nSubject: [No Subject]"
        );
        assert_eq!(
            translate("a@b", "Hi", "  \n", 4096).unwrap(),
            "From: a@b\nSubject: Hi"
        );
    }

    #[test]
    fn test_translate_truncates_body() {
        let body = "x".repeat(200);
        let text = translate("a@b", "S", &body, 60).unwrap();
        assert_eq!(text.chars().count(), 60);
        assert!(text.starts_with("From: a@b\nSubject: S\n\nxxx"));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_translate_counts_characters_not_bytes() {
        let body = "ж".repeat(40);
        let text = translate("a@b", "S", &body, 62).unwrap();
        // header, blank line and 40 body characters fit exactly
        assert_eq!(text.chars().count(), 62);
        assert!(!text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_translate_header_too_long() {
        let subject = "s".repeat(100);
        let err = translate("a@b", &subject, "body", 50).unwrap_err();
        assert!(matches!(err, TranslateError::HeaderTooLong { max: 50, .. }));
    }

    #[test]
    fn test_translate_header_fits_without_marker() {
        let subject = "s".repeat(75);
        // 94 character header, 6 characters left: too few for the marker
        let text = translate("a@b", &subject, "some body text", 100).unwrap();
        assert_eq!(text.chars().count(), 100);
        assert!(text.starts_with(&format!("From: a@b\nSubject: {subject}\n\nsome")));
        assert!(!text.ends_with(TRUNCATION_MARKER));

        let exact = translate("a@b", &subject, "body", 94).unwrap();
        assert_eq!(exact, format!("From: a@b\nSubject: {subject}"));
    }

    #[test]
    fn test_parse_plain() {
        let raw = b"From: Cron <cron@host>\r\nTo: 1@example.com\r\nSubject: Backup\r\n\r\nAll good\r\n\r\n";
        let content = MailContent::parse(raw).unwrap();
        assert_eq!(content.from, "Cron <cron@host>");
        assert_eq!(content.subject, "Backup");
        assert_eq!(content.body, "All good");
    }

    #[test]
    fn test_parse_encoded_subject() {
        let raw = b"From: a@b\r\nSubject: =?UTF-8?B?0KLQtdC80LA=?=\r\n\r\nbody\r\n";
        let content = MailContent::parse(raw).unwrap();
        assert_eq!(content.subject, "Тема");
    }

    #[test]
    fn test_parse_missing_from() {
        let raw = b"Subject: x\r\n\r\nbody\r\n";
        assert!(matches!(
            MailContent::parse(raw),
            Err(ParseError::MissingFrom)
        ));
    }

    #[test]
    fn test_parse_multipart_prefers_plain() {
        let raw = concat!(
            "From: a@b\r\n",
            "Subject: Mixed\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"XX\"\r\n",
            "\r\n",
            "--XX\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<b>HTML</b>\r\n",
            "--XX\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Plain text\r\n",
            "--XX--\r\n",
        );
        let content = MailContent::parse(raw.as_bytes()).unwrap();
        assert_eq!(content.body, "Plain text");
    }

    #[test]
    fn test_parse_html_only_and_attachment() {
        let raw = concat!(
            "From: a@b\r\n",
            "Subject: Report\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"XX\"\r\n",
            "\r\n",
            "--XX\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"log.txt\"\r\n",
            "\r\n",
            "attached log\r\n",
            "--XX\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<div>aaaa</div><div>a &amp; b</div>\r\n",
            "--XX--\r\n",
        );
        let content = MailContent::parse(raw.as_bytes()).unwrap();
        assert_eq!(content.body, "aaaa\na & b");
    }

    #[test]
    fn test_html_to_text() {
        assert_eq!(html_to_text("<b>bold</b> text"), "bold text");
        assert_eq!(html_to_text("line<br>next<br/>last"), "line\nnext\nlast");
        assert_eq!(
            html_to_text("<style>p { color: red }</style><p>one</p><p>two</p>"),
            "one\ntwo"
        );
        assert_eq!(html_to_text("&lt;tag&gt;"), "<tag>");
        assert_eq!(html_to_text("<p>a < b and c > d</p>"), "a < b and c > d");
        assert_eq!(html_to_text("x<!-- note -->y"), "xy");
    }
}
