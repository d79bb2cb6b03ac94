use crate::domain_utils::DomainUtils;
use crate::error::{TrustError, TrustResult};
use base64::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// A single attachment as seen by the verifiers. Content is kept
/// base64-encoded exactly as it appeared in the MIME part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: usize,
    pub base64_content: Option<String>,
}

/// Header map with case-insensitive keys. Repeated headers keep every
/// occurrence in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    entries: HashMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.trim().to_lowercase())
            .or_default()
            .push(value.into());
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

}

/// Immutable snapshot of everything the verifiers may inspect about one
/// message. Build it with [`VerificationContext::builder`] or
/// [`VerificationContext::from_raw_email`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationContext {
    message_id: String,
    thread_id: String,
    sender_address: String,
    sender_domain: String,
    headers: Headers,
    body: String,
    urls: Vec<String>,
    attachments: Vec<AttachmentDescriptor>,
}

impl VerificationContext {
    pub fn builder(message_id: impl Into<String>, thread_id: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            message_id: message_id.into(),
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn sender_address(&self) -> &str {
        &self.sender_address
    }

    pub fn sender_domain(&self) -> &str {
        &self.sender_domain
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn attachments(&self) -> &[AttachmentDescriptor] {
        &self.attachments
    }

    /// Subject header plus body, the text the content verifiers scan
    pub fn searchable_text(&self) -> String {
        match self.headers.get("subject") {
            Some(subject) => format!("{subject}\n{}", self.body),
            None => self.body.clone(),
        }
    }

    /// Parse an RFC 5322 message as it sits on disk (`.eml`).
    ///
    /// The sender is taken from `Return-Path`, falling back to `From`.
    /// Single-part and multipart bodies are supported; text parts are
    /// concatenated and non-text parts with a filename become attachments.
    pub fn from_raw_email(
        message_id: impl Into<String>,
        thread_id: impl Into<String>,
        raw: &str,
    ) -> TrustResult<Self> {
        let (headers, body) = split_headers(raw);

        let sender = headers
            .get("return-path")
            .and_then(DomainUtils::extract_email_from_header)
            .or_else(|| {
                headers
                    .get("from")
                    .and_then(DomainUtils::extract_email_from_header)
            })
            .ok_or_else(|| TrustError::invalid_context("message has no usable sender address"))?;

        let content_type = headers.get("content-type").unwrap_or("text/plain");
        let mut text = String::new();
        let mut attachments = Vec::new();

        match multipart_boundary(content_type) {
            Some(boundary) => collect_multipart(body, &boundary, 0, &mut text, &mut attachments),
            None => collect_part(&headers, body, 0, &mut text, &mut attachments),
        }

        let mut builder = Self::builder(message_id, thread_id)
            .sender(sender)
            .headers(headers)
            .body(text);
        for attachment in attachments {
            builder = builder.attachment(attachment);
        }
        builder.build()
    }
}

#[derive(Debug, Default)]
pub struct ContextBuilder {
    message_id: String,
    thread_id: String,
    sender_address: Option<String>,
    headers: Headers,
    body: String,
    urls: Vec<String>,
    attachments: Vec<AttachmentDescriptor>,
}

impl ContextBuilder {
    pub fn sender(mut self, address: impl Into<String>) -> Self {
        self.sender_address = Some(address.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn attachment(mut self, attachment: AttachmentDescriptor) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Validate and freeze. URLs found in the body are appended after any
    /// explicitly supplied ones; duplicates keep their first position.
    pub fn build(self) -> TrustResult<VerificationContext> {
        if self.message_id.trim().is_empty() {
            return Err(TrustError::invalid_context("message id is empty"));
        }
        if self.thread_id.trim().is_empty() {
            return Err(TrustError::invalid_context("thread id is empty"));
        }

        let sender_address = self
            .sender_address
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TrustError::invalid_context("sender address is missing"))?;
        let sender_domain = DomainUtils::extract_domain(&sender_address).ok_or_else(|| {
            TrustError::invalid_context(format!("sender address is malformed: {sender_address}"))
        })?;

        let mut urls: Vec<String> = Vec::new();
        for url in self.urls.into_iter().chain(extract_urls(&self.body)) {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        Ok(VerificationContext {
            message_id: self.message_id,
            thread_id: self.thread_id,
            sender_address,
            sender_domain,
            headers: self.headers,
            body: self.body,
            urls,
            attachments: self.attachments,
        })
    }
}

fn url_regex() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| {
        Regex::new(r#"(?i)\bhttps?://[^\s"'<>()\[\]]+"#).expect("static url regex")
    })
}

/// Absolute http(s) URLs in the order they appear, trailing punctuation
/// trimmed and anything `url` cannot parse dropped.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for m in url_regex().find_iter(text) {
        let candidate = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if url::Url::parse(candidate).is_ok() && !urls.iter().any(|u| u == candidate) {
            urls.push(candidate.to_string());
        }
    }
    urls
}

fn split_headers(raw: &str) -> (Headers, &str) {
    let mut headers = Headers::new();
    let mut current: Option<(String, String)> = None;
    let mut body_start = raw.len();
    let mut offset = 0;

    for line in raw.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        offset += line.len();

        if trimmed.is_empty() {
            body_start = offset;
            break;
        }

        if trimmed.starts_with(' ') || trimmed.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(trimmed.trim());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.insert(&name, value);
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            current = Some((name.to_string(), value.trim().to_string()));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(&name, value);
    }

    (headers, &raw[body_start.min(raw.len())..])
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    if !content_type.to_lowercase().starts_with("multipart/") {
        return None;
    }
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn split_multipart<'a>(body: &'a str, boundary: &str) -> Vec<&'a str> {
    let delimiter = format!("--{boundary}");
    body.split(delimiter.as_str())
        .skip(1)
        .take_while(|part| !part.starts_with("--"))
        .map(|part| part.trim_start_matches(['\r', '\n']))
        .collect()
}

fn header_param(value: &str, param: &str) -> Option<String> {
    value.split(';').find_map(|piece| {
        let (key, val) = piece.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(param)
            .then(|| val.trim().trim_matches('"').to_string())
    })
}

// Nested multiparts deeper than this are ignored
const MAX_MIME_DEPTH: usize = 8;

fn collect_multipart(
    body: &str,
    boundary: &str,
    depth: usize,
    text: &mut String,
    attachments: &mut Vec<AttachmentDescriptor>,
) {
    if depth >= MAX_MIME_DEPTH {
        log::debug!("MIME nesting deeper than {MAX_MIME_DEPTH}, skipping boundary {boundary}");
        return;
    }
    for part in split_multipart(body, boundary) {
        let (part_headers, part_body) = split_headers(part);
        collect_part(&part_headers, part_body, depth + 1, text, attachments);
    }
}

fn collect_part(
    headers: &Headers,
    body: &str,
    depth: usize,
    text: &mut String,
    attachments: &mut Vec<AttachmentDescriptor>,
) {
    let content_type = headers.get("content-type").unwrap_or("text/plain");
    if let Some(boundary) = multipart_boundary(content_type) {
        collect_multipart(body, &boundary, depth, text, attachments);
        return;
    }

    let encoding = headers
        .get("content-transfer-encoding")
        .unwrap_or("7bit")
        .to_lowercase();
    let filename = headers
        .get("content-disposition")
        .and_then(|d| header_param(d, "filename"))
        .or_else(|| header_param(content_type, "name"));

    if let Some(filename) = filename {
        let compact: String = body.split_whitespace().collect();
        let size_bytes = if encoding == "base64" {
            compact.len() / 4 * 3
        } else {
            body.len()
        };
        attachments.push(AttachmentDescriptor {
            filename,
            content_type: content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_lowercase(),
            size_bytes,
            base64_content: (encoding == "base64").then_some(compact),
        });
        return;
    }

    if !content_type.to_lowercase().starts_with("text/") {
        return;
    }

    let decoded = match encoding.as_str() {
        "base64" => {
            let compact: String = body.split_whitespace().collect();
            match BASE64_STANDARD.decode(compact) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    log::debug!("Could not decode base64 text part: {e}");
                    body.to_string()
                }
            }
        }
        "quoted-printable" => {
            match quoted_printable::decode(body.as_bytes(), quoted_printable::ParseMode::Robust) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    log::debug!("Could not decode quoted-printable text part: {e}");
                    body.to_string()
                }
            }
        }
        _ => body.to_string(),
    };

    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(decoded.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates_fields() {
        let err = VerificationContext::builder("", "t1")
            .sender("a@example.com")
            .build()
            .unwrap_err();
        assert!(matches!(err, TrustError::InvalidContext { .. }));

        let err = VerificationContext::builder("m1", "t1").build().unwrap_err();
        assert!(matches!(err, TrustError::InvalidContext { .. }));

        let err = VerificationContext::builder("m1", "t1")
            .sender("not-an-address")
            .build()
            .unwrap_err();
        assert!(matches!(err, TrustError::InvalidContext { .. }));
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let ctx = VerificationContext::builder("m1", "t1")
            .sender("Alice@Example.com")
            .header("Authentication-Results", "mx.example.net; spf=pass")
            .build()
            .unwrap();

        assert_eq!(ctx.sender_address(), "alice@example.com");
        assert_eq!(ctx.sender_domain(), "example.com");
        assert_eq!(
            ctx.headers().get("authentication-RESULTS"),
            Some("mx.example.net; spf=pass")
        );
        assert!(ctx.headers().get("dkim-signature").is_none());
    }

    #[test]
    fn test_urls_are_extracted_in_order_without_duplicates() {
        let ctx = VerificationContext::builder("m1", "t1")
            .sender("a@example.com")
            .url("https://first.example.org/a")
            .body("See https://second.example.net/x, then https://first.example.org/a.")
            .build()
            .unwrap();

        assert_eq!(
            ctx.urls(),
            &[
                "https://first.example.org/a".to_string(),
                "https://second.example.net/x".to_string()
            ]
        );
    }

    #[test]
    fn test_from_raw_email_single_part() {
        let raw = "Return-Path: <bounce@mailer.example.com>\r\n\
                   From: \"Promo\" <promo@example.com>\r\n\
                   Subject: Hello\r\n\
                   Authentication-Results: mx.test;\r\n\tspf=pass smtp.mailfrom=example.com\r\n\
                   \r\n\
                   Visit https://example.com/offer today\r\n";

        let ctx = VerificationContext::from_raw_email("m1", "t1", raw).unwrap();
        assert_eq!(ctx.sender_address(), "bounce@mailer.example.com");
        assert_eq!(ctx.sender_domain(), "mailer.example.com");
        assert_eq!(
            ctx.headers().get("authentication-results"),
            Some("mx.test; spf=pass smtp.mailfrom=example.com")
        );
        assert_eq!(ctx.urls(), &["https://example.com/offer".to_string()]);
        assert!(ctx.searchable_text().starts_with("Hello\n"));
    }

    #[test]
    fn test_from_raw_email_multipart_with_attachment() {
        let encoded = BASE64_STANDARD.encode("Please pay the invoice today");
        let raw = format!(
            "From: billing@example.com\n\
             Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
             \n\
             --XYZ\n\
             Content-Type: text/plain; charset=utf-8\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             {encoded}\n\
             --XYZ\n\
             Content-Type: application/zip; name=\"invoice.zip\"\n\
             Content-Disposition: attachment; filename=\"invoice.zip\"\n\
             Content-Transfer-Encoding: base64\n\
             \n\
             UEsDBAoAAAAAAA==\n\
             --XYZ--\n"
        );

        let ctx = VerificationContext::from_raw_email("m2", "t2", &raw).unwrap();
        assert_eq!(ctx.body(), "Please pay the invoice today");
        assert_eq!(ctx.attachments().len(), 1);
        assert_eq!(ctx.attachments()[0].filename, "invoice.zip");
        assert_eq!(ctx.attachments()[0].content_type, "application/zip");
        assert!(ctx.attachments()[0].base64_content.is_some());
    }

    #[test]
    fn test_from_raw_email_nested_multipart() {
        let raw = "From: Booker <booker@stage.example>\n\
                   Content-Type: multipart/mixed; boundary=\"outer\"\n\
                   \n\
                   --outer\n\
                   Content-Type: multipart/alternative; boundary=\"inner\"\n\
                   \n\
                   --inner\n\
                   Content-Type: text/plain; charset=utf-8\n\
                   \n\
                   Pay the booking fee at https://evil.example/pay\n\
                   --inner\n\
                   Content-Type: text/html; charset=utf-8\n\
                   \n\
                   <p>Pay the booking fee</p>\n\
                   --inner--\n\
                   --outer\n\
                   Content-Type: application/pdf; name=\"rider.pdf\"\n\
                   Content-Transfer-Encoding: base64\n\
                   \n\
                   JVBERi0=\n\
                   --outer--\n";

        let ctx = VerificationContext::from_raw_email("m4", "t4", raw).unwrap();
        assert!(ctx
            .body()
            .starts_with("Pay the booking fee at https://evil.example/pay"));
        assert_eq!(ctx.urls(), &["https://evil.example/pay".to_string()]);
        assert_eq!(ctx.attachments().len(), 1);
        assert_eq!(ctx.attachments()[0].filename, "rider.pdf");
    }

    #[test]
    fn test_from_raw_email_quoted_printable_body() {
        let raw = "From: agent@stage.example\n\
                   Content-Type: text/plain; charset=utf-8\n\
                   Content-Transfer-Encoding: quoted-printable\n\
                   \n\
                   There is a small booking =\n\
                   fee of $50. Link: https://stage.example/?a=3Db\n";

        let ctx = VerificationContext::from_raw_email("m5", "t5", raw).unwrap();
        assert!(ctx.body().contains("small booking fee of $50"));
        assert_eq!(ctx.urls(), &["https://stage.example/?a=b".to_string()]);
    }

    #[test]
    fn test_from_raw_email_without_sender_is_invalid() {
        let raw = "Subject: orphan\n\nbody\n";
        let err = VerificationContext::from_raw_email("m3", "t3", raw).unwrap_err();
        assert!(matches!(err, TrustError::InvalidContext { .. }));
    }
}
