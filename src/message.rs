//! Raw HTTP message parsing.
//!
//! Turns captured request/response text into structured records. Input is
//! newline delimited (`\r\n` or bare `\n`): the first line is the start line,
//! the header block ends at the first blank line, and whatever follows is the
//! body, rejoined with `\r\n`.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Header mapping with lower-cased keys.
pub type Headers = BTreeMap<String, String>;

/// Protocol assumed when a request line carries no third token.
pub const DEFAULT_PROTOCOL: &str = "HTTP/1.1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty input")]
    EmptyInput,
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),
    #[error("missing required fields")]
    MissingRequiredFields,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub uri: String,
    pub protocol: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub protocol: String,
    pub status_code: String,
    pub status_message: String,
}

/// A parsed request. `uri` is kept exactly as written, never decoded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub protocol_version: String,
    pub status_code: String,
    pub status_message: String,
    pub headers: Headers,
    pub body: String,
}

/// Parse a request line such as `GET /index.html HTTP/1.1`.
///
/// - tokens are separated by runs of whitespace
/// - fewer than two tokens is a [`ParseError::MalformedStartLine`]
/// - the method is upper-cased, the protocol defaults to `HTTP/1.1`
pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let mut tokens = line.split_whitespace();
    let (Some(method), Some(uri)) = (tokens.next(), tokens.next()) else {
        return Err(ParseError::MalformedStartLine(line.to_string()));
    };
    Ok(RequestLine {
        method: method.to_ascii_uppercase(),
        uri: uri.to_string(),
        protocol: tokens.next().unwrap_or(DEFAULT_PROTOCOL).to_string(),
    })
}

/// Parse a status line `<protocol> <3-digit code> <message>`.
///
/// The reason phrase may be empty, but the separator after the code must be
/// present: `HTTP/1.1 200 ` is accepted, `HTTP/1.1 200` is not.
pub fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    let caps = status_line_pattern()
        .captures(line)
        .ok_or_else(|| ParseError::MalformedStatusLine(line.to_string()))?;
    Ok(StatusLine {
        protocol: caps[1].to_string(),
        status_code: caps[2].to_string(),
        status_message: caps[3].to_string(),
    })
}

/// Parse header lines into a mapping.
///
/// Lines without a colon are skipped. Each line is split on its first colon
/// only, so values like `a:b:c` or URLs survive intact. Later duplicates win.
pub fn parse_headers<'a, I>(lines: I) -> Headers
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    headers
}

pub fn parse_http_request(raw: &str) -> Result<ParsedRequest, ParseError> {
    let (start, header_lines, body) = split_message(raw)?;
    let line = parse_request_line(start)?;
    if line.method.is_empty() || line.uri.is_empty() {
        return Err(ParseError::MissingRequiredFields);
    }
    Ok(ParsedRequest {
        method: line.method,
        uri: line.uri,
        protocol: line.protocol,
        headers: parse_headers(header_lines),
        body,
    })
}

pub fn parse_http_response(raw: &str) -> Result<ParsedResponse, ParseError> {
    let (start, header_lines, body) = split_message(raw)?;
    let line = parse_status_line(start)?;
    if line.protocol.is_empty() || line.status_code.is_empty() {
        return Err(ParseError::MissingRequiredFields);
    }
    Ok(ParsedResponse {
        protocol_version: line.protocol,
        status_code: line.status_code,
        status_message: line.status_message,
        headers: parse_headers(header_lines),
        body,
    })
}

impl ParsedRequest {
    /// Render back into wire text with CRLF line endings.
    pub fn to_raw(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.protocol);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

/// Split raw text into (start line, header lines, body).
fn split_message(raw: &str) -> Result<(&str, Vec<&str>, String), ParseError> {
    if raw.is_empty() {
        return Err(ParseError::EmptyInput);
    }
    let mut lines = raw.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let start = lines.next().ok_or(ParseError::EmptyInput)?;

    let mut headers = Vec::new();
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
        headers.push(line);
    }
    let body = lines.collect::<Vec<_>>().join("\r\n");
    Ok((start, headers, body))
}

fn status_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\S+)\s+(\d{3})\s(.*)$").expect("status line pattern is valid")
    })
}
