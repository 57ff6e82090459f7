// Copyright 2024 Hearth Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Incremental HTTP/1.1 request parser.
//!
//! A four-state machine over CRLF-delimited lines consumed from the
//! connection's read buffer in place: request line, headers, body, done.
//! POST bodies in `application/x-www-form-urlencoded` feed the form map, and
//! the two demo form targets route through user verification.

use std::collections::HashMap;

use log::{debug, error, warn};

use crate::buffer::ByteBuffer;
use crate::db::user;
use crate::http::{Method, Version};
use crate::server::ServerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Line,
    Headers,
    Content,
    Finish,
}

/// Result of feeding the parser whatever the read buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The request is fully parsed; a response can be built.
    Complete,
    /// More bytes are needed; unconsumed partial input stays in the buffer.
    Incomplete,
    /// The request line was malformed; answer 400.
    Malformed,
}

#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: Option<Method>,
    version: Option<Version>,
    path: String,
    query: String,
    body: String,
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::Line,
            method: None,
            version: None,
            path: String::new(),
            query: String::new(),
            body: String::new(),
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    /// Resets to the initial state for the next request on this connection.
    pub fn clear(&mut self) {
        self.state = ParseState::Line;
        self.method = None;
        self.version = None;
        self.path.clear();
        self.query.clear();
        self.body.clear();
        self.headers.clear();
        self.form.clear();
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline]
    pub fn method(&self) -> Option<Method> {
        self.method
    }

    #[inline]
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Keep-alive iff the client asked for it and speaks HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        self.headers
            .get("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            && self.version == Some(Version::H1_1)
    }

    /// True once the whole request (line, headers, body) has been consumed.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    /// Consumes complete lines from `buf`, then the body. A request line or
    /// header whose trailing CRLF has not arrived yet is left in the buffer
    /// untouched and reported as [`ParseStatus::Incomplete`]; parsing resumes
    /// from the same state on the next read. Only a malformed request line is
    /// an error.
    pub fn parse(&mut self, buf: &mut ByteBuffer, ctx: &ServerContext) -> ParseStatus {
        loop {
            match self.state {
                ParseState::Line => {
                    let Some(line) = take_line(buf) else {
                        return ParseStatus::Incomplete;
                    };
                    if !self.parse_request_line(&line, ctx) {
                        warn!("malformed request line: {line:?}");
                        return ParseStatus::Malformed;
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = take_line(buf) else {
                        return ParseStatus::Incomplete;
                    };
                    if !self.parse_header(&line) {
                        self.state = ParseState::Content;
                    }
                }
                ParseState::Content => {
                    let declared = self.content_length();
                    if buf.readable_len() < declared {
                        return ParseStatus::Incomplete;
                    }
                    let body = take_body(buf, declared);
                    self.parse_content(body, ctx);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => {
                    debug!(
                        "parsed [{}] [{}] [{}]",
                        self.method.map_or("-", |m| m.as_str()),
                        self.path,
                        self.version.map_or("-".into(), |v| v.to_string()),
                    );
                    return ParseStatus::Complete;
                }
            }
        }
    }

    /// Body size announced by the client; absent or unparsable means none.
    fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .or_else(|| self.headers.get("content-length"))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// `METHOD SP PATH[?QUERY] SP VERSION`
    fn parse_request_line(&mut self, line: &str, ctx: &ServerContext) -> bool {
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        self.method = match Method::from_token(method) {
            Some(method) => Some(method),
            None => return false,
        };

        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_owned();
                self.query = query.to_owned();
            }
            None => self.path = target.to_owned(),
        }
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if ctx.site().has_page(&self.path) {
            self.path.push_str(".html");
        }

        self.version = match Version::from_token(version) {
            Some(version) => Some(version),
            None => return false,
        };
        true
    }

    /// `Name: Value` with leading value whitespace trimmed; anything else
    /// (notably the blank separator line) ends the header section.
    fn parse_header(&mut self, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        self.headers
            .insert(name.to_owned(), value.trim_start().to_owned());
        true
    }

    fn parse_content(&mut self, line: String, ctx: &ServerContext) {
        debug!("content: {} bytes", line.len());
        self.body = line;
        self.parse_post(ctx);
    }

    /// Routes urlencoded POSTs: the two form pages go through user
    /// verification and are rewritten to `/index.html` on success or
    /// `/error.html` on failure; any other POST target is an error page.
    fn parse_post(&mut self, ctx: &ServerContext) {
        let content_type = self
            .headers
            .get("Content-Type")
            .or_else(|| self.headers.get("content-type"));
        if self.method != Some(Method::Post)
            || content_type.map(String::as_str) != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        self.form = decode_form(&self.body);
        let verified = match self.path.as_str() {
            "/login.html" => self.verify_user(ctx, true),
            "/register.html" => self.verify_user(ctx, false),
            _ => {
                warn!("unexpected POST target {}", self.path);
                false
            }
        };
        self.path = if verified {
            "/index.html".to_owned()
        } else {
            "/error.html".to_owned()
        };
    }

    fn verify_user(&self, ctx: &ServerContext, is_login: bool) -> bool {
        let username = self.form_value("username").unwrap_or("");
        let password = self.form_value("password").unwrap_or("");
        let pool = match ctx.db().get() {
            Ok(pool) => pool,
            Err(err) => {
                error!("database unavailable: {err}");
                return false;
            }
        };
        match user::verify(&pool, username, password, is_login) {
            Ok(verified) => verified,
            Err(err) => {
                error!("user verification failed: {err}");
                false
            }
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\r\n")
}

/// Takes one CRLF-terminated line out of `buf`, or leaves it untouched when
/// the terminator has not arrived yet.
fn take_line(buf: &mut ByteBuffer) -> Option<String> {
    let readable = buf.peek();
    let end = find_crlf(readable)?;
    let line = String::from_utf8_lossy(&readable[..end]).into_owned();
    buf.drain_until(end + 2);
    Some(line)
}

/// Takes the request body: exactly `declared` bytes when a Content-Length
/// was announced, otherwise whatever remains up to a trailing CRLF.
fn take_body(buf: &mut ByteBuffer, declared: usize) -> String {
    if declared > 0 {
        let body = String::from_utf8_lossy(&buf.peek()[..declared]).into_owned();
        buf.drain(declared);
        return body;
    }
    let readable = buf.peek();
    match find_crlf(readable) {
        Some(end) => {
            let body = String::from_utf8_lossy(&readable[..end]).into_owned();
            buf.drain_until(end + 2);
            body
        }
        None => {
            let body = String::from_utf8_lossy(readable).into_owned();
            buf.drain_all();
            body
        }
    }
}

/// Decodes an `application/x-www-form-urlencoded` body: pairs split on `&`
/// and `=`, `+` is a space, `%XX` is the byte with hex value XX.
fn decode_form(body: &str) -> HashMap<String, String> {
    let mut form = HashMap::new();
    if body.is_empty() {
        warn!("urlencoded POST with empty body");
        return form;
    }
    for pair in body.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        form.insert(percent_decode(key), percent_decode(value));
    }
    form
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (hex_value(bytes.get(i + 1)), hex_value(bytes.get(i + 2))) {
                (Some(high), Some(low)) => {
                    out.push(high * 16 + low);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    byte.and_then(|b| (*b as char).to_digit(16)).map(|d| d as u8)
}

#[cfg(test)]
mod test {
    use super::{decode_form, percent_decode, ParseStatus, Request};
    use crate::buffer::ByteBuffer;
    use crate::http::{Method, Version};
    use crate::server::test_support::context_with_pages;

    fn parse_raw(raw: &[u8]) -> (Request, ParseStatus) {
        let ctx = context_with_pages(&["index", "foo"]);
        let mut buf = ByteBuffer::new();
        buf.append(raw);
        let mut request = Request::new();
        let status = request.parse(&mut buf, &ctx);
        (request, status)
    }

    #[test]
    fn request_line_splits_method_target_version() {
        let (request, status) = parse_raw(b"GET /foo.css?v=2 HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Complete, status);
        assert_eq!(Some(Method::Get), request.method());
        assert_eq!("/foo.css", request.path());
        assert_eq!("v=2", request.query());
        assert_eq!(Some(Version::H1_1), request.version());
    }

    #[test]
    fn unknown_method_fails() {
        let (_, status) = parse_raw(b"BREW / HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Malformed, status);
    }

    #[test]
    fn unknown_version_fails() {
        let (_, status) = parse_raw(b"GET / HTTP/2\r\n\r\n");
        assert_eq!(ParseStatus::Malformed, status);
    }

    #[test]
    fn root_path_is_rewritten_to_index() {
        let (request, status) = parse_raw(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Complete, status);
        assert_eq!("/index.html", request.path());
    }

    #[test]
    fn preloaded_page_gets_html_suffix() {
        let (request, _) = parse_raw(b"GET /foo HTTP/1.1\r\n\r\n");
        assert_eq!("/foo.html", request.path());
        let (request, _) = parse_raw(b"GET /bar HTTP/1.1\r\n\r\n");
        assert_eq!("/bar", request.path());
    }

    #[test]
    fn headers_are_collected_with_leading_space_trimmed() {
        let (request, _) =
            parse_raw(b"GET / HTTP/1.1\r\nHost:   example.com\r\nAccept: */*\r\n\r\n");
        assert_eq!(Some("example.com"), request.header("Host"));
        assert_eq!(Some("*/*"), request.header("Accept"));
    }

    #[test]
    fn keep_alive_requires_header_and_http11() {
        let (request, _) = parse_raw(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(request.is_keep_alive());
        let (request, _) = parse_raw(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert!(!request.is_keep_alive());
        let (request, _) = parse_raw(b"GET / HTTP/1.1\r\n\r\n");
        assert!(!request.is_keep_alive());
        let (request, _) = parse_raw(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n");
        assert!(request.is_keep_alive());
    }

    #[test]
    fn urlencoded_post_fills_the_form_map() {
        // %41 decodes to the byte 0x41 ('A'), not to its decimal digits.
        let (request, status) = parse_raw(
            b"POST /submit.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              a=1&b=%41+B",
        );
        assert_eq!(ParseStatus::Complete, status);
        assert_eq!(Some("1"), request.form_value("a"));
        assert_eq!(Some("A B"), request.form_value("b"));
        // Unknown POST target routes to the error page.
        assert_eq!("/error.html", request.path());
    }

    #[test]
    fn post_body_waits_for_declared_content_length() {
        let ctx = context_with_pages(&[]);
        let mut buf = ByteBuffer::new();
        let mut request = Request::new();

        buf.append(
            b"POST /submit.html HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 11\r\n\
              \r\n\
              a=1&",
        );
        assert_eq!(ParseStatus::Incomplete, request.parse(&mut buf, &ctx));
        // The partial body is still buffered, waiting for the rest.
        assert_eq!(4, buf.readable_len());

        buf.append(b"b=%41+B");
        assert_eq!(ParseStatus::Complete, request.parse(&mut buf, &ctx));
        assert_eq!(Some("1"), request.form_value("a"));
        assert_eq!(Some("A B"), request.form_value("b"));
    }

    #[test]
    fn decode_form_handles_plus_percent_and_trailing_pair() {
        let form = decode_form("name=al+ice&token=%7Eabc%2F");
        assert_eq!(Some("al ice"), form.get("name").map(String::as_str));
        assert_eq!(Some("~abc/"), form.get("token").map(String::as_str));
    }

    #[test]
    fn malformed_percent_escapes_pass_through() {
        assert_eq!("100%", percent_decode("100%"));
        assert_eq!("a%zz", percent_decode("a%zz"));
    }

    #[test]
    fn partial_input_resumes_on_next_parse() {
        let ctx = context_with_pages(&[]);
        let mut buf = ByteBuffer::new();
        let mut request = Request::new();

        buf.append(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert_eq!(ParseStatus::Incomplete, request.parse(&mut buf, &ctx));
        assert_eq!(Some("a"), request.header("Host"));

        buf.append(b"Connection: keep-alive\r\n\r\n");
        assert_eq!(ParseStatus::Complete, request.parse(&mut buf, &ctx));
        assert!(request.is_keep_alive());
    }

    #[test]
    fn split_mid_line_and_mid_header_is_reassembled() {
        let ctx = context_with_pages(&["foo"]);
        let mut buf = ByteBuffer::new();
        let mut request = Request::new();

        // Request line cut mid-token: nothing may be consumed yet.
        buf.append(b"GET /foo HT");
        assert_eq!(ParseStatus::Incomplete, request.parse(&mut buf, &ctx));
        assert_eq!(11, buf.readable_len());
        assert_eq!(None, request.method());

        // The line completes, a header is cut mid-name.
        buf.append(b"TP/1.1\r\nConnec");
        assert_eq!(ParseStatus::Incomplete, request.parse(&mut buf, &ctx));
        assert_eq!(Some(Method::Get), request.method());
        assert_eq!("/foo.html", request.path());
        assert_eq!(6, buf.readable_len());

        buf.append(b"tion: keep-alive\r\n\r\n");
        assert_eq!(ParseStatus::Complete, request.parse(&mut buf, &ctx));
        assert!(request.is_keep_alive());
    }

    #[test]
    fn clear_resets_all_state() {
        let (mut request, _) = parse_raw(b"GET /foo HTTP/1.1\r\nHost: a\r\n\r\n");
        request.clear();
        assert_eq!(None, request.method());
        assert_eq!("", request.path());
        assert_eq!(None, request.header("Host"));
    }
}
