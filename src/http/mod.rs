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

//! HTTP/1.1 types shared by the parser and the response builder.

use std::fmt::Display;

pub mod connection;
pub mod request;
pub mod response;

/// Request methods
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    /// Canonical (upper-case) token only; anything else is a parse failure.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "CONNECT" => Some(Self::Connect),
            "OPTIONS" => Some(Self::Options),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported protocol versions; HTTP/2 and beyond are out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    H1_0,
    H1_1,
}

impl Version {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "HTTP/1.0" => Some(Self::H1_0),
            "HTTP/1.1" => Some(Self::H1_1),
            _ => None,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Status codes this server emits.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
}

impl Status {
    #[inline]
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
        }
    }

    /// Error pages served from the site root when present.
    pub fn error_page(&self) -> Option<&'static str> {
        match self {
            Self::Ok => None,
            Self::BadRequest => Some("/400.html"),
            Self::Forbidden => Some("/403.html"),
            Self::NotFound => Some("/404.html"),
        }
    }
}

/// Content type by file extension; unknown extensions fall back to
/// `text/plain`.
pub fn content_type_for(path: &str) -> &'static str {
    let extension = match path.rfind('.') {
        Some(at) => &path[at..],
        None => return "text/plain",
    };
    match extension {
        ".htm" | ".html" => "text/html",
        ".xml" | ".svg" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".doc" => "application/msword",
        ".ppt" => "application/vnd.ms-powerpoint",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" | ".jfif" => "image/jpeg",
        ".ico" => "image/x-icon",
        ".bmp" => "application/x-bmp",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" | ".mp3" | ".mp4" | ".mpv" | ".avi" => "application/octet-stream",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".latex" => "application/x-latex",
        ".exe" => "application/x-msdownload",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod test {
    use super::{content_type_for, Method, Status, Version};

    #[test]
    fn canonical_method_tokens_parse() {
        assert_eq!(Some(Method::Get), Method::from_token("GET"));
        assert_eq!(Some(Method::Post), Method::from_token("POST"));
        assert_eq!(None, Method::from_token("BREW"));
        assert_eq!(None, Method::from_token("get"));
    }

    #[test]
    fn only_http_10_and_11_parse() {
        assert_eq!(Some(Version::H1_0), Version::from_token("HTTP/1.0"));
        assert_eq!(Some(Version::H1_1), Version::from_token("HTTP/1.1"));
        assert_eq!(None, Version::from_token("HTTP/2"));
        assert_eq!(None, Version::from_token("HTTP/1.2"));
    }

    #[test]
    fn status_carries_code_reason_and_error_page() {
        assert_eq!(200, Status::Ok.code());
        assert_eq!("Bad Request", Status::BadRequest.reason());
        assert_eq!(Some("/404.html"), Status::NotFound.error_page());
        assert_eq!(None, Status::Ok.error_page());
    }

    #[test]
    fn content_type_falls_back_to_text_plain() {
        assert_eq!("text/html", content_type_for("/index.html"));
        assert_eq!("image/png", content_type_for("/img/logo.png"));
        assert_eq!("text/plain", content_type_for("/README"));
        assert_eq!("text/plain", content_type_for("/data.unknown"));
    }
}
