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

//! HTTP response builder.
//!
//! The response is produced as two I/O segments for the connection's
//! vectored write: status line plus headers in the write buffer, and the
//! requested file as a read-only memory mapping. Error responses fall back
//! to `/400.html`-style pages under the site root when present, or to a
//! small inline HTML body.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::http::{content_type_for, Status};

/// Read-only memory mapping of an open file, unmapped on drop so that an
/// early error, a re-init, or a connection close releases it deterministically.
#[derive(Debug)]
pub struct MappedFile {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappedFile {
    /// Maps `len` bytes of `file`. Fails on zero length (mmap rejects it).
    pub fn map(file: &File, len: usize) -> std::io::Result<Self> {
        if len == 0 {
            return Err(std::io::Error::other("cannot map an empty file"));
        }
        // SAFETY: fd is a valid open file, len is its non-zero size, and the
        // mapping is private read-only; the pointer is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: ptr..ptr+len is a live PROT_READ mapping owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// SAFETY: the mapping is private and read-only; the raw pointer is only
// dereferenced through &self.
unsafe impl Send for MappedFile {}

#[derive(Debug)]
pub struct Response {
    status: Status,
    keep_alive: bool,
    root: PathBuf,
    path: String,
    file: Option<MappedFile>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: Status::Ok,
            keep_alive: false,
            root: PathBuf::new(),
            path: String::new(),
            file: None,
        }
    }

    /// Prepares for a new response, releasing any previous mapping.
    pub fn init(&mut self, root: &Path, path: &str, keep_alive: bool, status: Status) {
        self.file = None;
        self.status = status;
        self.keep_alive = keep_alive;
        self.root = root.to_owned();
        self.path = path.to_owned();
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// The mapped file segment, when the body is served from disk.
    #[inline]
    pub fn file(&self) -> Option<&MappedFile> {
        self.file.as_ref()
    }

    /// Drops the mapping without waiting for the next init.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    /// Builds status line and headers into `buf` and maps the body file.
    pub fn build(&mut self, buf: &mut ByteBuffer) {
        let full_path = self.resolve_target();
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf, &full_path);
    }

    /// Applies the 404/403 checks to the requested path and swaps in the
    /// matching error page when one exists under the site root.
    fn resolve_target(&mut self) -> PathBuf {
        let mut full_path = join_under_root(&self.root, &self.path);
        if self.status == Status::Ok {
            match std::fs::metadata(&full_path) {
                Err(_) => {
                    warn!("{}: not found", self.path);
                    self.status = Status::NotFound;
                }
                Ok(meta) if meta.is_dir() => {
                    warn!("{}: is a directory", self.path);
                    self.status = Status::NotFound;
                }
                Ok(meta) if meta.permissions().mode() & 0o004 == 0 => {
                    warn!("{}: not world-readable", self.path);
                    self.status = Status::Forbidden;
                }
                Ok(_) => {}
            }
        }
        if let Some(page) = self.status.error_page() {
            let error_path = join_under_root(&self.root, page);
            if error_path.is_file() {
                self.path = page.to_owned();
                full_path = error_path;
            }
        }
        full_path
    }

    fn add_status_line(&self, buf: &mut ByteBuffer) {
        buf.append(
            format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes(),
        );
    }

    fn add_headers(&self, buf: &mut ByteBuffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", content_type_for(&self.path)).as_bytes());
    }

    /// Opens and maps the resolved file; any failure here keeps the status
    /// code but swaps the body for a small inline error page.
    fn add_content(&mut self, buf: &mut ByteBuffer, full_path: &Path) {
        let file = match File::open(full_path) {
            Ok(file) => file,
            Err(_) => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        let len = match file.metadata() {
            Ok(meta) => meta.len() as usize,
            Err(_) => {
                self.error_content(buf, "File Stat Error!");
                return;
            }
        };
        if len == 0 {
            self.error_content(buf, "Empty File!");
            return;
        }
        debug!("serving {}", full_path.display());
        match MappedFile::map(&file, len) {
            Ok(mapped) => {
                buf.append(format!("Content-length: {len}\r\n\r\n").as_bytes());
                self.file = Some(mapped);
            }
            Err(err) => {
                warn!("mmap failed for {}: {err}", full_path.display());
                self.error_content(buf, "File NotFound!");
            }
        }
    }

    /// Inline HTML body used when no file can be served.
    fn error_content(&self, buf: &mut ByteBuffer, message: &str) {
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p>\
             <hr><em>hearth</em></body></html>",
            self.status.code(),
            self.status.reason(),
            message
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

/// `path` always starts with '/'; joining it verbatim would replace the root.
fn join_under_root(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}
