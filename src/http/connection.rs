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

//! One accepted connection: socket, buffers, request, response, and the
//! two-segment send vector.

use std::io::{self, ErrorKind, IoSlice, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;

use crate::buffer::ByteBuffer;
use crate::http::request::{ParseStatus, Request};
use crate::http::response::Response;
use crate::http::Status;
use crate::server::ServerContext;

#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    request: Request,
    response: Response,
    /// Progress into the mapped-file segment of the send vector.
    file_written: usize,
    eof: bool,
    closed: bool,
}

impl HttpConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            request: Request::new(),
            response: Response::new(),
            file_written: 0,
            eof: false,
            closed: false,
        }
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// For multiplexer (de)registration.
    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// True once the peer sent FIN; the connection is done after any pending
    /// response has been written.
    #[inline]
    pub fn peer_closed(&self) -> bool {
        self.eof
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    /// Bytes still owed to the socket: buffered headers plus the unsent part
    /// of the mapped file.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_len()
            + self
                .response
                .file()
                .map_or(0, |file| file.len() - self.file_written)
    }

    /// Drains the socket into the read buffer until the kernel has nothing
    /// more (registration is edge-triggered, so a partial drain would lose
    /// the rest until the next transition).
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => total += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Writes the send vector (header segment, then mapped file) with
    /// vectored I/O, advancing one or both segments on partial sends, until
    /// everything is out or the kernel pushes back.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while self.to_write_bytes() > 0 {
            let (n, header_len) = {
                let header = self.write_buf.peek();
                let file = self
                    .response
                    .file()
                    .map_or(&[][..], |file| &file.as_bytes()[self.file_written..]);
                let iov = [IoSlice::new(header), IoSlice::new(file)];
                match self.stream.write_vectored(&iov) {
                    Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                    Ok(n) => (n, header.len()),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            };
            if n >= header_len {
                self.file_written += n - header_len;
                self.write_buf.drain_all();
            } else {
                self.write_buf.drain(n);
            }
            total += n;
        }
        Ok(total)
    }

    /// Feeds the read buffer to the parser and, once a request has fully
    /// arrived, builds the response: 200 for a parsed request, 400 for a
    /// malformed one. Returns whether there is data to write (false means
    /// "request still incomplete, keep waiting for reads"). Request state is
    /// only reset when the previous request finished, so a request spanning
    /// several reads keeps its progress across calls.
    pub fn process(&mut self, ctx: &ServerContext) -> bool {
        if self.request.is_finished() {
            self.request.clear();
        }
        let (keep_alive, status) = match self.request.parse(&mut self.read_buf, ctx) {
            ParseStatus::Incomplete => return false,
            ParseStatus::Complete => (self.request.is_keep_alive(), Status::Ok),
            ParseStatus::Malformed => (false, Status::BadRequest),
        };
        let path = self.request.path().to_owned();
        self.response
            .init(ctx.site().root(), &path, keep_alive, status);
        self.response.build(&mut self.write_buf);
        self.file_written = 0;
        true
    }

    /// Releases the response mapping and marks the connection closed.
    /// Idempotent; the socket itself closes when the connection is dropped.
    pub fn close(&mut self) {
        self.response.unmap();
        self.closed = true;
    }
}

#[cfg(test)]
mod test {
    use super::HttpConnection;
    use crate::server::test_support::context_with_site;
    use std::fs;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    /// Loopback pair: (server-side mio stream wrapped in a connection,
    /// client-side std stream).
    fn connected_pair() -> (HttpConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let conn = HttpConnection::new(mio::net::TcpStream::from_std(accepted), peer);
        (conn, client)
    }

    fn read_until_blocked(conn: &mut HttpConnection) -> usize {
        for _ in 0..50 {
            let n = conn.read().unwrap();
            if n > 0 {
                return n;
            }
            thread::sleep(Duration::from_millis(2));
        }
        0
    }

    #[test]
    fn request_response_round_trip_over_loopback() {
        let (ctx, site_dir) = context_with_site("conn-roundtrip");
        fs::write(site_dir.join("index.html"), "<html>hi</html>").unwrap();
        let (mut conn, mut client) = connected_pair();

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(read_until_blocked(&mut conn) > 0);
        assert!(conn.process(&ctx));
        assert!(conn.to_write_bytes() > 0);
        assert!(conn.is_keep_alive());

        while conn.to_write_bytes() > 0 {
            conn.write().unwrap();
        }

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut response = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&chunk[..n]);
                    if response.ends_with(b"</html>") {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => panic!("client read failed: {err}"),
            }
        }
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-length: 15\r\n\r\n"));
        assert!(text.ends_with("<html>hi</html>"));
        let _ = fs::remove_dir_all(&site_dir);
    }

    #[test]
    fn process_without_data_reports_nothing_to_write() {
        let (ctx, site_dir) = context_with_site("conn-idle");
        let (mut conn, _client) = connected_pair();
        assert!(!conn.process(&ctx));
        let _ = fs::remove_dir_all(&site_dir);
    }

    #[test]
    fn fragmented_request_keeps_state_across_process_calls() {
        let (ctx, site_dir) = context_with_site("conn-fragmented");
        fs::write(site_dir.join("index.html"), "<html>hi</html>").unwrap();
        let (mut conn, mut client) = connected_pair();

        // Header cut mid-name: no response may be built yet.
        client.write_all(b"GET / HTTP/1.1\r\nConnec").unwrap();
        assert!(read_until_blocked(&mut conn) > 0);
        assert!(!conn.process(&ctx));
        assert_eq!(0, conn.to_write_bytes());

        client.write_all(b"tion: keep-alive\r\n\r\n").unwrap();
        assert!(read_until_blocked(&mut conn) > 0);
        assert!(conn.process(&ctx));
        assert!(conn.is_keep_alive());
        assert!(conn.to_write_bytes() > 0);
        let _ = fs::remove_dir_all(&site_dir);
    }

    #[test]
    fn keep_alive_second_request_starts_fresh() {
        let (ctx, site_dir) = context_with_site("conn-second");
        fs::write(site_dir.join("index.html"), "<html>hi</html>").unwrap();
        let (mut conn, mut client) = connected_pair();

        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert!(read_until_blocked(&mut conn) > 0);
        assert!(conn.process(&ctx));
        assert!(conn.is_keep_alive());

        // The next request carries no Connection header; stale state from
        // the first one must not leak into it.
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(read_until_blocked(&mut conn) > 0);
        assert!(conn.process(&ctx));
        assert!(!conn.is_keep_alive());
        let _ = fs::remove_dir_all(&site_dir);
    }

    #[test]
    fn peer_fin_marks_eof() {
        let (_ctx, site_dir) = context_with_site("conn-fin");
        let (mut conn, client) = connected_pair();
        drop(client);
        thread::sleep(Duration::from_millis(10));
        conn.read().unwrap();
        assert!(conn.peer_closed());
        let _ = fs::remove_dir_all(&site_dir);
    }

    #[test]
    fn close_is_idempotent() {
        let (_ctx, site_dir) = context_with_site("conn-close");
        let (mut conn, _client) = connected_pair();
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        let _ = fs::remove_dir_all(&site_dir);
    }
}
