// Copyright (c) The implstore Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support code for integration tests: a minimal in-process HTTP server
//! with recorded requests, and ZIP fixture builders.

// Each integration test binary uses a different slice of this module.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
};
use zip::{CompressionMethod, ZipWriter, write::FileOptions};

/// A fixed entry mtime so fixture digests are stable: 2020-01-01 00:00:00.
pub const FIXTURE_MTIME: i64 = 1_577_836_800;

/// One request observed by the test server.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct Route {
    body: Vec<u8>,
    honor_range: bool,
    /// Serve only this many bytes on the first request, then drop the
    /// connection. Exercises the resume path.
    fail_once_after: Mutex<Option<usize>>,
}

/// A tiny blocking HTTP server on a loopback port, one thread per
/// connection, `Connection: close` semantics.
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    routes: Arc<Mutex<HashMap<String, Arc<Route>>>>,
}

impl TestServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();
        let routes: Arc<Mutex<HashMap<String, Arc<Route>>>> = Arc::default();

        {
            let requests = Arc::clone(&requests);
            let routes = Arc::clone(&routes);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let requests = Arc::clone(&requests);
                    let routes = Arc::clone(&routes);
                    thread::spawn(move || {
                        let _ = handle_connection(stream, &requests, &routes);
                    });
                }
            });
        }

        Self {
            addr,
            requests,
            routes,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn add_route(&self, path: &str, body: Vec<u8>) {
        self.insert(path, body, true, None);
    }

    /// A route that ignores `Range` headers and always serves the full body.
    pub fn add_route_no_range(&self, path: &str, body: Vec<u8>) {
        self.insert(path, body, false, None);
    }

    /// A route whose first response is truncated after `bytes`, forcing the
    /// client into a retry.
    pub fn add_flaky_route(&self, path: &str, body: Vec<u8>, bytes: usize) {
        self.insert(path, body, true, Some(bytes));
    }

    fn insert(&self, path: &str, body: Vec<u8>, honor_range: bool, fail: Option<usize>) {
        self.routes.lock().unwrap().insert(
            path.to_owned(),
            Arc::new(Route {
                body,
                honor_range,
                fail_once_after: Mutex::new(fail),
            }),
        );
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

fn handle_connection(
    mut stream: TcpStream,
    requests: &Mutex<Vec<RecordedRequest>>,
    routes: &Mutex<HashMap<String, Arc<Route>>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_owned();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_owned(), value.trim().to_owned()));
        }
    }
    let request = RecordedRequest {
        path: path.clone(),
        headers,
    };
    let range_offset = request
        .header("Range")
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse::<usize>().ok());
    requests.lock().unwrap().push(request);

    let route = routes.lock().unwrap().get(&path).cloned();
    let Some(route) = route else {
        stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")?;
        return Ok(());
    };

    let total = route.body.len();
    let (status, served) = match range_offset {
        Some(offset) if route.honor_range && offset <= total => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {offset}-{}/{total}\r\n",
                total.saturating_sub(1)
            ),
            &route.body[offset..],
        ),
        _ => ("HTTP/1.1 200 OK\r\n".to_owned(), &route.body[..]),
    };

    let truncate_at = route.fail_once_after.lock().unwrap().take();
    stream.write_all(status.as_bytes())?;
    stream.write_all(
        format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            served.len()
        )
        .as_bytes(),
    )?;
    match truncate_at {
        Some(bytes) if bytes < served.len() => {
            stream.write_all(&served[..bytes])?;
            // Dropping the stream here closes the connection short of the
            // declared length; the client sees an unexpected EOF.
        }
        _ => stream.write_all(served)?,
    }
    stream.flush()?;
    Ok(())
}

/// One fixture archive entry.
pub struct ZipEntry {
    pub name: &'static str,
    pub contents: &'static [u8],
    pub unix_mode: u32,
}

impl ZipEntry {
    pub fn file(name: &'static str, contents: &'static [u8]) -> Self {
        Self {
            name,
            contents,
            unix_mode: 0o644,
        }
    }

    pub fn executable(name: &'static str, contents: &'static [u8]) -> Self {
        Self {
            name,
            contents,
            unix_mode: 0o755,
        }
    }
}

/// Builds a deflated ZIP with fixed timestamps.
pub fn build_zip(entries: &[ZipEntry]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let mtime = zip::DateTime::from_date_and_time(2020, 1, 1, 0, 0, 0).expect("valid date");
    for entry in entries {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(mtime)
            .unix_permissions(entry.unix_mode);
        writer.start_file(entry.name, options).expect("start file");
        writer.write_all(entry.contents).expect("write entry");
    }
    writer
        .finish()
        .expect("finish zip")
        .into_inner()
}

/// Reads the whole body of a file, for fixture assertions.
pub fn read_file(path: &camino::Utf8Path) -> Vec<u8> {
    let mut out = Vec::new();
    std::fs::File::open(path)
        .expect("open file")
        .read_to_end(&mut out)
        .expect("read file");
    out
}
