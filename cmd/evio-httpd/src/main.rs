//! evio HTTP Server
//!
//! Example program: minimal HTTP/1.1 static file server with keep-alive.
//! Request parsing uses the line parser; bodies go out with `sendfile`
//! under `TCP_CORK` so headers and the first body segment share packets.
//!
//! Usage:
//!     cargo build --release -p evio-httpd
//!     ./target/release/evio-httpd [port] [root]
//!
//! Test with:
//!     curl -v http://localhost:8080/
//!     wrk -t4 -c100 -d10s http://localhost:8080/index.html

use evio::{kdebug, kinfo, open, tcp4_listen, Error, EventLoop, File, Line, Opened, Stream, Whence};

use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

/// Request line plus headers; longer requests are rejected
const MAX_HEADER_LINES: usize = 100;

struct Request {
    method: String,
    path: String,
    keep_alive: bool,
}

enum ReadError {
    /// Peer went away between requests
    Gone,
    Malformed,
}

async fn read_request(conn: &Stream) -> Result<Request, ReadError> {
    let first = match conn.read(Line::new()).await {
        Ok(line) => line,
        Err(_) => return Err(ReadError::Gone),
    };
    let first = String::from_utf8_lossy(trim_cr(&first)).into_owned();
    let mut parts = first.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ReadError::Malformed);
    };
    let mut keep_alive = version == "HTTP/1.1";

    for _ in 0..MAX_HEADER_LINES {
        let line = conn.read(Line::new()).await.map_err(|_| ReadError::Gone)?;
        let line = trim_cr(&line);
        if line.is_empty() {
            return Ok(Request {
                method: method.to_owned(),
                path: path.to_owned(),
                keep_alive,
            });
        }
        let line = String::from_utf8_lossy(line);
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("connection") {
                let value = value.trim();
                if value.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }
    }
    Err(ReadError::Malformed)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Map a request path under `root`, refusing anything that escapes it.
fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    let path = path.split('?').next().unwrap_or("");
    let rel = Path::new(path.trim_start_matches('/'));
    let mut out = root.to_path_buf();
    for c in rel.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if path.ends_with('/') || rel.as_os_str().is_empty() {
        out.push("index.html");
    }
    Some(out)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

async fn send_status(conn: &Stream, status: &str, keep_alive: bool) -> evio::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: {}\r\n\r\n{}\n",
        status,
        status.len() + 1,
        if keep_alive { "keep-alive" } else { "close" },
        status,
    );
    conn.write_all(head.as_bytes()).await.map(drop)
}

async fn send_file(conn: &Stream, file: &File, path: &Path, req: &Request) -> evio::Result<()> {
    let size = file.seek(Whence::End, 0).await?;
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: {}\r\nConnection: {}\r\n\r\n",
        size,
        content_type(path),
        if req.keep_alive { "keep-alive" } else { "close" },
    );
    conn.cork()?;
    conn.write_all(head.as_bytes()).await?;
    if req.method == "GET" {
        let sent = conn.sendfile(file, size, 0).await?;
        if sent != size {
            // File shrank underneath us; the length header is now wrong.
            return Err(Error::Closed);
        }
    }
    conn.uncork()
}

async fn respond(conn: &Stream, root: &Path, req: &Request) -> evio::Result<()> {
    if req.method != "GET" && req.method != "HEAD" {
        return send_status(conn, "405 Method Not Allowed", req.keep_alive).await;
    }
    let Some(path) = resolve(root, &req.path) else {
        return send_status(conn, "400 Bad Request", req.keep_alive).await;
    };
    match open(&path, "r").await {
        Ok(Opened::File(file)) => {
            let res = send_file(conn, &file, &path, req).await;
            let _ = file.close();
            res
        }
        Ok(Opened::Stream(_)) => send_status(conn, "403 Forbidden", req.keep_alive).await,
        Err(Error::Os(evio::Errno::ENOENT)) | Err(Error::Os(evio::Errno::EISDIR)) => {
            send_status(conn, "404 Not Found", req.keep_alive).await
        }
        Err(e) => {
            kdebug!("open {} failed: {}", path.display(), e);
            send_status(conn, "500 Internal Server Error", false).await?;
            Err(e)
        }
    }
}

async fn handle(conn: Stream, root: Rc<PathBuf>) {
    loop {
        let req = match read_request(&conn).await {
            Ok(req) => req,
            Err(ReadError::Gone) => break,
            Err(ReadError::Malformed) => {
                let _ = send_status(&conn, "400 Bad Request", false).await;
                break;
            }
        };
        kdebug!("{} {}", req.method, req.path);
        if respond(&conn, &root, &req).await.is_err() || !req.keep_alive {
            break;
        }
    }
}

fn main() {
    evio::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8080);
    let root = Rc::new(PathBuf::from(args.get(2).map(String::as_str).unwrap_or(".")));

    let ev = match EventLoop::new() {
        Ok(ev) => ev,
        Err(e) => {
            eprintln!("evio-httpd: cannot start event loop: {}", e);
            std::process::exit(1);
        }
    };

    let res = ev.block_on(async {
        let server = tcp4_listen("*", port, 1024).await?;
        kinfo!("serving {} on {}", root.display(), server.local_addr()?);
        eprintln!("evio-httpd: listening on {}", server.local_addr()?);
        server
            .autospawn(|conn| handle(conn, root.clone()))
            .await
    });

    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) | Err(e) => {
            eprintln!("evio-httpd: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_stays_under_root() {
        let root = Path::new("/srv/www");
        assert_eq!(resolve(root, "/"), Some(PathBuf::from("/srv/www/index.html")));
        assert_eq!(resolve(root, "/a/b.css?v=2"), Some(PathBuf::from("/srv/www/a/b.css")));
        assert_eq!(resolve(root, "/docs/"), Some(PathBuf::from("/srv/www/docs/index.html")));
        assert_eq!(resolve(root, "/./x.txt"), Some(PathBuf::from("/srv/www/x.txt")));
        assert_eq!(resolve(root, "/../etc/passwd"), None);
        assert_eq!(resolve(root, "/a/../../b"), None);
    }

    #[test]
    fn test_content_type_by_extension() {
        assert_eq!(content_type(Path::new("a.html")), "text/html");
        assert_eq!(content_type(Path::new("a.tar.gz")), "application/octet-stream");
        assert_eq!(content_type(Path::new("noext")), "application/octet-stream");
    }
}
