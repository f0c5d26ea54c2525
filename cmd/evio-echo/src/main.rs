//! evio Echo Server
//!
//! Line-oriented TCP echo server. Every connection gets its own task via
//! `Server::autospawn`; a client sending `shutdown` stops the server.
//!
//! Usage:
//!     cargo build --release -p evio-echo
//!     ./target/release/evio-echo [port] [host]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done
//!     echo shutdown | nc -q0 localhost 9999

use evio::{kdebug, kwarn, tcp4_listen, Error, EventLoop, Line, Server, Stream};

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

// ── Stats ──
#[derive(Default)]
struct Stats {
    accepts: Cell<u64>,
    closes: Cell<u64>,
    lines: Cell<u64>,
    bytes_out: Cell<u64>,
    errors: Cell<u64>,
}

impl Stats {
    fn bump(c: &Cell<u64>, n: u64) {
        c.set(c.get() + n);
    }

    fn print(&self, elapsed_secs: f64) {
        eprintln!(
            "[{:.1}s] conns={} accepts={} close={} lines={} bytes_out={} err={}",
            elapsed_secs,
            self.accepts.get() - self.closes.get(),
            self.accepts.get(),
            self.closes.get(),
            self.lines.get(),
            self.bytes_out.get(),
            self.errors.get(),
        );
    }
}

async fn serve(host: &str, port: u16, stats: Rc<Stats>) -> evio::Result<()> {
    let server = Rc::new(tcp4_listen(host, port, 1024).await?);
    eprintln!("evio-echo: listening on {}", server.local_addr()?);

    let srv = server.clone();
    let res = server
        .autospawn(move |conn| echo(conn, srv.clone(), stats.clone()))
        .await;
    match res {
        // Interrupted by a `shutdown` line.
        Err(Error::Closed) => Ok(()),
        other => other,
    }
}

async fn echo(conn: Stream, server: Rc<Server>, stats: Rc<Stats>) {
    Stats::bump(&stats.accepts, 1);
    loop {
        let line = match conn.read(Line::new()).await {
            Ok(line) => line,
            Err(Error::Closed) => break,
            Err(e) => {
                kwarn!("read failed: {}", e);
                Stats::bump(&stats.errors, 1);
                break;
            }
        };
        Stats::bump(&stats.lines, 1);
        if line == b"shutdown" {
            server.interrupt();
            break;
        }
        match conn.write(&[&line[..], &b"\n"[..]]).await {
            Ok(n) => Stats::bump(&stats.bytes_out, n as u64),
            Err(e) => {
                kdebug!("write failed: {}", e);
                Stats::bump(&stats.errors, 1);
                break;
            }
        }
    }
    Stats::bump(&stats.closes, 1);
}

fn main() {
    evio::init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let host = args.get(2).map(String::as_str).unwrap_or("*");

    let ev = match EventLoop::new() {
        Ok(ev) => ev,
        Err(e) => {
            eprintln!("evio-echo: cannot start event loop: {}", e);
            std::process::exit(1);
        }
    };

    let stats = Rc::new(Stats::default());
    let start = Instant::now();
    let res = ev.block_on(serve(host, port, stats.clone()));

    eprintln!("\nevio-echo: shutting down...");
    stats.print(start.elapsed().as_secs_f64());
    match res {
        Ok(Ok(())) => eprintln!("evio-echo: done."),
        Ok(Err(e)) | Err(e) => {
            eprintln!("evio-echo: {}", e);
            std::process::exit(1);
        }
    }
}
