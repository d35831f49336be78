//! TCP echo server on the weft runtime
//!
//! Every connection is handled by blocking-looking code; the hook layer
//! turns each read/write into a cooperative suspension, so a handful of
//! workers carry thousands of connections.
//!
//! Usage:
//!     weft-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900

use std::net::SocketAddr;

use anyhow::{Context, Result};
use weft::net::{TcpListener, TcpStream};
use weft::{Dispatch, IoManager, Task};

fn handle(stream: TcpStream, peer: SocketAddr) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if stream.write_all(&buf[..n]).is_err() {
            break;
        }
    }
    eprintln!("[echo] {} disconnected", peer);
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().map_or(Ok(9900), |s| s.parse()).context("bad port")?;
    let workers: usize = args.next().map_or(Ok(2), |s| s.parse()).context("bad worker count")?;

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
    eprintln!("[echo] listening on {} with {} workers", addr, workers);

    let iom = IoManager::new(workers, false, "echo-io").context("start runtime")?;
    iom.schedule(Task::call(move || loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                eprintln!("[echo] {} connected", peer);
                let _ = weft::spawn(move || handle(stream, peer));
            }
            Err(e) => {
                eprintln!("[echo] accept failed: {}", e);
                break;
            }
        }
    }));

    // The acceptor runs forever; park the main thread.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
