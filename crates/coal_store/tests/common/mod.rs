//! Shared helpers for node integration tests: an in-process node runner and
//! a minimal RESP client.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use coal_store::node::{run_node_with_shutdown, NodeArgs};

/// Timeout for node startup.
pub const START_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for individual RESP round trips.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(5);

/// A coal-store node running inside this test process.
pub struct TestNode {
    pub addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestNode {
    /// Signal shutdown and wait for the node (engine drain included) to exit.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().expect("node thread panicked");
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start a node on a free port with its data under `data_dir`.
pub fn spawn_node(data_dir: &Path) -> TestNode {
    let addr: SocketAddr = format!("127.0.0.1:{}", pick_free_port())
        .parse()
        .expect("parse listen addr");
    let args = NodeArgs {
        listen: addr,
        data_dir: data_dir.to_path_buf(),
        flush_interval_us: 500,
        fjall_fsync_ms: 0,
    };

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let thread = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("build runtime");
        runtime.block_on(async move {
            let shutdown = async move {
                let _ = rx.await;
                Ok::<(), std::io::Error>(())
            };
            if let Err(err) = run_node_with_shutdown(args, shutdown).await {
                panic!("node failed: {err:?}");
            }
        });
    });

    wait_for_port(addr, START_TIMEOUT);
    TestNode {
        addr,
        shutdown: Some(tx),
        thread: Some(thread),
    }
}

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind port 0");
    listener.local_addr().expect("local addr").port()
}

/// Wait for a TCP port to accept connections.
pub fn wait_for_port(addr: SocketAddr, timeout: Duration) {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("port {addr} did not open in time");
}

/// Decoded RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Null,
}

impl Reply {
    pub fn integer(&self) -> i64 {
        match self {
            Reply::Integer(value) => *value,
            other => panic!("expected integer reply, got {other:?}"),
        }
    }
}

/// RESP connection wrapper that preserves buffered reads between commands.
pub struct RespConn {
    reader: BufReader<TcpStream>,
}

impl RespConn {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect node");
        stream.set_read_timeout(Some(RESP_TIMEOUT)).ok();
        stream.set_write_timeout(Some(RESP_TIMEOUT)).ok();
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Send a command as an array of bulk strings and read one reply.
    pub fn send_command(&mut self, parts: &[&str]) -> Reply {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
            buf.extend_from_slice(part.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        let stream = self.reader.get_mut();
        stream.write_all(&buf).expect("write resp command");
        stream.flush().ok();

        read_reply(&mut self.reader)
    }
}

fn read_reply(reader: &mut BufReader<TcpStream>) -> Reply {
    let mut first = [0u8; 1];
    reader.read_exact(&mut first).expect("read reply type");
    let line = read_line(reader);
    match first[0] {
        b'+' => Reply::Simple(line),
        b'-' => Reply::Error(line),
        b':' => Reply::Integer(line.parse().expect("parse integer reply")),
        b'$' => {
            let len: i64 = line.parse().expect("parse bulk length");
            if len < 0 {
                return Reply::Null;
            }
            let mut data = vec![0u8; len as usize + 2];
            reader.read_exact(&mut data).expect("read bulk body");
            data.truncate(len as usize);
            Reply::Bulk(data)
        }
        other => panic!("unexpected reply type byte {other:#x}"),
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line).expect("read reply line");
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).expect("reply line is utf8")
}
