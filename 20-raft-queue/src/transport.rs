//! TCP transport for raft messages.
//!
//! Every message travels on its own short-lived connection:
//!
//! - 4 bytes: frame length (big-endian u32)
//! - 2 bytes: sender address length (big-endian u16)
//! - N bytes: sender address, UTF-8
//! - rest: protobuf-encoded raft `Message`
//!
//! The sender address lets a node that is not yet in the configuration
//! answer the leader that contacted it.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use prost::Message as ProstMessage;
use raft::prelude::Message;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest frame body a receiver accepts. Senders refuse anything bigger.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A raft message together with the address of the node that sent it.
#[derive(Debug)]
pub struct Envelope {
    pub from_addr: String,
    pub message: Message,
}

pub fn encode_frame(from_addr: &str, msg: &Message) -> Vec<u8> {
    let body = msg.encode_to_vec();
    let addr = from_addr.as_bytes();
    let len = 2 + addr.len() + body.len();

    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    frame.extend_from_slice(addr);
    frame.extend_from_slice(&body);
    frame
}

pub fn read_frame(reader: &mut impl Read) -> io::Result<Envelope> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if !frame_len_ok(len) {
        return Err(invalid(format!("bad frame length {len}")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    let addr_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let Some(addr) = buf.get(2..2 + addr_len) else {
        return Err(invalid("sender address overruns frame"));
    };
    let from_addr = String::from_utf8(addr.to_vec()).map_err(invalid)?;
    let message = Message::decode(&buf[2 + addr_len..]).map_err(invalid)?;
    Ok(Envelope { from_addr, message })
}

fn frame_len_ok(len: usize) -> bool {
    (2..=MAX_FRAME_LEN).contains(&len)
}

fn invalid(err: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

/// Opens a connection to `addr` and writes one frame.
///
/// A frame the receiver would drop fails with `InvalidInput` before any
/// connection is made.
pub fn send_frame(addr: &str, frame: &[u8]) -> io::Result<()> {
    let len = frame.len().saturating_sub(4);
    if !frame_len_ok(len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame body of {len} bytes is outside the 2..={MAX_FRAME_LEN} byte limit"),
        ));
    }
    let target = resolve(addr)?;
    let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.write_all(frame)?;
    Ok(())
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {addr}")))
}

/// Accepts peer connections until `stop` is set. Each connection is read
/// on its own thread and the envelope forwarded to the worker.
pub fn spawn_listener(
    listener: TcpListener,
    tx: Sender<Envelope>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let local = listener.local_addr()?;
    thread::Builder::new()
        .name(format!("raft-net-listener-{local}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "dropped raft connection");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            debug!(addr = %local, "raft listener stopped");
        })
}

fn handle_connection(mut stream: TcpStream, tx: Sender<Envelope>) -> io::Result<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    let envelope = read_frame(&mut stream)?;
    tx.send(envelope)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))
}

/// Unblocks a listener parked in `accept` so it can observe its stop flag.
pub fn wake_listener(addr: SocketAddr) {
    let _ = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT);
}
