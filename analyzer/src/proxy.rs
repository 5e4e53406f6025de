//! Live dump delivery from a core device analyzer proxy.
//!
//! [`Receiver`] handles one TCP connection and hands complete raw dumps to a
//! channel; [`ProxyClient`] wraps it in a reconnecting worker thread so a
//! long-lived consumer survives proxy restarts and address changes.

use std::io::Read;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel as channel;
use log::{debug, info, warn};

use crate::dump::Endianness;

pub const MAGIC: &[u8] = b"ARTIQ Analyzer Proxy\n";

/// Upper bound on a single dump payload; anything larger means the stream is
/// corrupt or not an analyzer proxy at all.
const MAX_DUMP_SIZE: u32 = 10 * 512 * 1024;

/// Dump header bytes that follow the endianness tag and the payload length.
const HEADER_TRAILER_SIZE: usize = 11;

/// Bound on connect + magic-line handshake; keeps the reconnect worker
/// responsive to address updates while an endpoint is unreachable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn read_dumps(mut stream: impl Read, dumps: &channel::Sender<Vec<u8>>) -> Result<()> {
    loop {
        let mut endian_byte = [0u8; 1];
        if stream.read(&mut endian_byte)? == 0 {
            // Orderly shutdown between frames.
            return Ok(());
        }
        let endianness = Endianness::from_tag(endian_byte[0])?;
        let mut length_bytes = [0u8; 4];
        stream.read_exact(&mut length_bytes)?;
        let payload_length = endianness.read_u32(&length_bytes);
        if payload_length > MAX_DUMP_SIZE {
            bail!("analyzer dump is too large ({payload_length} bytes)");
        }

        // Reassemble the frame into the self-contained dump format the
        // decoder takes: tag, length, remaining header, payload.
        let mut dump = Vec::with_capacity(5 + HEADER_TRAILER_SIZE + payload_length as usize);
        dump.push(endian_byte[0]);
        dump.extend_from_slice(&length_bytes);
        let header_end = dump.len();
        dump.resize(header_end + HEADER_TRAILER_SIZE + payload_length as usize, 0);
        stream.read_exact(&mut dump[header_end..])?;

        debug!("received analyzer dump ({} bytes)", dump.len());
        if dumps.send(dump).is_err() {
            // Consumer is gone.
            return Ok(());
        }
    }
}

/// One connection to an analyzer proxy.
pub struct Receiver {
    stream: TcpStream,
    dumps: channel::Receiver<Vec<u8>>,
    thread: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Connect and check the magic line. Both the connection attempt and the
    /// handshake read are bounded by `timeout`; once connected, waiting for
    /// dumps is unbounded.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Receiver> {
        let socket_addr = addr
            .to_socket_addrs()
            .with_context(|| format!("resolving analyzer proxy address {addr}"))?
            .next()
            .with_context(|| format!("analyzer proxy address {addr} resolves to nothing"))?;
        let mut stream = TcpStream::connect_timeout(&socket_addr, timeout)
            .with_context(|| format!("connecting to analyzer proxy at {addr}"))?;
        stream.set_read_timeout(Some(timeout))?;
        let mut magic = [0u8; MAGIC.len()];
        stream
            .read_exact(&mut magic)
            .context("reading analyzer proxy magic")?;
        if magic != *MAGIC {
            bail!("{addr} is not an analyzer proxy");
        }
        stream.set_read_timeout(None)?;
        info!("connected to analyzer proxy at {addr}");

        let reader = stream.try_clone().context("cloning proxy socket")?;
        let (sender, dumps) = channel::unbounded();
        let thread = thread::spawn(move || {
            if let Err(error) = read_dumps(reader, &sender) {
                warn!("analyzer proxy receive loop failed: {error:#}");
            }
        });
        Ok(Receiver {
            stream,
            dumps,
            thread: Some(thread),
        })
    }

    /// Channel on which complete raw dumps arrive. Disconnects when the
    /// connection is lost.
    pub fn dumps(&self) -> &channel::Receiver<Vec<u8>> {
        &self.dumps
    }

    /// Shut the socket down and join the receive thread; the shutdown
    /// unblocks a read in progress.
    pub fn close(mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Debug)]
enum Command {
    UpdateAddress(String),
    Close,
}

#[derive(Debug)]
pub enum Event {
    Connected,
    Disconnected,
    Dump(Vec<u8>),
}

/// Reconnecting proxy consumer.
///
/// Runs a worker thread that keeps one connection to the most recently given
/// address, retrying with exponential backoff after failures. An address
/// update interrupts both an open connection and a backoff wait.
pub struct ProxyClient {
    commands: channel::Sender<Command>,
    events: channel::Receiver<Event>,
    thread: Option<JoinHandle<()>>,
}

impl ProxyClient {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> ProxyClient {
        let (commands, command_receiver) = channel::unbounded();
        let (event_sender, events) = channel::unbounded();
        let thread = thread::spawn(move || {
            worker(command_receiver, event_sender, initial_backoff, max_backoff)
        });
        ProxyClient {
            commands,
            events,
            thread: Some(thread),
        }
    }

    pub fn update_address(&self, addr: &str) {
        let _ = self.commands.send(Command::UpdateAddress(addr.to_string()));
    }

    pub fn events(&self) -> &channel::Receiver<Event> {
        &self.events
    }

    pub fn close(mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker(
    commands: channel::Receiver<Command>,
    events: channel::Sender<Event>,
    initial_backoff: Duration,
    max_backoff: Duration,
) {
    let mut address: Option<String> = None;
    let mut backoff = initial_backoff;
    loop {
        let Some(addr) = address.clone() else {
            // Nothing to connect to yet; block until told where to go.
            match commands.recv() {
                Ok(Command::UpdateAddress(new_address)) => {
                    address = Some(new_address);
                    backoff = initial_backoff;
                }
                Ok(Command::Close) | Err(_) => return,
            }
            continue;
        };

        match Receiver::connect(&addr, CONNECT_TIMEOUT) {
            Ok(receiver) => {
                backoff = initial_backoff;
                let _ = events.send(Event::Connected);
                let dumps = receiver.dumps().clone();
                let mut close_requested = false;
                loop {
                    channel::select! {
                        recv(dumps) -> dump => match dump {
                            Ok(dump) => {
                                let _ = events.send(Event::Dump(dump));
                            }
                            // Connection lost.
                            Err(_) => break,
                        },
                        recv(commands) -> command => match command {
                            Ok(Command::UpdateAddress(new_address)) => {
                                address = Some(new_address);
                                break;
                            }
                            Ok(Command::Close) | Err(_) => {
                                close_requested = true;
                                break;
                            }
                        },
                    }
                }
                receiver.close();
                if close_requested {
                    return;
                }
                let _ = events.send(Event::Disconnected);
            }
            Err(error) => {
                warn!(
                    "analyzer proxy connection to {addr} failed ({error:#}), \
                     retrying in {backoff:?}"
                );
                // Back off, but let a command cut the wait short.
                match commands.recv_timeout(backoff) {
                    Ok(Command::UpdateAddress(new_address)) => {
                        address = Some(new_address);
                        backoff = initial_backoff;
                    }
                    Ok(Command::Close) | Err(channel::RecvTimeoutError::Disconnected) => return,
                    Err(channel::RecvTimeoutError::Timeout) => {
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }
            }
        }
    }
}
