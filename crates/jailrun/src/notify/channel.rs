//! Enforcement channel: the external tool process and its wire protocol.
//!
//! The tool runs outside the sandbox as a direct child of the runner. Its
//! stdin carries [`ToolMessage`] frames, its stdout carries
//! [`VerdictMessage`] frames, and its stderr is inherited.
//!
//! ## Framing
//!
//! ```text
//! ┌──────────────────┬─────────────────────────────┐
//! │ length: u32 (BE) │ MessagePack body (≤ 1 MiB)   │
//! └──────────────────┴─────────────────────────────┘
//! ```
//!
//! Bodies are encoded with named fields so tools in any language can decode
//! them as maps.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::event::PolicyEvent;
use crate::error::ChannelError;
use crate::request::ToolSpec;

/// Protocol version announced in [`ToolMessage::Hello`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame body.
pub const MAX_FRAME: usize = 1 << 20;

/// Decision of the enforcement tool for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason")]
pub enum PolicyVerdict {
    Allow,
    Deny(String),
    Terminate(String),
}

impl PolicyVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyVerdict::Allow)
    }
}

/// Runner → tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolMessage {
    /// Sent once, before any event.
    Hello {
        version: u32,
        session: String,
        pid: u32,
    },
    Event(PolicyEvent),
}

/// Tool → runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictMessage {
    pub tid: u32,
    pub seq: u64,
    pub verdict: PolicyVerdict,
}

/// Encode a message to msgpack.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack.
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

/// Write one length-prefixed frame and flush.
pub fn write_frame<W: Write, T: Serialize>(out: &mut W, msg: &T) -> Result<(), ChannelError> {
    let body = encode(msg)?;
    if body.len() > MAX_FRAME {
        return Err(ChannelError::FrameTooLarge(body.len()));
    }
    out.write_all(&(body.len() as u32).to_be_bytes())?;
    out.write_all(&body)?;
    out.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean EOF between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(input: &mut R) -> Result<Option<T>, ChannelError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match input.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(ChannelError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    input.read_exact(&mut body)?;
    Ok(Some(decode(&body)?))
}

/// Serialized writer half, shared by every bridge worker.
#[derive(Debug)]
pub struct EventSender {
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
}

impl EventSender {
    pub fn send(&self, msg: &ToolMessage) -> Result<(), ChannelError> {
        let mut guard = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let out = guard.as_mut().ok_or(ChannelError::Closed)?;
        write_frame(out, msg)
    }

    /// Close the tool's stdin unless a send is in progress. Later sends fail
    /// with [`ChannelError::Closed`]. Returns whether stdin is closed.
    pub fn close(&self) -> bool {
        let mut guard = match self.stdin.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        guard.take();
        true
    }
}

/// Reader half, owned by the bridge's reader thread.
#[derive(Debug)]
pub struct VerdictReader {
    stdout: BufReader<ChildStdout>,
}

impl VerdictReader {
    /// Next verdict, or `None` when the tool closed its stdout.
    pub fn recv(&mut self) -> Result<Option<VerdictMessage>, ChannelError> {
        read_frame(&mut self.stdout)
    }
}

/// A running enforcement tool.
#[derive(Debug)]
pub struct ToolChannel {
    child: Child,
    sender: Arc<EventSender>,
    reader: Option<VerdictReader>,
}

impl ToolChannel {
    /// Spawn the tool in its own process group.
    pub fn spawn(spec: &ToolSpec) -> Result<Self, ChannelError> {
        let mut child = Command::new(&spec.path)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|source| ChannelError::Spawn {
                path: spec.path.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ChannelError::Closed);
        };

        tracing::debug!(tool = %spec.path.display(), pid = child.id(), "enforcement tool started");
        Ok(Self {
            child,
            sender: Arc::new(EventSender {
                stdin: Mutex::new(Some(BufWriter::new(stdin))),
            }),
            reader: Some(VerdictReader {
                stdout: BufReader::new(stdout),
            }),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn sender(&self) -> Arc<EventSender> {
        Arc::clone(&self.sender)
    }

    pub fn take_reader(&mut self) -> Option<VerdictReader> {
        self.reader.take()
    }

    /// Close stdin, give the tool `grace` to exit, then kill it. Always reaps.
    ///
    /// A send blocked on a tool that stopped reading keeps stdin locked; the
    /// tool is then killed, which fails the send.
    pub fn shutdown(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.sender.close() {
            if Instant::now() >= deadline {
                tracing::warn!(pid = self.child.id(), "enforcement tool stopped reading, killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid = self.child.id(), %status, "enforcement tool exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) | Err(_) => break,
            }
        }
        tracing::warn!(pid = self.child.id(), "enforcement tool did not exit, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
