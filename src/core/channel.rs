//! One-directional framed JSON channels over pipes.
//!
//! A frame is a big-endian `u32` length followed by that many bytes of JSON.
//! Each worker owns two channels: tasks flow coordinator -> worker on one,
//! results flow back on the other. Delivery is FIFO.

use crate::config::types::{Result, SandboxError};
use crate::exec::function::Args;
use crate::value::{Namespace, Value, MAX_NESTING};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Largest frame either side will send or accept (64 MiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode `message` into a complete frame, or explain why it cannot cross
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| SandboxError::Transmission(format!("failed to encode message: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SandboxError::Transmission(format!(
            "message of {} bytes exceeds the {} byte frame limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writing end of a channel
pub struct FrameWriter {
    file: File,
}

impl FrameWriter {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let frame = encode_frame(message)?;
        self.send_frame(&frame)
    }

    /// Write an already encoded frame
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Reading end of a channel
pub struct FrameReader {
    file: File,
}

impl FrameReader {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Wait until a read would not block: data, EOF, or error is pending
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_readable(&self.file, timeout)
    }

    /// Read and decode one frame, blocking. `Ok(None)` on a clean EOF
    /// between frames.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        self.recv_frame()?.map(|body| decode_frame(&body)).transpose()
    }

    /// Read one frame body without decoding it.
    ///
    /// An error here leaves the stream unusable; a body that later fails to
    /// decode does not, the next frame starts right after it.
    pub fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            match self.file.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(SandboxError::Transmission(
                        "channel closed inside a frame header".to_string(),
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SandboxError::Transmission(format!(
                "incoming frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }
        let mut body = vec![0u8; len];
        self.file.read_exact(&mut body).map_err(|e| {
            SandboxError::Transmission(format!("channel closed inside a frame: {}", e))
        })?;
        Ok(Some(body))
    }
}

/// Decode a frame body read by [`FrameReader::recv_frame`]
pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| SandboxError::Transmission(format!("failed to decode message: {}", e)))
}

/// `poll(2)` a single descriptor for readability
pub fn poll_readable<Fd: AsFd>(fd: &Fd, timeout: Duration) -> io::Result<bool> {
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, millis) {
            Ok(ready) => return Ok(ready > 0),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reject values JSON cannot carry faithfully: non-finite floats, and
/// containers nested deeper than [`MAX_NESTING`]
pub fn ensure_transmissible(value: &Value) -> std::result::Result<(), String> {
    if value.nests_deeper_than(MAX_NESTING) {
        return Err(format!(
            "value is nested more than {} levels deep",
            MAX_NESTING
        ));
    }
    ensure_finite(value)
}

fn ensure_finite(value: &Value) -> std::result::Result<(), String> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(format!("float {} cannot be transmitted", f)),
        Value::List(items) => items.iter().try_for_each(ensure_finite),
        Value::Map(entries) => entries.values().try_for_each(ensure_finite),
        _ => Ok(()),
    }
}

pub fn ensure_namespace_transmissible(ns: &Namespace) -> std::result::Result<(), String> {
    for (name, value) in ns {
        ensure_transmissible(value).map_err(|reason| format!("{} (in '{}')", reason, name))?;
    }
    Ok(())
}

pub fn ensure_args_transmissible(args: &Args) -> std::result::Result<(), String> {
    args.positional
        .iter()
        .chain(args.keywords.values())
        .try_for_each(ensure_transmissible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fd::cloexec_pipe;

    #[test]
    fn frames_arrive_in_order() {
        let (read, write) = cloexec_pipe().unwrap();
        let mut writer = FrameWriter::new(write);
        let mut reader = FrameReader::new(read);

        writer.send(&Value::Int(1)).unwrap();
        writer.send(&Value::from("two")).unwrap();
        assert!(reader.wait_readable(Duration::from_millis(100)).unwrap());
        assert_eq!(reader.recv::<Value>().unwrap(), Some(Value::Int(1)));
        assert_eq!(reader.recv::<Value>().unwrap(), Some(Value::from("two")));

        drop(writer);
        assert_eq!(reader.recv::<Value>().unwrap(), None);
    }

    #[test]
    fn idle_channel_times_out() {
        let (read, _write) = cloexec_pipe().unwrap();
        let reader = FrameReader::new(read);
        assert!(!reader.wait_readable(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let (read, write) = cloexec_pipe().unwrap();
        let mut writer = FrameWriter::new(write);
        let mut reader = FrameReader::new(read);

        writer
            .send_frame(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .unwrap();
        assert!(matches!(
            reader.recv::<Value>(),
            Err(SandboxError::Transmission(_))
        ));
    }

    #[test]
    fn non_finite_floats_are_not_transmissible() {
        let nested = Value::List(vec![Value::Int(1), Value::Float(f64::NAN)]);
        assert!(ensure_transmissible(&nested).is_err());
        assert!(ensure_transmissible(&Value::Float(1.5)).is_ok());

        let mut ns = Namespace::new();
        ns.insert("x", Value::Float(f64::INFINITY));
        assert!(ensure_namespace_transmissible(&ns).unwrap_err().contains("'x'"));
    }

    #[test]
    fn deeply_nested_values_are_not_transmissible() {
        let mut value = Value::Int(0);
        for _ in 1..MAX_NESTING {
            value = Value::List(vec![value]);
        }
        assert!(ensure_transmissible(&value).is_ok());
        // The deepest value accepted must also decode on the other side.
        let frame = encode_frame(&value).unwrap();
        assert_eq!(decode_frame::<Value>(&frame[4..]).unwrap(), value);

        let too_deep = Value::List(vec![value]);
        let reason = ensure_transmissible(&too_deep).unwrap_err();
        assert!(reason.contains("nested"), "{}", reason);
    }

    #[test]
    fn undecodable_body_leaves_the_stream_aligned() {
        let (read, write) = cloexec_pipe().unwrap();
        let mut writer = FrameWriter::new(write);
        let mut reader = FrameReader::new(read);

        writer.send(&"not a value").unwrap();
        writer.send(&Value::Int(7)).unwrap();

        let body = reader.recv_frame().unwrap().unwrap();
        assert!(matches!(
            decode_frame::<Value>(&body),
            Err(SandboxError::Transmission(_))
        ));
        assert_eq!(reader.recv::<Value>().unwrap(), Some(Value::Int(7)));
    }
}
