//! Control protocol: line-delimited JSON over a Unix socket.
//!
//! Each connection carries one request and one response and is then
//! closed, except `Subscribe`, which parks the connection in the
//! subscriber list and feeds it hotplug notifications. The listener is
//! nonblocking so the dispatcher can drain every pending connection in
//! one pass.

use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::Uid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::sampler::MAX_CAPTURES;

/// How long a connected client gets to deliver its request or accept a
/// reply before the daemon gives up on it.
const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    SetGamma {
        #[serde(default)]
        display: String,
        #[serde(default)]
        xauthority: String,
        temperature: i32,
        #[serde(default)]
        smooth: bool,
        #[serde(default)]
        step: i32,
        #[serde(default)]
        timeout_ms: u32,
    },
    GetGamma {
        #[serde(default)]
        display: String,
        #[serde(default)]
        xauthority: String,
    },
    CaptureWebcam {
        #[serde(default)]
        device: String,
        captures: i64,
    },
    CaptureAls {
        #[serde(default)]
        device: String,
        captures: i64,
    },
    CaptureSensor {
        #[serde(default)]
        device: String,
        captures: i64,
    },
    IsWebcamAvailable {
        #[serde(default)]
        device: String,
    },
    IsAlsAvailable {
        #[serde(default)]
        device: String,
    },
    IsSensorAvailable {
        #[serde(default)]
        device: String,
    },
    SetBrightness {
        #[serde(default)]
        device: String,
        percent: f64,
        #[serde(default)]
        smooth: bool,
        #[serde(default)]
        step: f64,
        #[serde(default)]
        timeout_ms: u32,
    },
    GetBrightness {
        #[serde(default)]
        device: String,
    },
    Version,
    Subscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "temperature")]
    Temperature { temperature: i32 },
    #[serde(rename = "capture")]
    Capture {
        device: String,
        samples: Vec<f64>,
        average: f64,
        decoded: usize,
    },
    #[serde(rename = "availability")]
    Availability { device: String, available: bool },
    #[serde(rename = "brightness")]
    Brightness { levels: Vec<(String, f64)> },
    #[serde(rename = "version")]
    Version { version: String },
    #[serde(rename = "subscribed")]
    Subscribed,
    #[serde(rename = "error")]
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Notification {
    WebcamChanged { device: String, action: String },
    AlsChanged { device: String, action: String },
    SensorChanged { device: String, action: String },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(#[from] serde_json::Error),
}

/// The caller contract for capture requests, checked before any device
/// is touched.
pub fn captures_in_bounds(captures: i64) -> bool {
    (1..=MAX_CAPTURES as i64).contains(&captures)
}

pub fn read_request(stream: &UnixStream) -> Result<Request, ClientError> {
    stream.set_read_timeout(Some(CLIENT_IO_TIMEOUT))?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    Ok(serde_json::from_str(line.trim())?)
}

pub fn send<T: Serialize>(stream: &mut UnixStream, message: &T) -> std::io::Result<()> {
    stream.set_write_timeout(Some(CLIENT_IO_TIMEOUT))?;
    let mut payload = serde_json::to_string(message).map_err(std::io::Error::other)?;
    payload.push('\n');
    stream.write_all(payload.as_bytes())?;
    stream.flush()
}

pub struct RpcServer {
    listener: UnixListener,
    path: PathBuf,
    subscribers: Vec<UnixStream>,
}

impl RpcServer {
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        // A stale socket from a previous run would make bind fail.
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            subscribers: Vec::new(),
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    /// One nonblocking accept; `None` means the pending backlog is
    /// drained.
    pub fn accept(&self) -> std::io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Peer credential check: root and the daemon's own uid may talk to
    /// us, anyone else is turned away before their request is parsed.
    pub fn authorized(stream: &UnixStream) -> bool {
        match getsockopt(stream, PeerCredentials) {
            Ok(creds) => {
                let peer = Uid::from_raw(creds.uid());
                peer.is_root() || peer == Uid::effective()
            }
            Err(err) => {
                warn!("peer credential check failed: {err}");
                false
            }
        }
    }

    pub fn subscribe(&mut self, stream: UnixStream) {
        debug!("new notification subscriber");
        self.subscribers.push(stream);
    }

    /// Push a notification line to every subscriber, dropping the ones
    /// that went away.
    pub fn notify(&mut self, notification: &Notification) {
        self.subscribers
            .retain_mut(|stream| match send(stream, notification) {
                Ok(()) => true,
                Err(err) => {
                    debug!("dropping subscriber: {err}");
                    false
                }
            });
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_bounds() {
        assert!(!captures_in_bounds(-3));
        assert!(!captures_in_bounds(0));
        assert!(captures_in_bounds(1));
        assert!(captures_in_bounds(20));
        assert!(!captures_in_bounds(21));
    }

    #[test]
    fn requests_parse_from_wire_form() {
        let req: Request = serde_json::from_str(
            r#"{"method":"SetGamma","temperature":4500,"smooth":true,"step":50,"timeout_ms":300}"#,
        )
        .unwrap();
        match req {
            Request::SetGamma {
                display,
                temperature,
                smooth,
                step,
                ..
            } => {
                assert_eq!(display, "");
                assert_eq!(temperature, 4500);
                assert!(smooth);
                assert_eq!(step, 50);
            }
            other => panic!("parsed {other:?}"),
        }

        let req: Request =
            serde_json::from_str(r#"{"method":"CaptureWebcam","captures":5}"#).unwrap();
        assert!(matches!(
            req,
            Request::CaptureWebcam { captures: 5, ref device } if device.is_empty()
        ));

        let req: Request = serde_json::from_str(r#"{"method":"Version"}"#).unwrap();
        assert!(matches!(req, Request::Version));
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"method":"Reboot"}"#).is_err());
    }

    #[test]
    fn responses_serialize_with_type_tag() {
        let json = serde_json::to_string(&Response::Temperature { temperature: 6500 }).unwrap();
        assert_eq!(json, r#"{"type":"temperature","temperature":6500}"#);

        let json = serde_json::to_string(&Response::error("nope")).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"nope"}"#);
    }

    #[test]
    fn notifications_carry_node_and_action() {
        let json = serde_json::to_string(&Notification::WebcamChanged {
            device: "/dev/video0".into(),
            action: "add".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"event":"WebcamChanged","device":"/dev/video0","action":"add"}"#
        );
    }
}
