//! The daemon's only long-lived loop: a single-threaded poll multiplexer
//! over the control socket, signalfd, the two smoothing timerfds and the
//! two hotplug monitors.
//!
//! Handlers run inline and may block on hardware (gamma round-trips, the
//! per-frame dequeue). While one does, everything else waits; that is a
//! deliberate simplicity trade-off. Within one wake-up, sources are
//! serviced in fixed priority order and each handler's verdict is
//! checked before the next one runs, so shutdown is honored mid-scan.

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::{debug, error, info, warn};

use crate::backlight::{self, Backlight, BrightnessTransition};
use crate::rpc::{self, Notification, Request, Response, RpcServer};
use crate::sampler::SampleSet;
use crate::sensor::{self, HotplugMonitor, SensorClass, SensorDevice};
use crate::smooth::Ramp;

#[cfg(feature = "gamma")]
use crate::color;
#[cfg(feature = "gamma")]
use crate::gamma::{self, GammaTransition};

/// What a handler tells the loop: keep going, or stop with the exit
/// condition the process should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Shutdown,
    Fatal,
}

/// Wake sources in dispatch priority order.
#[derive(Debug, Clone, Copy)]
enum SourceKind {
    Rpc,
    Signal,
    BrightSmooth,
    #[cfg(feature = "gamma")]
    GammaSmooth,
    WebcamMonitor,
    AlsMonitor,
}

/// Service the ready sources of one wake-up in priority order.
///
/// `remaining` is the ready count poll reported; the scan stops once
/// every ready source has been handled. A non-`Continue` verdict ends
/// the scan immediately, so later-priority sources of the same wake-up
/// are skipped once a handler asks for shutdown.
fn scan_ready<K, H>(
    sources: impl IntoIterator<Item = (K, bool)>,
    mut remaining: i32,
    mut handle: H,
) -> Verdict
where
    H: FnMut(K) -> Verdict,
{
    for (kind, is_ready) in sources {
        if remaining <= 0 {
            break;
        }
        if !is_ready {
            continue;
        }
        remaining -= 1;
        match handle(kind) {
            Verdict::Continue => {}
            verdict => return verdict,
        }
    }
    Verdict::Continue
}

pub struct Daemon {
    rpc: RpcServer,
    signals: SignalFd,
    bright_timer: TimerFd,
    #[cfg(feature = "gamma")]
    gamma_timer: TimerFd,
    webcam_monitor: HotplugMonitor,
    als_monitor: HotplugMonitor,
    bright_transition: Option<BrightnessTransition>,
    #[cfg(feature = "gamma")]
    gamma_transition: Option<GammaTransition>,
}

fn new_timer() -> nix::Result<TimerFd> {
    TimerFd::new(
        ClockId::CLOCK_MONOTONIC,
        TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
    )
}

/// One-shot arm. Setting the timer also clears any pending expiration,
/// which is how tick handlers consume their wake-up.
fn arm(timer: &TimerFd, ms: u32) -> nix::Result<()> {
    timer.set(
        Expiration::OneShot(TimeSpec::from_duration(Duration::from_millis(u64::from(
            ms,
        )))),
        TimerSetTimeFlags::empty(),
    )
}

#[cfg(feature = "gamma")]
fn set_xauthority(path: &str) {
    if path.is_empty() {
        return;
    }
    // Single-threaded process, no concurrent readers of the environment.
    unsafe { std::env::set_var("XAUTHORITY", path) };
}

impl Daemon {
    pub fn new(socket: &Path) -> Result<Self> {
        let rpc = RpcServer::bind(socket)
            .with_context(|| format!("binding control socket {}", socket.display()))?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().context("blocking signals")?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .context("creating signalfd")?;

        let bright_timer = new_timer().context("creating brightness timer")?;
        #[cfg(feature = "gamma")]
        let gamma_timer = new_timer().context("creating gamma timer")?;

        let webcam_monitor =
            HotplugMonitor::new(SensorClass::Webcam).context("creating webcam monitor")?;
        let als_monitor = HotplugMonitor::new(SensorClass::Als).context("creating ALS monitor")?;

        Ok(Self {
            rpc,
            signals,
            bright_timer,
            #[cfg(feature = "gamma")]
            gamma_timer,
            webcam_monitor,
            als_monitor,
            bright_transition: None,
            #[cfg(feature = "gamma")]
            gamma_transition: None,
        })
    }

    fn sources(&self) -> Vec<(SourceKind, BorrowedFd<'_>)> {
        let mut sources = vec![
            (SourceKind::Rpc, self.rpc.fd()),
            (SourceKind::Signal, self.signals.as_fd()),
            (SourceKind::BrightSmooth, self.bright_timer.as_fd()),
        ];
        #[cfg(feature = "gamma")]
        sources.push((SourceKind::GammaSmooth, self.gamma_timer.as_fd()));
        sources.push((SourceKind::WebcamMonitor, self.webcam_monitor.fd()));
        sources.push((SourceKind::AlsMonitor, self.als_monitor.fd()));
        sources
    }

    /// Run until a handler reports shutdown. Returns the final verdict,
    /// never `Continue`.
    pub fn run(&mut self) -> Verdict {
        // The first control messages must be serviced before the first
        // blocking poll or early clients see connection timeouts.
        match self.drain_rpc() {
            Verdict::Continue => {}
            verdict => return verdict,
        }

        loop {
            let kinds: Vec<SourceKind>;
            let ready: Vec<bool>;
            let ready_count: i32;
            {
                let sources = self.sources();
                kinds = sources.iter().map(|(kind, _)| *kind).collect();
                let mut fds: Vec<PollFd> = sources
                    .iter()
                    .map(|(_, fd)| PollFd::new(*fd, PollFlags::POLLIN))
                    .collect();
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(n) => {
                        ready_count = n;
                        ready = fds
                            .iter()
                            .map(|fd| {
                                fd.revents().is_some_and(|flags| {
                                    flags.intersects(
                                        PollFlags::POLLIN
                                            | PollFlags::POLLERR
                                            | PollFlags::POLLHUP,
                                    )
                                })
                            })
                            .collect();
                    }
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        error!("poll failed: {err}");
                        return Verdict::Fatal;
                    }
                }
            }

            match scan_ready(kinds.into_iter().zip(ready), ready_count, |kind| {
                self.dispatch(kind)
            }) {
                Verdict::Continue => {}
                verdict => return verdict,
            }
        }
    }

    fn dispatch(&mut self, kind: SourceKind) -> Verdict {
        match kind {
            SourceKind::Rpc => self.drain_rpc(),
            SourceKind::Signal => self.handle_signal(),
            SourceKind::BrightSmooth => self.brightness_tick(),
            #[cfg(feature = "gamma")]
            SourceKind::GammaSmooth => self.gamma_tick(),
            SourceKind::WebcamMonitor => self.hotplug(SensorClass::Webcam),
            SourceKind::AlsMonitor => self.hotplug(SensorClass::Als),
        }
    }

    /// Accept and service every pending control connection.
    fn drain_rpc(&mut self) -> Verdict {
        loop {
            match self.rpc.accept() {
                Ok(Some(stream)) => self.serve_client(stream),
                Ok(None) => return Verdict::Continue,
                Err(err) => {
                    error!("accepting control connection failed: {err}");
                    return Verdict::Fatal;
                }
            }
        }
    }

    fn serve_client(&mut self, mut stream: UnixStream) {
        if !RpcServer::authorized(&stream) {
            let _ = rpc::send(&mut stream, &Response::error("permission denied"));
            return;
        }
        let request = match rpc::read_request(&stream) {
            Ok(request) => request,
            Err(err) => {
                debug!("rejecting malformed request: {err}");
                let _ = rpc::send(&mut stream, &Response::error(format!("invalid request: {err}")));
                return;
            }
        };
        let keep_open = matches!(request, Request::Subscribe);
        let response = self.handle_request(request);
        if rpc::send(&mut stream, &response).is_err() {
            return;
        }
        if keep_open {
            self.rpc.subscribe(stream);
        }
    }

    fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::Version => Response::Version {
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            Request::Subscribe => Response::Subscribed,
            Request::SetGamma {
                display,
                xauthority,
                temperature,
                smooth,
                step,
                timeout_ms,
            } => self.set_gamma(display, xauthority, temperature, smooth, step, timeout_ms),
            Request::GetGamma {
                display,
                xauthority,
            } => Self::get_gamma(&display, &xauthority),
            Request::CaptureWebcam { device, captures } => {
                self.capture(Some(SensorClass::Webcam), &device, captures)
            }
            Request::CaptureAls { device, captures } => {
                self.capture(Some(SensorClass::Als), &device, captures)
            }
            Request::CaptureSensor { device, captures } => self.capture(None, &device, captures),
            Request::IsWebcamAvailable { device } => {
                Self::availability(Some(SensorClass::Webcam), &device)
            }
            Request::IsAlsAvailable { device } => {
                Self::availability(Some(SensorClass::Als), &device)
            }
            Request::IsSensorAvailable { device } => Self::availability(None, &device),
            Request::SetBrightness {
                device,
                percent,
                smooth,
                step,
                timeout_ms,
            } => self.set_brightness(&device, percent, smooth, step, timeout_ms),
            Request::GetBrightness { device } => Self::get_brightness(&device),
        }
    }

    #[cfg(feature = "gamma")]
    fn set_gamma(
        &mut self,
        display: String,
        xauthority: String,
        temperature: i32,
        smooth: bool,
        step: i32,
        timeout_ms: u32,
    ) -> Response {
        if !(color::TEMP_MIN..=color::TEMP_MAX).contains(&temperature) {
            return Response::error("temperature must be between 1000 and 10000");
        }
        set_xauthority(&xauthority);

        // A new request supersedes any transition still in flight.
        self.gamma_transition = None;
        let _ = self.gamma_timer.unset();

        if !smooth {
            return match gamma::apply(&display, temperature) {
                Ok(()) => Response::Ok,
                Err(err) => Response::error(err.to_string()),
            };
        }

        let current = gamma::read(&display).unwrap_or(6500);
        let step = if step > 0 {
            step
        } else {
            gamma::DEFAULT_STEP_KELVIN
        };
        let wait_ms = if timeout_ms > 0 {
            timeout_ms
        } else {
            gamma::DEFAULT_TIMEOUT_MS
        };
        self.gamma_transition = Some(GammaTransition {
            display,
            ramp: Ramp::new(current, temperature, step),
            wait_ms,
        });
        match arm(&self.gamma_timer, wait_ms) {
            Ok(()) => Response::Ok,
            Err(err) => {
                self.gamma_transition = None;
                Response::error(format!("arming gamma timer failed: {err}"))
            }
        }
    }

    #[cfg(not(feature = "gamma"))]
    fn set_gamma(
        &mut self,
        _display: String,
        _xauthority: String,
        _temperature: i32,
        _smooth: bool,
        _step: i32,
        _timeout_ms: u32,
    ) -> Response {
        Response::error("gamma support not compiled in")
    }

    #[cfg(feature = "gamma")]
    fn get_gamma(display: &str, xauthority: &str) -> Response {
        set_xauthority(xauthority);
        match gamma::read(display) {
            Ok(temperature) => Response::Temperature { temperature },
            Err(err) => Response::error(err.to_string()),
        }
    }

    #[cfg(not(feature = "gamma"))]
    fn get_gamma(_display: &str, _xauthority: &str) -> Response {
        Response::error("gamma support not compiled in")
    }

    #[cfg(feature = "gamma")]
    fn gamma_tick(&mut self) -> Verdict {
        let Some(transition) = self.gamma_transition.as_mut() else {
            let _ = self.gamma_timer.unset();
            return Verdict::Continue;
        };
        let temperature = transition.ramp.advance();
        if let Err(err) = gamma::apply(&transition.display, temperature) {
            warn!("gamma transition aborted at {temperature}K: {err}");
            self.gamma_transition = None;
            let _ = self.gamma_timer.unset();
            return Verdict::Continue;
        }
        if transition.ramp.finished() {
            debug!("gamma transition reached {temperature}K");
            self.gamma_transition = None;
            let _ = self.gamma_timer.unset();
        } else if let Err(err) = arm(&self.gamma_timer, transition.wait_ms) {
            warn!("rearming gamma timer failed: {err}");
            self.gamma_transition = None;
        }
        Verdict::Continue
    }

    fn brightness_tick(&mut self) -> Verdict {
        let Some(transition) = self.bright_transition.as_mut() else {
            let _ = self.bright_timer.unset();
            return Verdict::Continue;
        };
        let level = transition.ramp.advance();
        if let Err(err) = transition.device.set_level(level) {
            warn!("brightness transition aborted at level {level}: {err}");
            self.bright_transition = None;
            let _ = self.bright_timer.unset();
            return Verdict::Continue;
        }
        if transition.ramp.finished() {
            debug!("brightness transition reached level {level}");
            self.bright_transition = None;
            let _ = self.bright_timer.unset();
        } else if let Err(err) = arm(&self.bright_timer, transition.wait_ms) {
            warn!("rearming brightness timer failed: {err}");
            self.bright_transition = None;
        }
        Verdict::Continue
    }

    fn handle_signal(&mut self) -> Verdict {
        match self.signals.read_signal() {
            Ok(Some(info)) => {
                info!("received signal {}, leaving", info.ssi_signo);
                Verdict::Shutdown
            }
            Ok(None) => Verdict::Continue,
            Err(err) => {
                warn!("reading signalfd failed: {err}");
                Verdict::Shutdown
            }
        }
    }

    /// Drain one hotplug event and fan it out as a class-specific plus a
    /// generic notification.
    fn hotplug(&mut self, class: SensorClass) -> Verdict {
        let event = match class {
            SensorClass::Webcam => self.webcam_monitor.next_event(),
            SensorClass::Als => self.als_monitor.next_event(),
        };
        if let Some(event) = event {
            info!("{} {}: {}", class.label(), event.action, event.node);
            let action = event.action.to_string();
            let specific = match class {
                SensorClass::Webcam => Notification::WebcamChanged {
                    device: event.node.clone(),
                    action: action.clone(),
                },
                SensorClass::Als => Notification::AlsChanged {
                    device: event.node.clone(),
                    action: action.clone(),
                },
            };
            self.rpc.notify(&specific);
            self.rpc.notify(&Notification::SensorChanged {
                device: event.node,
                action,
            });
        }
        Verdict::Continue
    }

    fn capture(&mut self, class: Option<SensorClass>, device: &str, captures: i64) -> Response {
        if !rpc::captures_in_bounds(captures) {
            return Response::error("number of captures must be between 1 and 20");
        }
        let count = captures as usize;

        let (class, device) = match class {
            Some(class) => match sensor::resolve(class, device) {
                Ok(resolved) => (class, resolved),
                Err(err) => return Response::error(err.to_string()),
            },
            None => match Self::first_capturable(device) {
                Ok(pair) => pair,
                Err(message) => return Response::error(message),
            },
        };

        let result = match class {
            SensorClass::Webcam => Self::capture_webcam(&device, count),
            SensorClass::Als => {
                sensor::sample_als(&device, count).map_err(|err| err.to_string())
            }
        };
        match result {
            Ok(samples) => {
                info!(
                    "{} captures from {}: average brightness {:.4} ({} decoded)",
                    count,
                    device.node,
                    samples.average(),
                    samples.decoded()
                );
                Response::Capture {
                    device: device.node,
                    samples: samples.normalized(),
                    average: samples.average(),
                    decoded: samples.decoded(),
                }
            }
            Err(message) => Response::error(message),
        }
    }

    #[cfg(feature = "capture")]
    fn capture_webcam(device: &SensorDevice, count: usize) -> Result<SampleSet, String> {
        crate::capture::sample_frames(Path::new(&device.node), count)
            .map_err(|err| err.to_string())
    }

    #[cfg(not(feature = "capture"))]
    fn capture_webcam(_device: &SensorDevice, _count: usize) -> Result<SampleSet, String> {
        Err("webcam capture support not compiled in".to_string())
    }

    /// First sensor class this build can actually capture from.
    fn first_capturable(device: &str) -> Result<(SensorClass, SensorDevice), String> {
        #[cfg(feature = "capture")]
        if let Ok(resolved) = sensor::resolve(SensorClass::Webcam, device) {
            return Ok((SensorClass::Webcam, resolved));
        }
        sensor::resolve(SensorClass::Als, device)
            .map(|resolved| (SensorClass::Als, resolved))
            .map_err(|err| err.to_string())
    }

    fn availability(class: Option<SensorClass>, device: &str) -> Response {
        let resolved = match class {
            Some(class) => sensor::resolve(class, device),
            None => sensor::resolve(SensorClass::Webcam, device)
                .or_else(|_| sensor::resolve(SensorClass::Als, device)),
        };
        match resolved {
            Ok(found) => Response::Availability {
                device: found.node,
                available: true,
            },
            Err(_) => Response::Availability {
                device: String::new(),
                available: false,
            },
        }
    }

    fn set_brightness(
        &mut self,
        device: &str,
        percent: f64,
        smooth: bool,
        step: f64,
        timeout_ms: u32,
    ) -> Response {
        if !(0.0..=1.0).contains(&percent) {
            return Response::error("brightness must be between 0.0 and 1.0");
        }
        let device = match Backlight::resolve(device) {
            Ok(device) => device,
            Err(err) => return Response::error(err.to_string()),
        };
        let target = device.level_for(percent);

        self.bright_transition = None;
        let _ = self.bright_timer.unset();

        if !smooth {
            return match device.set_level(target) {
                Ok(()) => Response::Ok,
                Err(err) => Response::error(err.to_string()),
            };
        }

        let current = match device.level() {
            Ok(level) => level,
            Err(err) => return Response::error(err.to_string()),
        };
        let step = if step > 0.0 {
            step
        } else {
            backlight::DEFAULT_STEP_PERCENT
        };
        let step_levels = ((step * f64::from(device.max)).round() as i32).max(1);
        let wait_ms = if timeout_ms > 0 {
            timeout_ms
        } else {
            backlight::DEFAULT_TIMEOUT_MS
        };
        self.bright_transition = Some(BrightnessTransition {
            device,
            ramp: Ramp::new(current, target, step_levels),
            wait_ms,
        });
        match arm(&self.bright_timer, wait_ms) {
            Ok(()) => Response::Ok,
            Err(err) => {
                self.bright_transition = None;
                Response::error(format!("arming brightness timer failed: {err}"))
            }
        }
    }

    fn get_brightness(device: &str) -> Response {
        let devices = if device.is_empty() {
            Backlight::all()
        } else {
            Backlight::resolve(device).map(|found| vec![found])
        };
        let devices = match devices {
            Ok(devices) if devices.is_empty() => {
                return Response::error("no backlight device found");
            }
            Ok(devices) => devices,
            Err(err) => return Response::error(err.to_string()),
        };
        let mut levels = Vec::with_capacity(devices.len());
        for device in devices {
            match device.percent() {
                Ok(percent) => levels.push((device.name, percent)),
                Err(err) => warn!("skipping backlight {}: {err}", device.name),
            }
        }
        Response::Brightness { levels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_scan(
        ready: &[bool],
        count: i32,
        verdicts: &[Verdict],
    ) -> (Vec<usize>, Verdict) {
        let mut handled = Vec::new();
        let verdict = scan_ready(
            ready.iter().copied().enumerate(),
            count,
            |i| {
                handled.push(i);
                verdicts[i]
            },
        );
        (handled, verdict)
    }

    #[test]
    fn earlier_source_is_serviced_before_a_later_shutdown() {
        // Sources 0 and 2 are ready; 2 asks for shutdown. 0 must still
        // run first.
        let verdicts = [
            Verdict::Continue,
            Verdict::Continue,
            Verdict::Shutdown,
            Verdict::Continue,
        ];
        let (handled, verdict) = run_scan(&[true, false, true, false], 2, &verdicts);
        assert_eq!(handled, vec![0, 2]);
        assert_eq!(verdict, Verdict::Shutdown);
    }

    #[test]
    fn shutdown_skips_remaining_ready_sources() {
        let verdicts = [Verdict::Shutdown, Verdict::Continue, Verdict::Continue];
        let (handled, verdict) = run_scan(&[true, true, true], 3, &verdicts);
        assert_eq!(handled, vec![0]);
        assert_eq!(verdict, Verdict::Shutdown);
    }

    #[test]
    fn fatal_ends_the_scan_like_shutdown() {
        let verdicts = [Verdict::Continue, Verdict::Fatal, Verdict::Continue];
        let (handled, verdict) = run_scan(&[true, true, true], 3, &verdicts);
        assert_eq!(handled, vec![0, 1]);
        assert_eq!(verdict, Verdict::Fatal);
    }

    #[test]
    fn scan_stops_once_the_ready_count_is_spent() {
        // poll reported two ready descriptors; the third flag is stale
        // and must not be dispatched.
        let verdicts = [Verdict::Continue; 3];
        let (handled, verdict) = run_scan(&[true, true, true], 2, &verdicts);
        assert_eq!(handled, vec![0, 1]);
        assert_eq!(verdict, Verdict::Continue);
    }

    #[test]
    fn all_continue_services_every_ready_source() {
        let verdicts = [Verdict::Continue; 4];
        let (handled, verdict) = run_scan(&[false, true, false, true], 2, &verdicts);
        assert_eq!(handled, vec![1, 3]);
        assert_eq!(verdict, Verdict::Continue);
    }
}
