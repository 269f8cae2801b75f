//! Sensor classes, udev enumeration and hotplug monitoring.
//!
//! Two classes exist: webcams (video4linux) and ambient light sensors
//! (iio devices carrying an illuminance channel). Each class owns one
//! udev monitor socket that the dispatcher polls.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::sampler::SampleSet;

/// Sysfs attribute names an iio light sensor may expose, in preference
/// order.
const ILLUMINANCE_ATTRS: &[&str] = &[
    "in_illuminance_input",
    "in_illuminance_raw",
    "in_illuminance0_input",
    "in_illuminance0_raw",
];

/// Illuminance that maps to a full-scale brightness sample.
const FULL_SCALE_LUX: f64 = 500.0;

const ALS_READ_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorClass {
    Webcam,
    Als,
}

impl SensorClass {
    pub fn subsystem(self) -> &'static str {
        match self {
            SensorClass::Webcam => "video4linux",
            SensorClass::Als => "iio",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SensorClass::Webcam => "webcam",
            SensorClass::Als => "ambient light sensor",
        }
    }
}

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("no matching {0} found")]
    NotFound(&'static str),
    #[error("udev error: {0}")]
    Udev(#[from] std::io::Error),
    #[error("device has no illuminance channel")]
    NoIlluminance,
}

/// A resolved sensor: the node handed back to callers plus the sysfs
/// path used for attribute reads.
#[derive(Debug, Clone)]
pub struct SensorDevice {
    pub node: String,
    pub syspath: PathBuf,
}

fn is_als_device(device: &udev::Device) -> bool {
    ILLUMINANCE_ATTRS
        .iter()
        .any(|attr| device.attribute_value(attr).is_some())
}

fn matches_id(device: &udev::Device, id: &str) -> bool {
    if id.is_empty() {
        return true;
    }
    device.sysname().to_string_lossy() == id
        || device
            .devnode()
            .is_some_and(|node| node == Path::new(id))
}

/// Find the sensor identified by `id`, or the first device of the class
/// when `id` is empty.
pub fn resolve(class: SensorClass, id: &str) -> Result<SensorDevice, SensorError> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem(class.subsystem())?;
    for device in enumerator.scan_devices()? {
        if class == SensorClass::Als && !is_als_device(&device) {
            continue;
        }
        if !matches_id(&device, id) {
            continue;
        }
        let node = device
            .devnode()
            .map(|n| n.display().to_string())
            .unwrap_or_else(|| device.syspath().display().to_string());
        debug!("resolved {} to {node}", class.label());
        return Ok(SensorDevice {
            node,
            syspath: device.syspath().to_path_buf(),
        });
    }
    Err(SensorError::NotFound(class.label()))
}

/// Read the illuminance channel `count` times. A failed read keeps its
/// zero slot, mirroring the webcam sampler's failed-frame contract.
pub fn sample_als(device: &SensorDevice, count: usize) -> Result<SampleSet, SensorError> {
    let attr = ILLUMINANCE_ATTRS
        .iter()
        .map(|name| device.syspath.join(name))
        .find(|path| path.exists())
        .ok_or(SensorError::NoIlluminance)?;

    let mut samples = SampleSet::new(count);
    for i in 0..count {
        if i > 0 {
            thread::sleep(ALS_READ_INTERVAL);
        }
        match std::fs::read_to_string(&attr) {
            Ok(raw) => match raw.trim().parse::<f64>() {
                Ok(lux) => {
                    let scaled = (lux / FULL_SCALE_LUX).clamp(0.0, 1.0) * 255.0;
                    samples.record(i, scaled);
                }
                Err(err) => warn!("unparsable illuminance reading {raw:?}: {err}"),
            },
            Err(err) => warn!("illuminance read {i} failed: {err}"),
        }
    }
    Ok(samples)
}

/// A hotplug event drained from a class monitor.
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub node: String,
    pub action: &'static str,
}

pub struct HotplugMonitor {
    class: SensorClass,
    socket: udev::MonitorSocket,
}

impl HotplugMonitor {
    pub fn new(class: SensorClass) -> Result<Self, SensorError> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem(class.subsystem())?
            .listen()?;
        Ok(Self { class, socket })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        // The socket outlives the borrow; it is owned by self.
        unsafe { BorrowedFd::borrow_raw(self.socket.as_raw_fd()) }
    }

    /// Drain one pending event. Events without a device node (iio
    /// trigger objects and the like) are swallowed.
    pub fn next_event(&mut self) -> Option<HotplugEvent> {
        let event = self.socket.iter().next()?;
        let action = match event.event_type() {
            udev::EventType::Add => "add",
            udev::EventType::Remove => "remove",
            udev::EventType::Change => "change",
            udev::EventType::Bind => "bind",
            udev::EventType::Unbind => "unbind",
            _ => "unknown",
        };
        let node = event.device().devnode()?.display().to_string();
        debug!("{} hotplug: {action} {node}", self.class.label());
        Some(HotplugEvent { node, action })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_subsystems() {
        assert_eq!(SensorClass::Webcam.subsystem(), "video4linux");
        assert_eq!(SensorClass::Als.subsystem(), "iio");
    }

    #[test]
    fn lux_scaling_saturates_at_full_scale() {
        let scaled = |lux: f64| (lux / FULL_SCALE_LUX).clamp(0.0, 1.0) * 255.0;
        assert_eq!(scaled(0.0), 0.0);
        assert!((scaled(250.0) - 127.5).abs() < 1e-12);
        assert_eq!(scaled(FULL_SCALE_LUX), 255.0);
        assert_eq!(scaled(10_000.0), 255.0);
    }
}
