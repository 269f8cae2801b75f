//! Sysfs backlight driver.
//!
//! Thin by intent: the daemon's job here is routing and smoothing, the
//! kernel does the rest through /sys/class/backlight.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::smooth::Ramp;

/// Smoothing defaults applied when the caller passes zeros.
pub const DEFAULT_STEP_PERCENT: f64 = 0.05;
pub const DEFAULT_TIMEOUT_MS: u32 = 100;

#[derive(Error, Debug)]
pub enum BacklightError {
    #[error("no backlight device found")]
    NotFound,
    #[error("backlight i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unreadable backlight attribute {attr}: {value:?}")]
    Invalid { attr: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Backlight {
    pub name: String,
    syspath: PathBuf,
    pub max: i32,
}

fn read_attr(syspath: &std::path::Path, attr: &'static str) -> Result<i32, BacklightError> {
    let raw = std::fs::read_to_string(syspath.join(attr))?;
    raw.trim()
        .parse()
        .map_err(|_| BacklightError::Invalid {
            attr,
            value: raw.trim().to_string(),
        })
}

impl Backlight {
    fn from_device(device: &udev::Device) -> Result<Self, BacklightError> {
        let syspath = device.syspath().to_path_buf();
        let max = read_attr(&syspath, "max_brightness")?;
        Ok(Self {
            name: device.sysname().to_string_lossy().into_owned(),
            syspath,
            max,
        })
    }

    /// Find the backlight named `id`, or the first one when `id` is
    /// empty.
    pub fn resolve(id: &str) -> Result<Self, BacklightError> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("backlight")?;
        for device in enumerator.scan_devices()? {
            if !id.is_empty() && device.sysname().to_string_lossy() != id {
                continue;
            }
            return Self::from_device(&device);
        }
        Err(BacklightError::NotFound)
    }

    /// Every backlight on the system, for GetBrightness. A device with
    /// unreadable attributes is skipped, not fatal for the listing.
    pub fn all() -> Result<Vec<Self>, BacklightError> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("backlight")?;
        Ok(usable(
            enumerator.scan_devices()?.map(|d| Self::from_device(&d)),
        ))
    }

    pub fn level(&self) -> Result<i32, BacklightError> {
        read_attr(&self.syspath, "brightness")
    }

    pub fn percent(&self) -> Result<f64, BacklightError> {
        Ok(f64::from(self.level()?) / f64::from(self.max.max(1)))
    }

    pub fn set_level(&self, level: i32) -> Result<(), BacklightError> {
        let clamped = level.clamp(0, self.max);
        debug!("writing {} brightness {clamped}/{}", self.name, self.max);
        std::fs::write(self.syspath.join("brightness"), clamped.to_string())?;
        Ok(())
    }

    pub fn level_for(&self, percent: f64) -> i32 {
        (percent.clamp(0.0, 1.0) * f64::from(self.max)).round() as i32
    }
}

fn usable(
    candidates: impl IntoIterator<Item = Result<Backlight, BacklightError>>,
) -> Vec<Backlight> {
    let mut found = Vec::new();
    for candidate in candidates {
        match candidate {
            Ok(backlight) => found.push(backlight),
            Err(err) => warn!("skipping unreadable backlight: {err}"),
        }
    }
    found
}

/// An in-flight smooth brightness change, stepped by the dispatcher's
/// brightness timer.
pub struct BrightnessTransition {
    pub device: Backlight,
    pub ramp: Ramp,
    pub wait_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(max: i32) -> Backlight {
        Backlight {
            name: "test".into(),
            syspath: PathBuf::from("/nonexistent"),
            max,
        }
    }

    #[test]
    fn percent_maps_to_levels() {
        let b = fake(400);
        assert_eq!(b.level_for(0.0), 0);
        assert_eq!(b.level_for(0.5), 200);
        assert_eq!(b.level_for(1.0), 400);
        // Out-of-range input clamps instead of overdriving.
        assert_eq!(b.level_for(1.5), 400);
        assert_eq!(b.level_for(-0.2), 0);
    }

    #[test]
    fn listing_skips_unreadable_devices() {
        // One broken max_brightness must not hide the healthy devices.
        let broken = Err(BacklightError::Invalid {
            attr: "max_brightness",
            value: "garbage".into(),
        });
        let devices = usable(vec![Ok(fake(100)), broken, Ok(fake(200))]);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].max, 100);
        assert_eq!(devices[1].max, 200);
    }

    #[test]
    fn missing_device_reports_io_error() {
        let b = fake(100);
        assert!(matches!(b.level(), Err(BacklightError::Io(_))));
    }
}
