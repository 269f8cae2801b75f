//! XRandR gamma ramp control.
//!
//! Every call opens a fresh connection to the X server and drops it on
//! return; nothing is kept warm. Applying a temperature installs a
//! linear ramp scaled by the black-body channel ratios on every CRTC of
//! the default screen, best effort per output. Reading recovers an
//! approximate temperature from the first CRTC's ramp.

use thiserror::Error;
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::errors::{ConnectError, ConnectionError, ReplyError};
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use crate::color::{kelvin_to_rgb, rgb_to_kelvin};
use crate::smooth::Ramp;

/// Smoothing defaults applied when the caller passes zeros.
pub const DEFAULT_STEP_KELVIN: i32 = 50;
pub const DEFAULT_TIMEOUT_MS: u32 = 300;

#[derive(Error, Debug)]
pub enum GammaError {
    #[error("cannot connect to display: {0}")]
    Connect(#[from] ConnectError),
    #[error("display connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("display request failed: {0}")]
    Reply(#[from] ReplyError),
    #[error("no outputs available")]
    NoOutputs,
    #[error("gamma ramp carries no temperature information")]
    NoReading,
}

fn connect(display: &str) -> Result<(RustConnection, usize), GammaError> {
    let name = if display.is_empty() {
        None
    } else {
        Some(display)
    };
    Ok(x11rb::connect(name)?)
}

/// Linear ramp of `size` entries scaled by a per-channel ratio in [0, 1].
fn linear_ramp(size: u16, ratio: f64) -> Vec<u16> {
    (0..size)
        .map(|j| {
            let g = 65535.0 * f64::from(j) / f64::from(size);
            (g * ratio) as u16
        })
        .collect()
}

/// Install the gamma ramp for `temp` on every CRTC of the default
/// screen. Outputs are independent: a failing CRTC is logged and the
/// rest still get their ramp.
pub fn apply(display: &str, temp: i32) -> Result<(), GammaError> {
    let (conn, screen_num) = connect(display)?;
    let root = conn.setup().roots[screen_num].root;
    let resources = conn.randr_get_screen_resources_current(root)?.reply()?;

    let (r, g, b) = kelvin_to_rgb(temp);
    let red_ratio = f64::from(r) / 255.0;
    let green_ratio = f64::from(g) / 255.0;
    let blue_ratio = f64::from(b) / 255.0;

    for crtc in resources.crtcs {
        let size = match conn.randr_get_crtc_gamma_size(crtc)?.reply() {
            Ok(reply) => reply.size,
            Err(err) => {
                warn!("gamma size query for crtc {crtc} failed: {err}");
                continue;
            }
        };
        if size == 0 {
            continue;
        }
        let red = linear_ramp(size, red_ratio);
        let green = linear_ramp(size, green_ratio);
        let blue = linear_ramp(size, blue_ratio);
        if let Err(err) = conn
            .randr_set_crtc_gamma(crtc, &red, &green, &blue)?
            .check()
        {
            warn!("setting gamma on crtc {crtc} failed: {err}");
        }
    }
    conn.flush()?;
    // `display` is shadowed inside tracing macros by `tracing::field::display`
    let display_name = display;
    debug!("applied {temp}K on display {display_name:?}");
    Ok(())
}

/// Recover the temperature from the first CRTC's installed ramp.
pub fn read(display: &str) -> Result<i32, GammaError> {
    let (conn, screen_num) = connect(display)?;
    let root = conn.setup().roots[screen_num].root;
    let resources = conn.randr_get_screen_resources_current(root)?.reply()?;
    let crtc = *resources.crtcs.first().ok_or(GammaError::NoOutputs)?;

    let gamma = conn.randr_get_crtc_gamma(crtc)?.reply()?;
    // Entry 0 is zero on a linear ramp; entry 1 carries the scaled
    // channel value.
    let r = gamma.red.get(1).copied().ok_or(GammaError::NoReading)?.min(255);
    let b = gamma.blue.get(1).copied().ok_or(GammaError::NoReading)?.min(255);

    let temp = rgb_to_kelvin(r, b);
    if temp <= 0 {
        return Err(GammaError::NoReading);
    }
    Ok(temp)
}

/// An in-flight smooth temperature change, stepped by the dispatcher's
/// gamma timer.
pub struct GammaTransition {
    pub display: String,
    pub ramp: Ramp,
    pub wait_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_is_monotone_and_bounded() {
        let ramp = linear_ramp(256, 1.0);
        assert_eq!(ramp[0], 0);
        for pair in ramp.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(*ramp.last().unwrap() <= u16::MAX);
    }

    #[test]
    fn ramp_scales_by_ratio() {
        let full = linear_ramp(64, 1.0);
        let half = linear_ramp(64, 0.5);
        for (f, h) in full.iter().zip(&half) {
            assert!((i32::from(*f) / 2 - i32::from(*h)).abs() <= 1);
        }
    }

    #[test]
    fn zero_ratio_yields_flat_ramp() {
        assert!(linear_ramp(32, 0.0).iter().all(|v| *v == 0));
    }
}
