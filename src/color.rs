//! Pure Kelvin <-> RGB channel mapping.
//!
//! The forward direction uses empirical black-body curve fits; the
//! coefficients are fixed constants and must not be tuned, since the
//! inverse search below relies on reproducing the exact channel values.

/// Valid color temperature range, inclusive.
pub const TEMP_MIN: i32 = 1000;
pub const TEMP_MAX: i32 = 10000;

/// Bisection safety cap. The inverse search terminates on exact channel
/// equality for pairs produced by [`kelvin_to_rgb`]; arbitrary hardware
/// ramps can fall between two achievable outputs, in which case the cap
/// turns the search into a best-effort nearest match.
const MAX_BISECTION_STEPS: u32 = 100;

fn clamp(x: f64, max: f64) -> u16 {
    if x > max {
        max as u16
    } else if x < 0.0 {
        0
    } else {
        x as u16
    }
}

fn get_red(temp: i32) -> u16 {
    if temp <= 6500 {
        return 255;
    }
    let a = 351.97690566805693;
    let b = 0.114206453784165;
    let c = -40.25366309332127;
    let x = (temp as f64 / 100.0) - 55.0;
    clamp(a + b * x + c * x.ln(), 255.0)
}

fn get_green(temp: i32) -> u16 {
    let (a, b, c, x) = if temp <= 6500 {
        (
            -155.25485562709179,
            -0.44596950469579133,
            104.49216199393888,
            (temp as f64 / 100.0) - 2.0,
        )
    } else {
        (
            325.4494125711974,
            0.07943456536662342,
            -28.0852963507957,
            (temp as f64 / 100.0) - 50.0,
        )
    };
    clamp(a + b * x + c * x.ln(), 255.0)
}

fn get_blue(temp: i32) -> u16 {
    if temp <= 1900 {
        return 0;
    }
    if temp < 6500 {
        let a = -254.76935184120902;
        let b = 0.8274096064007395;
        let c = 115.67994401066147;
        let x = (temp as f64 / 100.0) - 10.0;
        return clamp(a + b * x + c * x.ln(), 255.0);
    }
    255
}

/// Map a temperature in Kelvin to (red, green, blue), each in [0, 255].
pub fn kelvin_to_rgb(temp: i32) -> (u16, u16, u16) {
    (get_red(temp), get_green(temp), get_blue(temp))
}

/// Snap to the nearest multiple of 50 when it reproduces the same
/// red/blue pair. Cosmetic only.
fn round_to_50(temp: i32, r: u16, b: u16) -> i32 {
    if temp % 50 == 0 {
        return temp;
    }
    let down = temp - temp % 50;
    if get_red(down) == r && get_blue(down) == b {
        return down;
    }
    let up = down + 50;
    if get_red(up) == r && get_blue(up) == b {
        return up;
    }
    temp
}

/// Recover the temperature whose forward mapping produced the given
/// red/blue pair (green carries no extra information).
///
/// Bisects over Kelvin, narrowing by comparing the blue/red ratio of the
/// midpoint against the target ratio. Saturated channels tighten the
/// initial bounds: blue at 255 means at least 6500K, red at 255 means at
/// most 6500K.
pub fn rgb_to_kelvin(r: u16, b: u16) -> i32 {
    let mut min_temp = if b == 255 { 6500 } else { TEMP_MIN };
    let mut max_temp = if r == 255 { 6500 } else { TEMP_MAX };
    let mut temp = (max_temp + min_temp) / 2;

    for _ in 0..MAX_BISECTION_STEPS {
        temp = (max_temp + min_temp) / 2;
        let test_r = get_red(temp);
        let test_b = get_blue(temp);
        if test_r == r && test_b == b {
            return round_to_50(temp, r, b);
        }
        if f64::from(test_b) / f64::from(test_r) > f64::from(b) / f64::from(r) {
            max_temp = temp;
        } else {
            min_temp = temp;
        }
    }

    // Unreachable pair: the target ratio fell between two achievable
    // integer-temperature outputs. Report the last midpoint.
    temp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn red_saturated_up_to_6500() {
        for t in [TEMP_MIN, 1900, 3000, 6499, 6500] {
            assert_eq!(get_red(t), 255, "red at {t}K");
        }
    }

    #[test]
    fn blue_boundaries() {
        for t in [TEMP_MIN, 1500, 1900] {
            assert_eq!(get_blue(t), 0, "blue at {t}K");
        }
        for t in [6500, 8000, TEMP_MAX] {
            assert_eq!(get_blue(t), 255, "blue at {t}K");
        }
    }

    #[test]
    fn channels_always_in_range() {
        for t in (TEMP_MIN..=TEMP_MAX).step_by(10) {
            let (r, g, b) = kelvin_to_rgb(t);
            assert!(r <= 255 && g <= 255 && b <= 255, "out of range at {t}K");
        }
    }

    #[test]
    fn blue_monotone_between_branches() {
        let mut prev = get_blue(1901);
        for t in (1901..6500).step_by(7) {
            let cur = get_blue(t);
            assert!(cur >= prev, "blue regressed at {t}K");
            prev = cur;
        }
    }

    #[test]
    fn round_trip_reproduces_channel_pair() {
        // The recovered temperature need not equal the input (saturated
        // regions collapse many temperatures onto one pair, and the
        // 50-multiple snap may shift it), but it must map back to the
        // exact same red/blue values.
        for t in (TEMP_MIN..=TEMP_MAX).step_by(50) {
            let (r, _, b) = kelvin_to_rgb(t);
            let back = rgb_to_kelvin(r, b);
            assert!((TEMP_MIN..=TEMP_MAX).contains(&back));
            assert_eq!(get_red(back), r, "red mismatch for {t}K -> {back}K");
            assert_eq!(get_blue(back), b, "blue mismatch for {t}K -> {back}K");
        }
    }

    #[test]
    fn round_trip_non_multiples_of_50() {
        for t in [2347, 3111, 5023, 7777, 9341] {
            let (r, _, b) = kelvin_to_rgb(t);
            let back = rgb_to_kelvin(r, b);
            assert_eq!(get_red(back), r);
            assert_eq!(get_blue(back), b);
        }
    }

    #[test]
    fn both_channels_saturated_is_6500() {
        assert_eq!(rgb_to_kelvin(255, 255), 6500);
    }

    #[test]
    fn deep_red_collapses_to_low_range() {
        // Every temperature at or below 1900K produces (255, 0).
        let t = rgb_to_kelvin(255, 0);
        assert!(t <= 1900);
        assert_eq!(t % 50, 0);
    }

    #[test]
    fn unreachable_pair_terminates() {
        // (254, 3) is produced by no integer temperature: red below 255
        // implies above 6500K where blue is pinned at 255.
        let t = rgb_to_kelvin(254, 3);
        assert!((TEMP_MIN..=TEMP_MAX).contains(&t));
    }
}
