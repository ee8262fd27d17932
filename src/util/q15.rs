//! Q15 fixed-point saturation, unit scale 32767.

const Q15_SCALE: f64 = 32767.0;

/// Converts a floating-point value in `[-1.0, 1.0]` (and beyond) to a
/// saturating Q15 `i16`, following `lround(x * 32767)` then clamping to
/// `[-32768, 32767]`.
pub fn to_q15(x: f64) -> i16 {
    let scaled = (x * Q15_SCALE).round();

    if scaled >= i16::MAX as f64 {
        i16::MAX
    } else if scaled <= i16::MIN as f64 {
        i16::MIN
    } else {
        scaled as i16
    }
}

/// Converts a Q15 value back to a float in roughly `[-1.0, 1.0]`.
pub fn from_q15(v: i16) -> f64 {
    v as f64 / Q15_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_round_trip_within_tolerance() {
        for v in [-1.0, -0.5, 0.0, 0.25, 0.99, 1.0] {
            let q = to_q15(v);
            assert!((from_q15(q) - v).abs() < 1e-4);
        }
    }

    #[test]
    fn it_should_saturate_out_of_range_values() {
        assert_eq!(to_q15(2.0), i16::MAX);
        assert_eq!(to_q15(-2.0), i16::MIN);
    }
}
