//! Coordinate mapping between logical session-space and viewport pixels.
//!
//! Logical space is centered on the origin and spans [`LOGICAL_EXTENT`]
//! units per axis. Pixel coordinates are relative to the viewport center,
//! so the renderer translates its canvas by half the viewport before drawing.
//!
//! ```text
//! scale(p, v)    = round(p · v / L)
//! reverse(q, v)  = round(q · L / v)
//! ```
//!
//! For `v >= L` every logical coordinate survives `reverse(scale(p, v), v)`.
//! A viewport narrower than `L` has fewer pixels than logical units, so there
//! the law holds on the lattice of logical values a pixel maps back to,
//! which is every value a touch can produce.

/// Logical units spanned by one viewport axis.
pub const LOGICAL_EXTENT: i32 = 1000;

/// Logical coordinate to pixel offset from the viewport center.
///
/// A non-positive extent means "no viewport yet" and maps identically.
pub fn scale(logical: i32, extent: i32) -> i32 {
    if extent <= 0 {
        return logical;
    }
    saturate(div_round(
        i64::from(logical) * i64::from(extent),
        i64::from(LOGICAL_EXTENT),
    ))
}

/// Pixel offset from the viewport center back to a logical coordinate.
pub fn reverse_scale(pixel: i32, extent: i32) -> i32 {
    if extent <= 0 {
        return pixel;
    }
    saturate(div_round(
        i64::from(pixel) * i64::from(LOGICAL_EXTENT),
        i64::from(extent),
    ))
}

/// Integer division rounding half away from zero. `d` must be positive.
fn div_round(n: i64, d: i64) -> i64 {
    let q = n / d;
    let r = n % d;
    if 2 * r.abs() >= d {
        q + n.signum()
    } else {
        q
    }
}

fn saturate(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Current viewport size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub width: i32,
    pub height: i32,
}

impl Frame {
    pub fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Logical position to pixel offsets from the viewport center.
    pub fn to_pixels(&self, x: i32, y: i32) -> (i32, i32) {
        (scale(x, self.width), scale(y, self.height))
    }

    /// Pixel offsets from the viewport center to a logical position.
    pub fn to_logical(&self, px: i32, py: i32) -> (i32, i32) {
        (reverse_scale(px, self.width), reverse_scale(py, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_for_wide_viewports() {
        for extent in [LOGICAL_EXTENT, 1001, 1080, 1440, 1920, 2560, 7680] {
            for p in -5_000..=5_000 {
                assert_eq!(reverse_scale(scale(p, extent), extent), p, "p={p} v={extent}");
            }
        }
    }

    #[test]
    fn test_round_trip_on_narrow_viewport_lattice() {
        for extent in [1, 7, 320, 480, 720, 999] {
            for px in -extent..=extent {
                let p = reverse_scale(px, extent);
                assert_eq!(scale(p, extent), px);
                assert_eq!(reverse_scale(scale(p, extent), extent), p, "p={p} v={extent}");
            }
        }
    }

    #[test]
    fn test_center_and_edges() {
        assert_eq!(scale(0, 1080), 0);
        assert_eq!(scale(LOGICAL_EXTENT / 2, 1080), 540);
        assert_eq!(scale(-LOGICAL_EXTENT / 2, 1080), -540);
        assert_eq!(reverse_scale(540, 1080), 500);
    }

    #[test]
    fn test_rounds_half_away_from_zero() {
        // 1 * 500 / 1000 = 0.5
        assert_eq!(scale(1, 500), 1);
        assert_eq!(scale(-1, 500), -1);
        assert_eq!(scale(1, 499), 0);
    }

    #[test]
    fn test_non_positive_extent_is_identity() {
        assert_eq!(scale(123, 0), 123);
        assert_eq!(reverse_scale(-77, -5), -77);
    }

    #[test]
    fn test_extremes_saturate() {
        assert_eq!(scale(i32::MAX, i32::MAX), i32::MAX);
        assert_eq!(scale(i32::MIN, i32::MAX), i32::MIN);
        assert_eq!(reverse_scale(i32::MAX, 1), i32::MAX);
    }

    #[test]
    fn test_frame_uses_per_axis_extent() {
        let frame = Frame::new(2000, 1000);
        assert_eq!(frame.to_pixels(100, 100), (200, 100));
        assert_eq!(frame.to_logical(200, 100), (100, 100));
    }
}
