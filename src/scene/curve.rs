//! Interpolation curves for camera blends

use glam::Vec2;

/// Maps blend progress in [0, 1] onto an eased value in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Interpolator {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    /// Smoothstep
    EaseInOut,
    /// CSS-style cubic Bezier through (0, 0), `p1`, `p2`, (1, 1)
    CubicBezier { p1: Vec2, p2: Vec2 },
}

impl Interpolator {
    pub fn ease(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match *self {
            Interpolator::Linear => t,
            Interpolator::EaseIn => t * t,
            Interpolator::EaseOut => t * (2.0 - t),
            Interpolator::EaseInOut => t * t * (3.0 - 2.0 * t),
            Interpolator::CubicBezier { p1, p2 } => cubic_bezier(p1, p2, t),
        }
    }

    /// Value between `from` and `to` at progress `t`. NaN progress stays NaN.
    pub fn blend(&self, from: f32, to: f32, t: f32) -> f32 {
        from + (to - from) * self.ease(t)
    }
}

fn bezier_axis(a: f32, b: f32, s: f32) -> f32 {
    let inv = 1.0 - s;
    3.0 * inv * inv * s * a + 3.0 * inv * s * s * b + s * s * s
}

fn bezier_axis_slope(a: f32, b: f32, s: f32) -> f32 {
    let inv = 1.0 - s;
    3.0 * inv * inv * a + 6.0 * inv * s * (b - a) + 3.0 * s * s * (1.0 - b)
}

fn cubic_bezier(p1: Vec2, p2: Vec2, x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    // Newton first, bisection when the slope flattens out.
    let mut s = x;
    for _ in 0..8 {
        let error = bezier_axis(p1.x, p2.x, s) - x;
        if error.abs() < 1e-6 {
            return bezier_axis(p1.y, p2.y, s);
        }
        let slope = bezier_axis_slope(p1.x, p2.x, s);
        if slope.abs() < 1e-6 {
            break;
        }
        s -= error / slope;
    }

    let (mut lo, mut hi) = (0.0f32, 1.0f32);
    s = x;
    for _ in 0..32 {
        let value = bezier_axis(p1.x, p2.x, s);
        if (value - x).abs() < 1e-6 {
            break;
        }
        if value < x {
            lo = s;
        } else {
            hi = s;
        }
        s = (lo + hi) * 0.5;
    }
    bezier_axis(p1.y, p2.y, s)
}
