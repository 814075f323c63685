//! Automatic exposure
//!
//! Exposure eases exponentially towards `KEY_VALUE / luminance`, using the
//! latest luminance read back from the GPU. Until the first readback arrives
//! the initial exposure is held.

pub const KEY_VALUE: f32 = 0.5;
pub const EXPOSURE_EPSILON: f32 = 1e-4;

pub fn target_exposure(luminance: f32) -> f32 {
    KEY_VALUE / (luminance.max(0.0) + EXPOSURE_EPSILON)
}

#[derive(Debug, Clone)]
pub struct ExposureController {
    initial: f32,
    exposure: f32,
    adaptation_rate: f32,
    target: Option<f32>,
}

impl ExposureController {
    pub fn new(initial: f32, adaptation_rate: f32) -> Self {
        Self {
            initial,
            exposure: initial,
            adaptation_rate: adaptation_rate.max(0.0),
            target: None,
        }
    }

    pub fn exposure(&self) -> f32 {
        self.exposure
    }

    pub fn target(&self) -> Option<f32> {
        self.target
    }

    pub fn set_adaptation_rate(&mut self, rate: f32) {
        self.adaptation_rate = rate.max(0.0);
    }

    /// Advance by `dt` seconds, retargeting when a new measurement arrived.
    pub fn update(&mut self, measured: Option<f32>, dt: f32) -> f32 {
        if let Some(luminance) = measured.filter(|l| l.is_finite()) {
            self.target = Some(target_exposure(luminance));
        }
        let Some(target) = self.target else {
            return self.exposure;
        };
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        let blend = 1.0 - (-dt * self.adaptation_rate).exp();
        self.exposure += (target - self.exposure) * blend;
        self.exposure
    }

    pub fn reset(&mut self) {
        self.exposure = self.initial;
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_the_initial_exposure_until_measured() {
        let mut controller = ExposureController::new(1.0, 2.0);
        for _ in 0..10 {
            assert_eq!(controller.update(None, 0.1), 1.0);
        }
    }

    #[test]
    fn converges_monotonically() {
        let rate = 1.5;
        let mut controller = ExposureController::new(1.0, rate);
        let target = target_exposure(0.05);
        assert!(target > 1.0);

        let dt = 1.0 / 60.0;
        let steps = (5.0 / rate / dt).ceil() as usize;
        let mut previous = controller.exposure();
        for step in 0..steps {
            let measured = (step == 0).then_some(0.05);
            let exposure = controller.update(measured, dt);
            assert!(exposure >= previous);
            assert!(exposure <= target);
            previous = exposure;
        }
        assert!((target - previous).abs() / target < 0.01, "{previous} vs {target}");
    }

    #[test]
    fn black_frames_do_not_divide_by_zero() {
        let mut controller = ExposureController::new(1.0, 1.0);
        let exposure = controller.update(Some(0.0), 1.0);
        assert!(exposure.is_finite());
        assert_eq!(controller.target(), Some(KEY_VALUE / EXPOSURE_EPSILON));
    }

    #[test]
    fn bad_time_steps_are_ignored() {
        let mut controller = ExposureController::new(1.0, 1.0);
        controller.update(Some(0.25), f32::NAN);
        assert_eq!(controller.exposure(), 1.0);
        controller.update(None, -1.0);
        assert_eq!(controller.exposure(), 1.0);
    }
}
