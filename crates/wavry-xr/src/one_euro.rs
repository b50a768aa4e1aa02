//! Speed adaptive low-pass filtering for tracking signals.
//!
//! "1€ filter" (Casiez et al.): the value cutoff rises with the filtered
//! derivative magnitude, so slow motion is smoothed hard while fast motion
//! keeps up with little lag.

use std::f64::consts::PI;
use std::fmt;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::types::Pose;

/// One step of an exponential low-pass: blend `x` into `prev` by `alpha`.
pub trait LowPass: Copy + fmt::Debug {
    fn blend(prev: Self, x: Self, alpha: f32) -> Self;
}

/// A signal the one-euro filter can adapt to.
pub trait Filterable: LowPass {
    type Derivative: LowPass;

    fn derivative_identity() -> Self::Derivative;
    fn derivative(prev: Self, current: Self, dt: f32) -> Self::Derivative;
    fn derivative_magnitude(dx: Self::Derivative) -> f32;
}

impl LowPass for Vec3 {
    fn blend(prev: Self, x: Self, alpha: f32) -> Self {
        x * alpha + prev * (1.0 - alpha)
    }
}

impl Filterable for Vec3 {
    type Derivative = Vec3;

    fn derivative_identity() -> Vec3 {
        Vec3::ZERO
    }

    fn derivative(prev: Self, current: Self, dt: f32) -> Vec3 {
        (current - prev) * (1.0 / dt)
    }

    fn derivative_magnitude(dx: Vec3) -> f32 {
        dx.length()
    }
}

impl LowPass for Quat {
    fn blend(prev: Self, x: Self, alpha: f32) -> Self {
        prev.slerp(x, alpha)
    }
}

impl Filterable for Quat {
    type Derivative = Quat;

    fn derivative_identity() -> Quat {
        Quat::IDENTITY
    }

    fn derivative(prev: Self, current: Self, dt: f32) -> Quat {
        let rate = 1.0 / dt;
        let dx = current * prev.inverse();
        // nlerp from identity, cheaper than slerp and close enough at tick rates.
        Quat::from_xyzw(
            dx.x * rate,
            dx.y * rate,
            dx.z * rate,
            dx.w * rate + (1.0 - rate),
        )
        .normalize()
    }

    fn derivative_magnitude(dx: Quat) -> f32 {
        2.0 * dx.w.clamp(-1.0, 1.0).acos()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OneEuroParams {
    pub min_cutoff: f32,
    pub beta: f32,
    pub derivative_cutoff: f32,
}

impl Default for OneEuroParams {
    fn default() -> Self {
        Self {
            min_cutoff: 1.0,
            beta: 0.5,
            derivative_cutoff: 1.0,
        }
    }
}

/// Smoothing factor of an exponential filter with the given cutoff (Hz).
pub fn smoothing_alpha(dt: f32, cutoff: f32) -> f32 {
    let tau = (1.0 / (2.0 * PI * cutoff as f64)) as f32;
    1.0 / (1.0 + tau / dt)
}

#[derive(Debug, Clone, Copy)]
pub struct LowPassFilter<T> {
    prev: Option<T>,
}

impl<T> Default for LowPassFilter<T> {
    fn default() -> Self {
        Self { prev: None }
    }
}

impl<T: LowPass> LowPassFilter<T> {
    pub fn filter(&mut self, x: T, alpha: f32) -> T {
        let out = match self.prev {
            Some(prev) => T::blend(prev, x, alpha),
            None => x,
        };
        self.prev = Some(out);
        out
    }

    pub fn last(&self) -> Option<T> {
        self.prev
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OneEuroFilter<T: Filterable> {
    params: OneEuroParams,
    x_filt: LowPassFilter<T>,
    dx_filt: LowPassFilter<T::Derivative>,
}

impl<T: Filterable> Default for OneEuroFilter<T> {
    fn default() -> Self {
        Self::new(OneEuroParams::default())
    }
}

impl<T: Filterable> OneEuroFilter<T> {
    pub fn new(params: OneEuroParams) -> Self {
        Self {
            params,
            x_filt: LowPassFilter::default(),
            dx_filt: LowPassFilter::default(),
        }
    }

    pub fn params(&self) -> &OneEuroParams {
        &self.params
    }

    pub fn reset(&mut self) {
        self.x_filt.reset();
        self.dx_filt.reset();
    }

    /// Filters one sample taken `dt` seconds after the previous one.
    pub fn filter(&mut self, dt: f32, x: T) -> T {
        // Derivative of the smoothed history, not of the raw samples.
        let dx = match self.x_filt.last() {
            Some(prev) => T::derivative(prev, x, dt),
            None => T::derivative_identity(),
        };

        let dx_hat = self
            .dx_filt
            .filter(dx, smoothing_alpha(dt, self.params.derivative_cutoff));
        let cutoff = self.params.min_cutoff + self.params.beta * T::derivative_magnitude(dx_hat);

        self.x_filt.filter(x, smoothing_alpha(dt, cutoff))
    }
}

/// Tuning for the two halves of a pose. Rotation speed is in rad/s and
/// position speed in m/s, so each gets its own cutoffs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseFilterParams {
    pub rotation: OneEuroParams,
    pub position: OneEuroParams,
}

/// Independent orientation and position filters for one tracked device.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseFilter {
    rotation: OneEuroFilter<Quat>,
    position: OneEuroFilter<Vec3>,
}

impl PoseFilter {
    pub fn new(params: PoseFilterParams) -> Self {
        Self {
            rotation: OneEuroFilter::new(params.rotation),
            position: OneEuroFilter::new(params.position),
        }
    }

    pub fn filter(&mut self, dt: f32, pose: Pose) -> Pose {
        Pose {
            orientation: self.rotation.filter(dt, pose.orientation),
            position: self.position.filter(dt, pose.position),
        }
    }

    pub fn reset(&mut self) {
        self.rotation.reset();
        self.position.reset();
    }
}
