//! Proposal kernels: a symmetric base distribution optionally split into the
//! two-humped Bactrian shape, which avoids proposing values too close to the
//! current one.

use std::f64::consts::PI;

use arbor_core::errors::{ArborError, ErrorInfo};
use arbor_core::RngHandle;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Shape of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelMode {
    /// Uniform with unit variance.
    Uniform,
    /// Standard normal.
    Normal,
    /// Laplace with unit variance.
    Laplace,
    /// Sum of four normals.
    T4,
    /// Standard Cauchy.
    Cauchy,
    /// Bactrian mixture of two normals.
    #[default]
    BactrianNormal,
    /// Bactrian mixture of two Laplace humps.
    BactrianLaplace,
    /// Bactrian mixture of two triangles.
    BactrianTriangle,
    /// Bactrian mixture of two uniforms.
    BactrianUniform,
    /// Bactrian mixture with t4-like humps.
    BactrianT4,
    /// Bactrian mixture of two Cauchy humps.
    BactrianCauchy,
    /// Two boxes `[a, b]` mirrored around zero.
    BactrianBox,
}

/// Default Bactrian hump offset.
pub const DEFAULT_M: f64 = 0.95;
const DEFAULT_BOX_A: f64 = 0.4;

/// Random number source shaping scale factors and random-walk deltas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelDistribution {
    mode: KernelMode,
    m: f64,
    a: f64,
    b: f64,
}

impl Default for KernelDistribution {
    fn default() -> Self {
        Self::bactrian()
    }
}

impl KernelDistribution {
    /// Bactrian normal kernel with `m = 0.95`.
    pub fn bactrian() -> Self {
        Self {
            mode: KernelMode::BactrianNormal,
            m: DEFAULT_M,
            a: DEFAULT_BOX_A,
            b: box_upper(DEFAULT_BOX_A),
        }
    }

    /// Kernel of the given shape. `m` must lie strictly inside `(0, 1)`.
    pub fn new(mode: KernelMode, m: f64) -> Result<Self, ArborError> {
        if !(m > 0.0 && m < 1.0) {
            return Err(ArborError::Operator(
                ErrorInfo::new("bad-kernel", "Bactrian offset m must lie in (0, 1)")
                    .with_context("m", m.to_string()),
            ));
        }
        Ok(Self {
            mode,
            m,
            a: DEFAULT_BOX_A,
            b: box_upper(DEFAULT_BOX_A),
        })
    }

    /// Bactrian box kernel with inner edge `a`; the outer edge keeps unit variance.
    pub fn bactrian_box(a: f64) -> Result<Self, ArborError> {
        if !(a >= 0.0 && a < 1.0) {
            return Err(ArborError::Operator(
                ErrorInfo::new("bad-kernel", "box inner edge must lie in [0, 1)")
                    .with_context("a", a.to_string()),
            ));
        }
        Ok(Self {
            mode: KernelMode::BactrianBox,
            m: DEFAULT_M,
            a,
            b: box_upper(a),
        })
    }

    /// Kernel shape.
    pub fn mode(&self) -> KernelMode {
        self.mode
    }

    /// One draw with (approximately) unit variance.
    pub fn random_number(&self, rng: &mut RngHandle) -> f64 {
        match self.mode {
            KernelMode::Normal => gaussian(rng),
            KernelMode::Uniform => (rng.uniform() - 0.5) * 12f64.sqrt(),
            KernelMode::Laplace => laplace(rng),
            KernelMode::T4 => t4(rng),
            KernelMode::Cauchy => cauchy(rng),
            KernelMode::BactrianBox => {
                let y = self.a + rng.uniform() * (self.b - self.a);
                if rng.coin() {
                    y
                } else {
                    -y
                }
            }
            _ => {
                let m = self.m;
                let hump = if rng.coin() { m } else { -m };
                hump + self.bactrian_inner(rng) * (1.0 - m * m).sqrt()
            }
        }
    }

    fn bactrian_inner(&self, rng: &mut RngHandle) -> f64 {
        match self.mode {
            KernelMode::BactrianLaplace => laplace(rng),
            KernelMode::BactrianTriangle => {
                let u = rng.uniform();
                if u < 0.5 {
                    -(6f64.sqrt()) + 2.0 * (3.0 * u).sqrt()
                } else {
                    6f64.sqrt() - 2.0 * (3.0 * (1.0 - u)).sqrt()
                }
            }
            KernelMode::BactrianUniform => (rng.uniform() - 0.5) * 12f64.sqrt(),
            KernelMode::BactrianT4 => t4(rng),
            KernelMode::BactrianCauchy => cauchy(rng),
            _ => gaussian(rng),
        }
    }

    /// Multiplicative factor `exp(scale_factor * r)`.
    pub fn scaler(&self, rng: &mut RngHandle, scale_factor: f64) -> f64 {
        (scale_factor * self.random_number(rng)).exp()
    }

    /// Additive step `window * r`.
    pub fn random_delta(&self, rng: &mut RngHandle, window: f64) -> f64 {
        window * self.random_number(rng)
    }
}

fn box_upper(a: f64) -> f64 {
    0.5 * ((12.0 - 3.0 * a * a).sqrt() - a)
}

fn gaussian(rng: &mut RngHandle) -> f64 {
    rng.inner_mut().sample(StandardNormal)
}

fn laplace(rng: &mut RngHandle) -> f64 {
    let u = rng.uniform() - 0.5;
    u.signum() * (1.0 - (2.0 * u).abs()).ln() / 2f64.sqrt()
}

fn t4(rng: &mut RngHandle) -> f64 {
    0.5 * (gaussian(rng) + gaussian(rng) + gaussian(rng) + gaussian(rng))
}

fn cauchy(rng: &mut RngHandle) -> f64 {
    (PI * (rng.uniform() - 0.5)).tan()
}
