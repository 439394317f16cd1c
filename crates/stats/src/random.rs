//! Random variates for Monte Carlo comparison: uniform → normal (Box-Muller)
//! → gamma (Marsaglia-Tsang) → beta (gamma ratio).
//!
//! Every draw comes from the wrapped `rand` source, so a seeded `StdRng`
//! makes the whole chain reproducible.

use experiment_core::{ExperimentError, ExperimentResult};
use rand::Rng;

pub struct VariateGenerator<R: Rng> {
    rng: R,
}

impl<R: Rng> VariateGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Uniform in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform in (0, 1], safe to take a logarithm of.
    pub fn uniform_open(&mut self) -> f64 {
        1.0 - self.uniform()
    }

    /// Standard normal via Box-Muller.
    pub fn normal(&mut self) -> f64 {
        let u1 = self.uniform_open();
        let u2 = self.uniform();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Gamma(shape, 1).
    pub fn gamma(&mut self, shape: f64) -> ExperimentResult<f64> {
        if !(shape > 0.0 && shape.is_finite()) {
            return Err(ExperimentError::configuration(format!(
                "gamma shape must be positive, got {shape}"
            )));
        }

        if shape < 1.0 {
            // Boost: Gamma(a) = Gamma(a+1) * U^(1/a)
            let u = self.uniform_open();
            return Ok(self.gamma(shape + 1.0)? * u.powf(1.0 / shape));
        }

        // Marsaglia-Tsang for shape >= 1
        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();

        loop {
            let z = self.normal();
            let v = (1.0 + c * z).powi(3);
            if v <= 0.0 {
                continue;
            }

            let u = self.uniform_open();
            if u < 1.0 - 0.0331 * z.powi(4) || u.ln() < 0.5 * z * z + d * (1.0 - v + v.ln()) {
                return Ok(d * v);
            }
        }
    }

    /// Beta(alpha, beta) as X / (X + Y) with X ~ Gamma(alpha), Y ~ Gamma(beta).
    pub fn beta(&mut self, alpha: f64, beta: f64) -> ExperimentResult<f64> {
        let x = self.gamma(alpha)?;
        let y = self.gamma(beta)?;
        if x + y > 0.0 {
            Ok(x / (x + y))
        } else {
            Ok(0.5)
        }
    }
}
