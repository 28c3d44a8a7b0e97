//! Explicit leapfrog integration of the semi-discrete Maxwell system
//!
//! ```text
//! dD/dt =  ampere B - J
//! dB/dt = -faraday D
//! ```
//!
//! with a step size derived from the spectral radius of `faraday ∘ ampere`.

use nalgebra as na;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::operator::{Operator, OperatorError};

/// Parameters of a time-stepping run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeStepParams {
    /// Fraction of the largest stable step to use.
    /// Must be positive; values of 1 or more are unstable.
    pub cfl: f64,
    /// Length of the simulated time interval.
    pub final_time: f64,
    /// Record diagnostics every this many steps (and after the last one).
    /// 0 records only the initial and final state.
    pub diagnostics_every: usize,
    /// Relative change in the spectral radius estimate
    /// at which power iteration stops.
    pub power_tol: f64,
    /// Iteration cap of power iteration.
    pub power_max_iter: usize,
    /// Seed of the power iteration start vector.
    pub seed: u64,
}

impl Default for TimeStepParams {
    fn default() -> Self {
        Self {
            cfl: 0.8,
            final_time: 1.,
            diagnostics_every: 1,
            power_tol: 1e-3,
            power_max_iter: 500,
            seed: 0,
        }
    }
}

/// Failure in setting up or running a time-stepping loop.
#[derive(thiserror::Error, Debug)]
pub enum TimeStepError {
    /// The CFL factor must be positive.
    #[error("CFL factor must be positive, got {0}")]
    InvalidCfl(f64),
    /// The simulated time interval must be positive.
    #[error("Final time must be positive, got {0}")]
    InvalidFinalTime(f64),
    /// The Ampère and Faraday operators don't fit together.
    #[error("Ampère operator of shape {ampere:?} does not match Faraday operator of shape {faraday:?}")]
    Shape {
        /// Shape of the Ampère operator.
        ampere: (usize, usize),
        /// Shape of the Faraday operator.
        faraday: (usize, usize),
    },
    /// A field vector had the wrong length.
    #[error("Field {field} has length {found}, expected {expected}")]
    FieldLength {
        /// Which field.
        field: &'static str,
        /// Required length.
        expected: usize,
        /// Given length.
        found: usize,
    },
    /// Power iteration hit the null space; no step size can be derived.
    #[error("Evolution operator has zero spectral radius")]
    ZeroSpectralRadius,
    /// An operation was called in the wrong state.
    #[error("Cannot {action} in state {state:?}")]
    InvalidState {
        /// What was attempted.
        action: &'static str,
        /// The state at the time.
        state: StepperState,
    },
    /// Applying an operator failed.
    #[error(transparent)]
    Operator(#[from] OperatorError),
}

/// Lifecycle of a [`LeapfrogStepper`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepperState {
    /// Operators are set but no step size is known.
    Uninitialized,
    /// The step size is known and no step has been taken.
    StepSizeEstimated,
    /// At least one step has been taken.
    Running,
    /// All steps have been taken.
    Finished,
}

/// The step size chosen for a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepSize {
    /// Estimated spectral radius of `faraday ∘ ampere`.
    pub spectral_radius: f64,
    /// Power iterations used for the estimate.
    pub power_iterations: usize,
    /// Largest stable step, `2 / sqrt(spectral_radius)`.
    pub dt_max: f64,
    /// The step actually used, dividing the final time evenly.
    pub dt: f64,
    /// Number of steps in the run.
    pub steps: usize,
    /// Set if the CFL factor was 1 or more, making the run unstable.
    pub cfl_hazard: bool,
}

/// Scalar diagnostics at one point of a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Diagnostics {
    /// Steps taken so far.
    pub step: usize,
    /// Simulated time.
    pub time: f64,
    /// `½ Dᵀ W_D D`, if a weight for D was given.
    pub electric_energy: Option<f64>,
    /// `½ Bᵀ W_B B`, if a weight for B was given.
    pub magnetic_energy: Option<f64>,
    /// Euclidean norm of the divergence of D, if a divergence operator was given.
    pub divergence_norm: Option<f64>,
}

impl Diagnostics {
    /// Sum of the available energies.
    pub fn total_energy(&self) -> f64 {
        self.electric_energy.unwrap_or(0.) + self.magnetic_energy.unwrap_or(0.)
    }
}

/// Estimate the spectral radius of a square operator by power iteration
/// from a random start vector.
///
/// Stops when the estimate changes by less than `tol` relative to itself,
/// or after `max_iter` iterations with a warning.
/// Returns the estimate and the number of iterations.
pub fn estimate_spectral_radius(
    op: &dyn Operator,
    tol: f64,
    max_iter: usize,
    seed: u64,
) -> Result<(f64, usize), TimeStepError> {
    let (n, m) = op.shape();
    if n != m {
        return Err(OperatorError::ShapeMismatch {
            left: (n, m),
            right: (n, m),
        }
        .into());
    }
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    let mut v = na::DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0));
    v.normalize_mut();

    let mut rho = 0.;
    for iter in 1..=max_iter {
        let mut w = op.apply(&v)?;
        let norm = w.norm();
        if norm == 0. {
            return Err(TimeStepError::ZeroSpectralRadius);
        }
        w /= norm;
        v = w;
        if (norm - rho).abs() <= tol * norm {
            log::debug!("Power iteration converged in {iter} iterations: {norm:e}");
            return Ok((norm, iter));
        }
        rho = norm;
    }
    log::warn!("Power iteration did not converge in {max_iter} iterations, using {rho:e}");
    Ok((rho, max_iter))
}

/// Strang-split leapfrog integrator for a pair of coupled fields.
pub struct LeapfrogStepper {
    ampere: Arc<dyn Operator>,
    faraday: Arc<dyn Operator>,
    params: TimeStepParams,
    state: StepperState,
    step_size: Option<StepSize>,
    electric_weight: Option<Arc<dyn Operator>>,
    magnetic_weight: Option<Arc<dyn Operator>>,
    divergence: Option<Arc<dyn Operator>>,
    d: na::DVector<f64>,
    b: na::DVector<f64>,
    step: usize,
    diagnostics: Vec<Diagnostics>,
}

impl std::fmt::Debug for LeapfrogStepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeapfrogStepper")
            .field("state", &self.state)
            .field("step_size", &self.step_size)
            .field("step", &self.step)
            .finish()
    }
}

impl LeapfrogStepper {
    /// Set up a stepper with zero initial fields.
    ///
    /// `ampere` maps B to the time derivative of D
    /// and `faraday` maps D to minus the time derivative of B.
    pub fn new(
        ampere: Arc<dyn Operator>,
        faraday: Arc<dyn Operator>,
        params: TimeStepParams,
    ) -> Result<Self, TimeStepError> {
        if params.cfl <= 0. || params.cfl.is_nan() {
            return Err(TimeStepError::InvalidCfl(params.cfl));
        }
        if params.final_time <= 0. || params.final_time.is_nan() {
            return Err(TimeStepError::InvalidFinalTime(params.final_time));
        }
        let (n_d, n_b) = ampere.shape();
        if faraday.shape() != (n_b, n_d) {
            return Err(TimeStepError::Shape {
                ampere: ampere.shape(),
                faraday: faraday.shape(),
            });
        }
        Ok(Self {
            ampere,
            faraday,
            params,
            state: StepperState::Uninitialized,
            step_size: None,
            electric_weight: None,
            magnetic_weight: None,
            divergence: None,
            d: na::DVector::zeros(n_d),
            b: na::DVector::zeros(n_b),
            step: 0,
            diagnostics: Vec::new(),
        })
    }

    /// Record the energies `½ Dᵀ W_D D` and `½ Bᵀ W_B B` in diagnostics,
    /// typically with the mass matrices as weights.
    pub fn with_energy_weights(
        mut self,
        electric: Arc<dyn Operator>,
        magnetic: Arc<dyn Operator>,
    ) -> Self {
        self.electric_weight = Some(electric);
        self.magnetic_weight = Some(magnetic);
        self
    }

    /// Record the norm of `divergence D` in diagnostics.
    pub fn with_divergence(mut self, divergence: Arc<dyn Operator>) -> Self {
        self.divergence = Some(divergence);
        self
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> StepperState {
        self.state
    }

    /// The step size, once estimated.
    #[inline]
    pub fn step_size(&self) -> Option<&StepSize> {
        self.step_size.as_ref()
    }

    /// Current D field.
    #[inline]
    pub fn electric(&self) -> &na::DVector<f64> {
        &self.d
    }

    /// Current B field.
    #[inline]
    pub fn magnetic(&self) -> &na::DVector<f64> {
        &self.b
    }

    /// Steps taken.
    #[inline]
    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Simulated time reached.
    pub fn time(&self) -> f64 {
        self.step_size.map_or(0., |s| s.dt * self.step as f64)
    }

    /// Diagnostics recorded so far.
    #[inline]
    pub fn diagnostics(&self) -> &[Diagnostics] {
        &self.diagnostics
    }

    /// Set the fields before the first step.
    pub fn set_fields(
        &mut self,
        d: na::DVector<f64>,
        b: na::DVector<f64>,
    ) -> Result<(), TimeStepError> {
        if matches!(self.state, StepperState::Running | StepperState::Finished) {
            return Err(TimeStepError::InvalidState {
                action: "set fields",
                state: self.state,
            });
        }
        for (field, expected, found) in [("D", self.d.len(), d.len()), ("B", self.b.len(), b.len())] {
            if expected != found {
                return Err(TimeStepError::FieldLength {
                    field,
                    expected,
                    found,
                });
            }
        }
        self.d = d;
        self.b = b;
        Ok(())
    }

    /// Estimate the spectral radius of `faraday ∘ ampere`
    /// and fix the step size and number of steps of the run.
    pub fn estimate_step_size(&mut self) -> Result<&StepSize, TimeStepError> {
        if self.state != StepperState::Uninitialized {
            return Err(TimeStepError::InvalidState {
                action: "estimate the step size",
                state: self.state,
            });
        }
        let product = crate::operator::ComposedOperator::new(vec![
            self.faraday.clone(),
            self.ampere.clone(),
        ])?;
        let (spectral_radius, power_iterations) = estimate_spectral_radius(
            &product,
            self.params.power_tol,
            self.params.power_max_iter,
            self.params.seed,
        )?;

        let dt_max = 2. / spectral_radius.sqrt();
        let steps = (self.params.final_time / (self.params.cfl * dt_max)).ceil().max(1.) as usize;
        let dt = self.params.final_time / steps as f64;
        let cfl_hazard = self.params.cfl >= 1.;
        if cfl_hazard {
            log::warn!(
                "CFL factor {} is not below 1, the time stepping is unstable",
                self.params.cfl
            );
        }
        log::info!(
            "Spectral radius {spectral_radius:e} gives dt_max = {dt_max:e}; taking {steps} steps of {dt:e}"
        );

        self.state = StepperState::StepSizeEstimated;
        Ok(self.step_size.insert(StepSize {
            spectral_radius,
            power_iterations,
            dt_max,
            dt,
            steps,
            cfl_hazard,
        }))
    }

    /// Take one step, with an optional source term `J` evaluated at the half step.
    pub fn step(&mut self, source: Option<&na::DVector<f64>>) -> Result<(), TimeStepError> {
        let step_size = match (self.state, self.step_size) {
            (StepperState::StepSizeEstimated | StepperState::Running, Some(s)) => s,
            _ => {
                return Err(TimeStepError::InvalidState {
                    action: "step",
                    state: self.state,
                })
            }
        };
        if self.state == StepperState::StepSizeEstimated {
            self.record()?;
            self.state = StepperState::Running;
        }
        let dt = step_size.dt;

        self.b.axpy(-0.5 * dt, &self.faraday.apply(&self.d)?, 1.);
        let mut dd = self.ampere.apply(&self.b)?;
        if let Some(j) = source {
            if j.len() != dd.len() {
                return Err(TimeStepError::FieldLength {
                    field: "J",
                    expected: dd.len(),
                    found: j.len(),
                });
            }
            dd -= j;
        }
        self.d.axpy(dt, &dd, 1.);
        self.b.axpy(-0.5 * dt, &self.faraday.apply(&self.d)?, 1.);
        self.step += 1;

        let done = self.step >= step_size.steps;
        let every = self.params.diagnostics_every;
        if done || (every > 0 && self.step % every == 0) {
            self.record()?;
        }
        if done {
            self.state = StepperState::Finished;
        }
        Ok(())
    }

    /// Run all remaining steps,
    /// with the source term given as a function of time (`None` for no source).
    ///
    /// The step size is estimated first if that hasn't been done yet.
    pub fn run(
        &mut self,
        source: impl FnMut(f64) -> Option<na::DVector<f64>>,
    ) -> Result<&[Diagnostics], TimeStepError> {
        self.run_observed(source, |_| {})
    }

    /// Like [`run`][Self::run],
    /// calling `observe` after every step to export the fields.
    pub fn run_observed(
        &mut self,
        mut source: impl FnMut(f64) -> Option<na::DVector<f64>>,
        mut observe: impl FnMut(&Self),
    ) -> Result<&[Diagnostics], TimeStepError> {
        if self.state == StepperState::Uninitialized {
            self.estimate_step_size()?;
        }
        while self.state != StepperState::Finished {
            let half_step = self.time() + 0.5 * self.step_size.map_or(0., |s| s.dt);
            let j = source(half_step);
            self.step(j.as_ref())?;
            observe(self);
        }
        Ok(&self.diagnostics)
    }

    fn record(&mut self) -> Result<(), TimeStepError> {
        let energy = |weight: &Option<Arc<dyn Operator>>, field: &na::DVector<f64>| {
            weight
                .as_ref()
                .map(|w| w.apply(field).map(|wf| 0.5 * field.dot(&wf)))
                .transpose()
        };
        let diag = Diagnostics {
            step: self.step,
            time: self.time(),
            electric_energy: energy(&self.electric_weight, &self.d)?,
            magnetic_energy: energy(&self.magnetic_weight, &self.b)?,
            divergence_norm: self
                .divergence
                .as_ref()
                .map(|div| div.apply(&self.d).map(|v| v.norm()))
                .transpose()?,
        };
        log::trace!("{diag:?}");
        self.diagnostics.push(diag);
        Ok(())
    }
}
