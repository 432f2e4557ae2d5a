//! Stochastic noise channels and the engine wrapper that injects them.
//!
//! A [`NoiseChannel`] is a set of Kraus operators on one qudit. The
//! [`NoisyEngine`] wrapper sweeps the channel across every live qudit
//! before each step, following the quantum-trajectory rule: candidate
//! states are weighted by their squared norms, one branch is sampled, and
//! the state collapses to it renormalized. For unitary Kraus sets the
//! weights reduce to the fixed mixing probabilities.

use num_complex::Complex64 as C64;
use rand::Rng;
use std::fmt;
use std::ptr;
use tracing::trace;

use crate::circuit::{Circuit, Step};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::gates;
use crate::ops::{self, CMat, CVec};

/// A stochastic single-qudit channel given by its Kraus operators.
pub trait NoiseChannel {
    /// Qudit dimension the operators act on.
    fn dim(&self) -> usize;

    /// The Kraus operators; jointly trace-preserving.
    fn kraus(&self) -> &[CMat];

    /// Applies the channel at physical position `pos` of `psi`, returning
    /// the sampled branch index and the post-channel state.
    fn apply<R>(&self, psi: &CVec, pos: usize, rng: &mut R) -> (usize, CVec)
    where
        R: Rng + ?Sized,
    {
        let dim = self.dim();
        let mut weights: Vec<f64> = Vec::new();
        let mut candidates: Vec<CVec> = Vec::new();
        for k in self.kraus() {
            let candidate = ops::apply(psi, k, &[pos], dim);
            weights.push(candidate.iter().map(|a| a.norm_sqr()).sum());
            candidates.push(candidate);
        }
        let branch = ops::sample_index(&weights, rng);
        let norm = weights[branch].sqrt();
        let state = candidates.swap_remove(branch).map(|a| a / norm);
        (branch, state)
    }
}

fn scaled(m: &CMat, s: f64) -> CMat {
    m.map(|a| a * s)
}

/// Applies the Pauli X with probability `p`.
#[derive(Clone, Debug)]
pub struct BitFlip {
    kraus: Vec<CMat>,
}

impl BitFlip {
    /// # Panics
    /// When `p` is outside `[0, 1]`.
    pub fn new(p: f64) -> Self {
        assert!((0.0..=1.0).contains(&p));
        let kraus = vec![
            scaled(&gates::identity(2), (1.0 - p).sqrt()),
            scaled(&gates::PAULI_X, p.sqrt()),
        ];
        Self { kraus }
    }
}

impl NoiseChannel for BitFlip {
    fn dim(&self) -> usize { 2 }
    fn kraus(&self) -> &[CMat] { &self.kraus }
}

/// Applies the Pauli Z with probability `p`.
#[derive(Clone, Debug)]
pub struct PhaseFlip {
    kraus: Vec<CMat>,
}

impl PhaseFlip {
    /// # Panics
    /// When `p` is outside `[0, 1]`.
    pub fn new(p: f64) -> Self {
        assert!((0.0..=1.0).contains(&p));
        let kraus = vec![
            scaled(&gates::identity(2), (1.0 - p).sqrt()),
            scaled(&gates::PAULI_Z, p.sqrt()),
        ];
        Self { kraus }
    }
}

impl NoiseChannel for PhaseFlip {
    fn dim(&self) -> usize { 2 }
    fn kraus(&self) -> &[CMat] { &self.kraus }
}

/// Applies one of the three Paulis, each with probability `p/3`.
#[derive(Clone, Debug)]
pub struct Depolarizing {
    kraus: Vec<CMat>,
}

impl Depolarizing {
    /// # Panics
    /// When `p` is outside `[0, 1]`.
    pub fn new(p: f64) -> Self {
        assert!((0.0..=1.0).contains(&p));
        let q = (p / 3.0).sqrt();
        let kraus = vec![
            scaled(&gates::identity(2), (1.0 - p).sqrt()),
            scaled(&gates::PAULI_X, q),
            scaled(&gates::PAULI_Y, q),
            scaled(&gates::PAULI_Z, q),
        ];
        Self { kraus }
    }
}

impl NoiseChannel for Depolarizing {
    fn dim(&self) -> usize { 2 }
    fn kraus(&self) -> &[CMat] { &self.kraus }
}

/// Qudit depolarizing channel over the `dim² - 1` products of generalized
/// shift and clock powers, each with probability `p/(dim² - 1)`.
#[derive(Clone, Debug)]
pub struct QuditDepolarizing {
    dim: usize,
    kraus: Vec<CMat>,
}

impl QuditDepolarizing {
    /// # Panics
    /// When `dim` is below two or `p` is outside `[0, 1]`.
    pub fn new(dim: usize, p: f64) -> Self {
        assert!(dim >= 2);
        assert!((0.0..=1.0).contains(&p));
        let count = dim * dim - 1;
        let q = (p / count as f64).sqrt();
        let x = gates::shift(dim);
        let z = gates::clock(dim);
        let mut kraus = Vec::with_capacity(dim * dim);
        kraus.push(scaled(&gates::identity(dim), (1.0 - p).sqrt()));
        for a in 0..dim {
            for b in 0..dim {
                if a == 0 && b == 0 {
                    continue;
                }
                let op = ops::powm(&x, a) * ops::powm(&z, b);
                kraus.push(scaled(&op, q));
            }
        }
        Self { dim, kraus }
    }
}

impl NoiseChannel for QuditDepolarizing {
    fn dim(&self) -> usize { self.dim }
    fn kraus(&self) -> &[CMat] { &self.kraus }
}

/// Decays `|1⟩` toward `|0⟩` with probability `gamma`.
#[derive(Clone, Debug)]
pub struct AmplitudeDamping {
    kraus: Vec<CMat>,
}

impl AmplitudeDamping {
    /// # Panics
    /// When `gamma` is outside `[0, 1]`.
    pub fn new(gamma: f64) -> Self {
        assert!((0.0..=1.0).contains(&gamma));
        let mut k0 = CMat::identity(2, 2);
        k0[(1, 1)] = C64::from((1.0 - gamma).sqrt());
        let mut k1 = CMat::zeros(2, 2);
        k1[(0, 1)] = C64::from(gamma.sqrt());
        Self { kraus: vec![k0, k1] }
    }
}

impl NoiseChannel for AmplitudeDamping {
    fn dim(&self) -> usize { 2 }
    fn kraus(&self) -> &[CMat] { &self.kraus }
}

/// Channel built from an explicit list of Kraus operators.
#[derive(Clone, Debug)]
pub struct Kraus {
    kraus: Vec<CMat>,
}

impl Kraus {
    /// # Panics
    /// When the list is empty or the operators are not square matrices of
    /// one shared size.
    pub fn new(operators: Vec<CMat>) -> Self {
        assert!(!operators.is_empty());
        let dim = operators[0].nrows();
        assert!(operators.iter().all(|k| k.nrows() == dim && k.ncols() == dim));
        Self { kraus: operators }
    }
}

impl NoiseChannel for Kraus {
    fn dim(&self) -> usize { self.kraus[0].nrows() }
    fn kraus(&self) -> &[CMat] { &self.kraus }
}

/// An [`Engine`] with a noise channel swept across the live register
/// before every step.
///
/// Branch indices drawn by the channel are recorded per step, in
/// ascending qudit order over the qudits that were live at that moment.
#[derive(Clone, Debug)]
pub struct NoisyEngine<'a, N> {
    engine: Engine<'a>,
    channel: N,
    outcomes: Vec<Vec<usize>>,
}

impl<'a, N: NoiseChannel> NoisyEngine<'a, N> {
    /// Binds to `circuit` like [`Engine::new`], with `channel` interposed.
    ///
    /// # Errors
    /// `ChannelMismatch` when the channel dimension differs from the
    /// circuit's.
    pub fn new(circuit: &'a Circuit, channel: N, seed: Option<u64>) -> Result<Self> {
        if channel.dim() != circuit.dim() {
            return Err(Error::ChannelMismatch {
                channel: channel.dim(),
                circuit: circuit.dim(),
            });
        }
        Ok(Self {
            engine: Engine::new(circuit, seed),
            channel,
            outcomes: vec![Vec::new(); circuit.step_count()],
        })
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &Engine<'a> { &self.engine }

    /// Mutable access to the wrapped engine, for register setup.
    pub fn engine_mut(&mut self) -> &mut Engine<'a> { &mut self.engine }

    /// The interposed channel.
    pub fn channel(&self) -> &N { &self.channel }

    /// Branch indices recorded per step so far.
    pub fn noise_outcomes(&self) -> &[Vec<usize>] { &self.outcomes }

    /// Sweeps the channel across the live qudits, then applies the step.
    ///
    /// # Errors
    /// `BoundMismatch` for a step of a foreign circuit, checked before any
    /// noise is drawn; otherwise whatever [`Engine::execute`] reports.
    pub fn execute(&mut self, step: &Step<'_>) -> Result<()> {
        if !ptr::eq(step.circuit(), self.engine.circuit()) {
            return Err(Error::BoundMismatch);
        }
        for q in self.engine.unmeasured_qudits() {
            if let Some(pos) = self.engine.position_of(q) {
                let (state, rng) = self.engine.state_and_rng();
                let (branch, psi) = self.channel.apply(state, pos, rng);
                self.engine.set_state(psi);
                trace!(step = step.position(), qudit = q, branch, "noise");
                self.outcomes[step.position()].push(branch);
            }
        }
        self.engine.execute(step)
    }

    /// Executes every step from the first.
    ///
    /// # Errors
    /// The first error any step reports.
    pub fn run(&mut self) -> Result<()> {
        let circuit = self.engine.circuit();
        for step in circuit.steps() {
            self.execute(&step)?;
        }
        Ok(())
    }

    /// Resets the wrapped engine and clears the recorded branches.
    pub fn reset(&mut self) -> &mut Self {
        self.engine.reset();
        for record in self.outcomes.iter_mut() {
            record.clear();
        }
        self
    }
}

impl<N> fmt::Display for NoisyEngine<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "noisy {}", self.engine)
    }
}
