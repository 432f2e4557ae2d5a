//! Quantum circuits as validated, append-only instruction streams over
//! registers of qudits, with a step-by-step state-vector interpreter and
//! optional stochastic noise injection.
//!
//! A [`circuit::Circuit`] records gate and measurement instructions
//! against a fixed register shape, interning operand matrices by content
//! hash. An [`engine::Engine`] binds to a finished circuit and replays its
//! steps against a live state vector, relabeling the register as qudits
//! are consumed by destructive measurements. A [`noise::NoisyEngine`]
//! sweeps a [`noise::NoiseChannel`] across the live qudits before every
//! step, following the quantum-trajectory rule.

pub mod error;
pub mod ops;
pub mod gates;
pub mod circuit;
pub mod engine;
pub mod noise;

pub use error::{Error, Result};
pub use circuit::Circuit;
pub use engine::Engine;
pub use noise::NoisyEngine;
