//! Standard operand matrices and the registry that names them.
//!
//! The fixed qubit gates are `Lazy` statics; dimension-dependent operands
//! (rotations, the generalized shift/clock pair, the single-qudit Fourier
//! operator) are constructed on demand. A [`GateLibrary`] maps operand
//! matrices to display names by content hash so circuits can label steps
//! without storing duplicate matrices.

use nalgebra as na;
use num_complex::Complex64 as C64;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::ops::{self, CMat};

/// Single-qubit Hadamard matrix.
pub static HADAMARD: Lazy<CMat> = Lazy::new(|| {
    let h = C64::from(FRAC_1_SQRT_2);
    let mut m: na::DMatrix<C64> = na::DMatrix::zeros(2, 2);
    m[(0, 0)] = h;
    m[(0, 1)] = h;
    m[(1, 0)] = h;
    m[(1, 1)] = -h;
    m
});

/// Single-qubit Pauli X matrix.
pub static PAULI_X: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::zeros(2, 2);
    m[(0, 1)] = C64::from(1.0);
    m[(1, 0)] = C64::from(1.0);
    m
});

/// Single-qubit Pauli Y matrix.
pub static PAULI_Y: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::zeros(2, 2);
    m[(0, 1)] = -C64::i();
    m[(1, 0)] = C64::i();
    m
});

/// Single-qubit Pauli Z matrix.
pub static PAULI_Z: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::zeros(2, 2);
    m[(0, 0)] = C64::from(1.0);
    m[(1, 1)] = C64::from(-1.0);
    m
});

/// Single-qubit π/2 phase matrix.
pub static PHASE_S: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::zeros(2, 2);
    m[(0, 0)] = C64::from(1.0);
    m[(1, 1)] = C64::i();
    m
});

/// Single-qubit π/4 phase matrix.
pub static PHASE_T: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::zeros(2, 2);
    m[(0, 0)] = C64::from(1.0);
    m[(1, 1)] = C64::from_polar(1.0, PI / 4.0);
    m
});

/// Two-qubit controlled-X matrix, control on the first qubit.
pub static CNOT: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::identity(4, 4);
    m[(2, 2)] = C64::from(0.0);
    m[(3, 3)] = C64::from(0.0);
    m[(2, 3)] = C64::from(1.0);
    m[(3, 2)] = C64::from(1.0);
    m
});

/// Two-qubit controlled-Z matrix.
pub static CZ: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::identity(4, 4);
    m[(3, 3)] = C64::from(-1.0);
    m
});

/// Two-qubit swap matrix.
pub static SWAP: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::identity(4, 4);
    m[(1, 1)] = C64::from(0.0);
    m[(2, 2)] = C64::from(0.0);
    m[(1, 2)] = C64::from(1.0);
    m[(2, 1)] = C64::from(1.0);
    m
});

/// Three-qubit Toffoli matrix, controls on the first two qubits.
pub static TOFFOLI: Lazy<CMat> = Lazy::new(|| {
    let mut m: na::DMatrix<C64> = na::DMatrix::identity(8, 8);
    m[(6, 6)] = C64::from(0.0);
    m[(7, 7)] = C64::from(0.0);
    m[(6, 7)] = C64::from(1.0);
    m[(7, 6)] = C64::from(1.0);
    m
});

/// Identity matrix of the given size.
pub fn identity(size: usize) -> CMat {
    CMat::identity(size, size)
}

/// Single-qubit rotation about X by `theta`.
pub fn rx(theta: f64) -> CMat {
    let c = C64::from((theta / 2.0).cos());
    let s = C64::new(0.0, -(theta / 2.0).sin());
    let mut m = CMat::zeros(2, 2);
    m[(0, 0)] = c;
    m[(0, 1)] = s;
    m[(1, 0)] = s;
    m[(1, 1)] = c;
    m
}

/// Single-qubit rotation about Y by `theta`.
pub fn ry(theta: f64) -> CMat {
    let c = C64::from((theta / 2.0).cos());
    let s = C64::from((theta / 2.0).sin());
    let mut m = CMat::zeros(2, 2);
    m[(0, 0)] = c;
    m[(0, 1)] = -s;
    m[(1, 0)] = s;
    m[(1, 1)] = c;
    m
}

/// Single-qubit rotation about Z by `theta`.
pub fn rz(theta: f64) -> CMat {
    let mut m = CMat::zeros(2, 2);
    m[(0, 0)] = C64::from_polar(1.0, -theta / 2.0);
    m[(1, 1)] = C64::from_polar(1.0, theta / 2.0);
    m
}

/// Generalized Pauli X on one qudit: cycles each basis level up by one.
///
/// # Panics
/// When `dim` is below two.
pub fn shift(dim: usize) -> CMat {
    assert!(dim >= 2);
    let mut m = CMat::zeros(dim, dim);
    for j in 0..dim {
        m[((j + 1) % dim, j)] = C64::from(1.0);
    }
    m
}

/// Generalized Pauli Z on one qudit: phases level `j` by `ω^j` for
/// `ω = exp(2πi/dim)`.
///
/// # Panics
/// When `dim` is below two.
pub fn clock(dim: usize) -> CMat {
    assert!(dim >= 2);
    let mut m = CMat::zeros(dim, dim);
    for j in 0..dim {
        m[(j, j)] = C64::from_polar(1.0, 2.0 * PI * j as f64 / dim as f64);
    }
    m
}

/// Discrete Fourier transform operator on one qudit.
///
/// # Panics
/// When `dim` is below two.
pub fn fourier_op(dim: usize) -> CMat {
    assert!(dim >= 2);
    let norm = 1.0 / (dim as f64).sqrt();
    let mut m = CMat::zeros(dim, dim);
    for r in 0..dim {
        for c in 0..dim {
            m[(r, c)] = C64::from_polar(norm, 2.0 * PI * (r * c) as f64 / dim as f64);
        }
    }
    m
}

/// Registry mapping operand matrices to display names by content hash.
///
/// Registration never overwrites: the first name bound to a matrix wins.
#[derive(Clone, Debug)]
pub struct GateLibrary {
    known: FxHashMap<u64, (String, CMat)>,
}

impl GateLibrary {
    /// Library with no entries.
    pub fn empty() -> Self {
        Self { known: FxHashMap::default() }
    }

    /// Library of the standard qubit gates.
    pub fn new() -> Self {
        let mut lib = Self::empty();
        lib.register(&HADAMARD, "H")
            .register(&PAULI_X, "X")
            .register(&PAULI_Y, "Y")
            .register(&PAULI_Z, "Z")
            .register(&PHASE_S, "S")
            .register(&PHASE_T, "T")
            .register(&CNOT, "CNOT")
            .register(&CZ, "CZ")
            .register(&SWAP, "SWAP")
            .register(&TOFFOLI, "TOF");
        lib
    }

    /// Library for qudits of the given dimension: the qubit set when
    /// `dim == 2`, plus the generalized shift, clock, and Fourier operators.
    ///
    /// # Panics
    /// When `dim` is below two.
    pub fn with_dim(dim: usize) -> Self {
        let mut lib = if dim == 2 { Self::new() } else { Self::empty() };
        lib.register(&shift(dim), "Xd")
            .register(&clock(dim), "Zd")
            .register(&fourier_op(dim), "Fd");
        lib
    }

    /// Binds `name` to `u` unless an equal matrix is already registered.
    pub fn register(&mut self, u: &CMat, name: &str) -> &mut Self {
        let key = ops::hash_matrix(u);
        self.known
            .entry(key)
            .or_insert_with(|| (name.to_owned(), u.clone()));
        self
    }

    /// Display name of `u`, confirming the hash hit against the stored
    /// matrix.
    pub fn name_of(&self, u: &CMat) -> Option<&str> {
        let key = ops::hash_matrix(u);
        self.known
            .get(&key)
            .filter(|(_, m)| ops::mats_equal(m, u))
            .map(|(name, _)| name.as_str())
    }

    /// Number of registered operands.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// True when no operands are registered.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

impl Default for GateLibrary {
    fn default() -> Self {
        Self::new()
    }
}
