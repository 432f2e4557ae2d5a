//! Dense state-vector kernels.
//!
//! States live in the computational basis with qudit 0 as the most
//! significant digit: for `n` qudits of dimension `d`, basis index
//! `i = Σ_q digit(q) · d^(n-1-q)`. All kernels take target positions in
//! that convention and leave the input state untouched, returning a fresh
//! vector.

use itertools::Itertools;
use nalgebra as na;
use num_complex::Complex64 as C64;
use rand::Rng;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Dynamically sized complex matrix.
pub type CMat = na::DMatrix<C64>;

/// Dynamically sized complex column vector.
pub type CVec = na::DVector<C64>;

/// Branch weights below this are treated as dead and never sampled.
pub(crate) const PROB_EPS: f64 = 1e-12;

/// The all-zero basis state over `num_qudits` qudits of dimension `dim`.
pub fn zero_state(num_qudits: usize, dim: usize) -> CVec {
    let mut psi = CVec::zeros(dim.pow(num_qudits as u32));
    psi[0] = C64::from(1.0);
    psi
}

/// Number of qudits encoded by a state of length `len`.
pub(crate) fn qudit_count(len: usize, dim: usize) -> usize {
    let mut n: usize = 0;
    let mut size: usize = 1;
    while size < len {
        size *= dim;
        n += 1;
    }
    debug_assert_eq!(size, len);
    n
}

fn stride(q: usize, n: usize, dim: usize) -> usize {
    dim.pow((n - 1 - q) as u32)
}

/// Basis-index offsets of the `d^k` joint target configurations, row-major
/// over `targets` (the last target cycles fastest).
fn target_offsets(targets: &[usize], n: usize, dim: usize) -> Vec<usize> {
    let dk = dim.pow(targets.len() as u32);
    (0..dk)
        .map(|r| {
            let mut off: usize = 0;
            let mut rem = r;
            for &t in targets.iter().rev() {
                off += (rem % dim) * stride(t, n, dim);
                rem /= dim;
            }
            off
        })
        .collect()
}

/// Base indices enumerating every configuration of the spectator qudits, in
/// ascending basis order of the remaining register.
fn spectator_bases(spectators: &[usize], n: usize, dim: usize) -> Vec<usize> {
    if spectators.is_empty() {
        return vec![0];
    }
    spectators
        .iter()
        .map(|&q| {
            let s = stride(q, n, dim);
            (0..dim).map(|digit| digit * s).collect::<Vec<usize>>()
        })
        .multi_cartesian_product()
        .map(|parts| parts.into_iter().sum::<usize>())
        .collect()
}

/// Applies the joint unitary `u` to `targets`, leaving all other qudits
/// untouched.
///
/// `u` must be `d^k`-dimensional for `k` targets; target order matters, the
/// first target is the most significant digit of `u`'s index space.
pub fn apply(psi: &CVec, u: &CMat, targets: &[usize], dim: usize) -> CVec {
    let n = qudit_count(psi.len(), dim);
    debug_assert!(u.is_square());
    debug_assert_eq!(u.nrows(), dim.pow(targets.len() as u32));
    debug_assert!(targets.iter().all(|&t| t < n));

    let offsets = target_offsets(targets, n, dim);
    let spectators: Vec<usize> = (0..n).filter(|q| !targets.contains(q)).collect();
    let mut out = CVec::zeros(psi.len());
    for base in spectator_bases(&spectators, n, dim) {
        for (r, &off_r) in offsets.iter().enumerate() {
            let mut acc = C64::from(0.0);
            for (c, &off_c) in offsets.iter().enumerate() {
                acc += u[(r, c)] * psi[base + off_c];
            }
            out[base + off_r] = acc;
        }
    }
    out
}

/// Applies `u` to `targets` conditioned on the control qudits: the branch in
/// which every control holds level `j` receives `u^j`.
///
/// `u` may be given either jointly (`d^k`-dimensional) or as a single-qudit
/// matrix that is fanned to the `k`-fold Kronecker power.
pub fn apply_ctrl(psi: &CVec, u: &CMat, ctrls: &[usize], targets: &[usize], dim: usize) -> CVec {
    let n = qudit_count(psi.len(), dim);
    let dk = dim.pow(targets.len() as u32);
    debug_assert!(!ctrls.is_empty() && !targets.is_empty());
    debug_assert!(ctrls.iter().chain(targets.iter()).all(|&q| q < n));
    debug_assert!(ctrls.iter().all(|c| !targets.contains(c)));
    debug_assert!(u.nrows() == dk || u.nrows() == dim);

    let fanned: CMat;
    let joint: &CMat = if u.nrows() == dk {
        u
    } else {
        fanned = kron_pow(u, targets.len());
        &fanned
    };

    let offsets = target_offsets(targets, n, dim);
    let spectators: Vec<usize> = (0..n)
        .filter(|q| !targets.contains(q) && !ctrls.contains(q))
        .collect();
    let bases = spectator_bases(&spectators, n, dim);

    let mut out = psi.clone();
    for j in 1..dim {
        let uj = powm(joint, j);
        let ctrl_off: usize = ctrls.iter().map(|&c| j * stride(c, n, dim)).sum();
        for &base in bases.iter() {
            let shifted = base + ctrl_off;
            // gather before scattering: the rows are rewritten in place
            let col: Vec<C64> = offsets.iter().map(|&o| out[shifted + o]).collect();
            for (r, &off_r) in offsets.iter().enumerate() {
                let mut acc = C64::from(0.0);
                for (c, &amp) in col.iter().enumerate() {
                    acc += uj[(r, c)] * amp;
                }
                out[shifted + off_r] = acc;
            }
        }
    }
    out
}

/// `u` raised to the `exp`-th power by repeated multiplication.
pub fn powm(u: &CMat, exp: usize) -> CMat {
    let mut acc = CMat::identity(u.nrows(), u.ncols());
    for _ in 0..exp {
        acc = &acc * u;
    }
    acc
}

/// `k`-fold Kronecker power of `u`; `k` must be at least one.
pub fn kron_pow(u: &CMat, k: usize) -> CMat {
    debug_assert!(k >= 1);
    let mut acc = u.clone();
    for _ in 1..k {
        acc = acc.kronecker(u);
    }
    acc
}

/// Destructively measures `target` in the computational basis.
///
/// Returns the sampled outcome, its probability, and the renormalized state
/// over the remaining `n - 1` qudits with `target`'s digit removed.
pub fn measure_seq<R>(psi: &CVec, target: usize, dim: usize, rng: &mut R) -> (usize, f64, CVec)
where
    R: Rng + ?Sized,
{
    let n = qudit_count(psi.len(), dim);
    debug_assert!(target < n);
    let s = stride(target, n, dim);

    let mut weights = vec![0.0_f64; dim];
    for (i, amp) in psi.iter().enumerate() {
        weights[(i / s) % dim] += amp.norm_sqr();
    }
    let outcome = sample_index(&weights, rng);
    let p = weights[outcome];

    let norm = p.sqrt();
    let mut collapsed = CVec::zeros(psi.len() / dim);
    let mut w: usize = 0;
    for (i, amp) in psi.iter().enumerate() {
        if (i / s) % dim == outcome {
            collapsed[w] = amp / norm;
            w += 1;
        }
    }
    (outcome, p, collapsed)
}

/// Destructively measures `targets` jointly in the orthonormal basis given
/// by the columns of `v`.
///
/// Returns the sampled outcome, the probability of every outcome, and the
/// renormalized post-measurement state for every outcome over the remaining
/// qudits. Branches with vanishing probability are zero vectors and are
/// never sampled.
pub fn measure_basis<R>(
    psi: &CVec,
    v: &CMat,
    targets: &[usize],
    dim: usize,
    rng: &mut R,
) -> (usize, Vec<f64>, Vec<CVec>)
where
    R: Rng + ?Sized,
{
    let n = qudit_count(psi.len(), dim);
    let dk = dim.pow(targets.len() as u32);
    debug_assert!(v.is_square());
    debug_assert_eq!(v.nrows(), dk);
    debug_assert!(targets.iter().all(|&t| t < n));

    let offsets = target_offsets(targets, n, dim);
    let spectators: Vec<usize> = (0..n).filter(|q| !targets.contains(q)).collect();
    let bases = spectator_bases(&spectators, n, dim);

    let mut probs = vec![0.0_f64; dk];
    let mut branches: Vec<CVec> = Vec::with_capacity(dk);
    for i in 0..dk {
        // project ⟨v_i| onto the targets for every spectator configuration
        let mut residual = CVec::zeros(bases.len());
        for (w, &base) in bases.iter().enumerate() {
            let mut acc = C64::from(0.0);
            for (c, &off) in offsets.iter().enumerate() {
                acc += v[(c, i)].conj() * psi[base + off];
            }
            residual[w] = acc;
        }
        let p: f64 = residual.iter().map(|a| a.norm_sqr()).sum();
        probs[i] = p;
        if p > PROB_EPS {
            let norm = p.sqrt();
            branches.push(residual.map(|a| a / norm));
        } else {
            branches.push(CVec::zeros(bases.len()));
        }
    }
    let outcome = sample_index(&probs, rng);
    (outcome, probs, branches)
}

/// Samples an index proportionally to `weights`; zero-weight entries are
/// never chosen.
pub(crate) fn sample_index<R>(weights: &[f64], rng: &mut R) -> usize
where
    R: Rng + ?Sized,
{
    let total: f64 = weights.iter().sum();
    let mut x = rng.gen::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        if w <= PROB_EPS {
            continue;
        }
        if x < w {
            return i;
        }
        x -= w;
    }
    // accumulated rounding pushed x past the live mass
    weights
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Content hash of a matrix over its shape and raw element bits, in column
/// order.
pub fn hash_matrix(m: &CMat) -> u64 {
    let mut hasher = FxHasher::default();
    m.nrows().hash(&mut hasher);
    m.ncols().hash(&mut hasher);
    for a in m.iter() {
        a.re.to_bits().hash(&mut hasher);
        a.im.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Bitwise equality of two matrices, consistent with [`hash_matrix`].
pub fn mats_equal(a: &CMat, b: &CMat) -> bool {
    a.nrows() == b.nrows()
        && a.ncols() == b.ncols()
        && a.iter().zip(b.iter()).all(|(x, y)| {
            x.re.to_bits() == y.re.to_bits() && x.im.to_bits() == y.im.to_bits()
        })
}
