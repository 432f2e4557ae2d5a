//! Append-only circuit descriptions.
//!
//! A [`Circuit`] records gate and measurement instructions against a fixed
//! register shape: a number of qudits of one dimension and a number of
//! classical registers ("dits"). Instructions are validated in full before
//! any state is touched, so a failed append leaves the circuit unchanged.
//! Operand matrices are interned by content hash and steps refer to them by
//! [`OperandKey`].
//!
//! Circuits are pure descriptions; an [`Engine`](crate::engine::Engine)
//! binds to one and replays its steps. Qudits used as measurement targets
//! are marked consumed at build time and refuse further instructions.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::gates::GateLibrary;
use crate::ops::{self, CMat};

/// Classification tag for a gate instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GateKind {
    /// Explicit do-nothing step; never produced by the builders.
    Nop,
    /// Unitary on one qudit.
    Single,
    /// Joint unitary on two qudits.
    Two,
    /// Joint unitary on three qudits.
    Three,
    /// Joint unitary on an arbitrary target set.
    Custom,
    /// One single-qudit unitary broadcast over several targets.
    Fan,
    /// Quantum Fourier transform; reserved, rejected at append time.
    Fourier,
    /// Inverse quantum Fourier transform; reserved, rejected at append time.
    FourierInv,
    /// One control qudit, one target.
    Ctrl,
    /// One control qudit, several fanned targets.
    CtrlFan,
    /// Several control qudits, one target.
    MultiCtrl,
    /// Several control qudits, several fanned targets.
    MultiCtrlFan,
    /// Control qudits over a joint operand on an arbitrary target set.
    CtrlCustom,
    /// One classical control register, one target.
    CCtrl,
    /// One classical control register, several fanned targets.
    CCtrlFan,
    /// Several classical control registers, one target.
    MultiCCtrl,
    /// Several classical control registers, several fanned targets.
    MultiCCtrlFan,
    /// Classical control registers over a joint operand.
    CCtrlCustom,
}

impl GateKind {
    /// True for the classically controlled kinds.
    pub fn is_classical(&self) -> bool {
        matches!(
            self,
            Self::CCtrl | Self::CCtrlFan | Self::MultiCCtrl | Self::MultiCCtrlFan | Self::CCtrlCustom
        )
    }

    /// True for the quantum-controlled kinds.
    pub fn is_controlled(&self) -> bool {
        matches!(
            self,
            Self::Ctrl | Self::CtrlFan | Self::MultiCtrl | Self::MultiCtrlFan | Self::CtrlCustom
        )
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Nop => "nop",
            Self::Single => "single",
            Self::Two => "two",
            Self::Three => "three",
            Self::Custom => "custom",
            Self::Fan => "fan",
            Self::Fourier => "fourier",
            Self::FourierInv => "fourier-inv",
            Self::Ctrl => "ctrl",
            Self::CtrlFan => "ctrl-fan",
            Self::MultiCtrl => "multi-ctrl",
            Self::MultiCtrlFan => "multi-ctrl-fan",
            Self::CtrlCustom => "ctrl-custom",
            Self::CCtrl => "cctrl",
            Self::CCtrlFan => "cctrl-fan",
            Self::MultiCCtrl => "multi-cctrl",
            Self::MultiCCtrlFan => "multi-cctrl-fan",
            Self::CCtrlCustom => "cctrl-custom",
        };
        write!(f, "{}", token)
    }
}

/// Classification tag for a measurement instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeasureKind {
    /// Destructive single-qudit measurement in the computational basis.
    Computational,
    /// Destructive single-qudit measurement in an explicit orthonormal basis.
    Basis,
    /// Destructive joint measurement of several qudits in an explicit basis.
    BasisJoint,
}

impl fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            Self::Computational => "computational",
            Self::Basis => "basis",
            Self::BasisJoint => "basis-joint",
        };
        write!(f, "{}", token)
    }
}

/// Which typed sequence a step in the interleaved stream comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepKind {
    Gate,
    Measurement,
}

/// Content-hash key of an interned operand matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperandKey(pub u64);

impl fmt::Display for OperandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// One recorded gate instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct GateStep {
    /// Classification of the instruction.
    pub kind: GateKind,
    /// Key of the interned operand matrix.
    pub operand: OperandKey,
    /// Control indices: qudits for the quantum-controlled kinds, classical
    /// registers for the classical ones, empty otherwise.
    pub controls: Vec<usize>,
    /// Target qudit indices, in application order.
    pub targets: Vec<usize>,
    /// Display name used for counters and reports.
    pub name: String,
}

/// One recorded measurement instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasureStep {
    /// Classification of the instruction.
    pub kind: MeasureKind,
    /// Keys of the interned basis operands; empty for computational.
    pub operands: Vec<OperandKey>,
    /// Measured qudit indices.
    pub targets: Vec<usize>,
    /// Classical register receiving the outcome.
    pub dit: usize,
    /// Display name used for counters and reports.
    pub name: String,
}

/// An append-only quantum circuit over a fixed register shape.
///
/// Builders return `Result<&mut Self>`, so instructions chain:
///
/// ```
/// # use qudit_sim::circuit::Circuit;
/// # use qudit_sim::gates;
/// # fn main() -> qudit_sim::Result<()> {
/// let mut circ = Circuit::new(2, 2, 2, Some("bell"))?;
/// circ.gate(&gates::HADAMARD, 0, None)?
///     .ctrl(&gates::PAULI_X, 0, 1, None)?
///     .measure(0, 0, None)?
///     .measure(1, 1, None)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Circuit {
    num_qudits: usize,
    num_dits: usize,
    dim: usize,
    name: Option<String>,
    library: GateLibrary,
    gates: Vec<GateStep>,
    measures: Vec<MeasureStep>,
    step_kinds: Vec<StepKind>,
    operands: FxHashMap<u64, CMat>,
    gate_counts: FxHashMap<String, usize>,
    measure_counts: FxHashMap<String, usize>,
    measured: Vec<bool>,
}

impl Circuit {
    /// Creates an empty circuit over `num_qudits` qudits of dimension `dim`
    /// with `num_dits` classical registers.
    ///
    /// Steps are named through [`GateLibrary::with_dim`]; use
    /// [`Circuit::with_library`] to supply a custom registry.
    ///
    /// # Errors
    /// `InvalidShape` when `num_qudits` is zero or `dim` is below two.
    pub fn new(num_qudits: usize, num_dits: usize, dim: usize, name: Option<&str>) -> Result<Self> {
        check_shape(num_qudits, dim)?;
        Self::with_library(num_qudits, num_dits, dim, name, GateLibrary::with_dim(dim))
    }

    /// Same as [`Circuit::new`] with an explicit naming library.
    pub fn with_library(
        num_qudits: usize,
        num_dits: usize,
        dim: usize,
        name: Option<&str>,
        library: GateLibrary,
    ) -> Result<Self> {
        check_shape(num_qudits, dim)?;
        Ok(Self {
            num_qudits,
            num_dits,
            dim,
            name: name.map(str::to_owned),
            library,
            gates: Vec::new(),
            measures: Vec::new(),
            step_kinds: Vec::new(),
            operands: FxHashMap::default(),
            gate_counts: FxHashMap::default(),
            measure_counts: FxHashMap::default(),
            measured: vec![false; num_qudits],
        })
    }

    /// Number of qudits.
    pub fn num_qudits(&self) -> usize { self.num_qudits }

    /// Number of classical registers.
    pub fn num_dits(&self) -> usize { self.num_dits }

    /// Qudit dimension.
    pub fn dim(&self) -> usize { self.dim }

    /// Circuit name, if one was given.
    pub fn name(&self) -> Option<&str> { self.name.as_deref() }

    /// Total number of recorded steps.
    pub fn step_count(&self) -> usize { self.step_kinds.len() }

    /// Recorded gate instructions in append order.
    pub fn gate_steps(&self) -> &[GateStep] { &self.gates }

    /// Recorded measurement instructions in append order.
    pub fn measure_steps(&self) -> &[MeasureStep] { &self.measures }

    /// Step-kind tags in execution order.
    pub fn step_kinds(&self) -> &[StepKind] { &self.step_kinds }

    /// Total gate count; a fan counts once per target.
    pub fn gate_count(&self) -> usize { self.gate_counts.values().sum() }

    /// Uses of gates named `name`.
    pub fn gate_count_of(&self, name: &str) -> usize {
        self.gate_counts.get(name).copied().unwrap_or(0)
    }

    /// Total measurement count.
    pub fn measurement_count(&self) -> usize { self.measure_counts.values().sum() }

    /// Uses of measurements named `name`.
    pub fn measurement_count_of(&self, name: &str) -> usize {
        self.measure_counts.get(name).copied().unwrap_or(0)
    }

    /// Number of distinct interned operand matrices.
    pub fn operand_count(&self) -> usize { self.operands.len() }

    /// Interned operand matrix for `key`.
    pub fn operand(&self, key: OperandKey) -> Option<&CMat> {
        self.operands.get(&key.0)
    }

    /// The naming library in use.
    pub fn library(&self) -> &GateLibrary { &self.library }

    /// True when `qudit` was used as a measurement target while building.
    ///
    /// # Panics
    /// When `qudit` is not below [`Circuit::num_qudits`].
    pub fn is_measured(&self, qudit: usize) -> bool {
        self.measured[qudit]
    }

    /// Qudits marked measured while building, ascending.
    pub fn measured_qudits(&self) -> Vec<usize> {
        (0..self.num_qudits).filter(|&q| self.measured[q]).collect()
    }

    /// Qudits not yet marked measured, ascending.
    pub fn unmeasured_qudits(&self) -> Vec<usize> {
        (0..self.num_qudits).filter(|&q| !self.measured[q]).collect()
    }

    /// Logical gate depth. Not provided.
    ///
    /// # Errors
    /// Always `UnsupportedOperation`; the depth is never silently zero.
    pub fn gate_depth(&self) -> Result<usize> {
        Err(Error::UnsupportedOperation { what: "gate depth" })
    }

    /// Logical gate depth restricted to gates named `name`. Not provided.
    ///
    /// # Errors
    /// Always `UnsupportedOperation`.
    pub fn gate_depth_of(&self, _name: &str) -> Result<usize> {
        Err(Error::UnsupportedOperation { what: "gate depth" })
    }

    /// Cursor over the interleaved step stream from the beginning.
    pub fn steps(&self) -> Steps<'_> {
        Steps::new(self)
    }

    fn check_qudit_bound(&self, role: &'static str, index: usize) -> Result<()> {
        if index >= self.num_qudits {
            return Err(Error::InvalidIndex {
                step: self.step_count(),
                role,
                index,
                bound: self.num_qudits,
            });
        }
        Ok(())
    }

    fn check_dit_bound(&self, role: &'static str, index: usize) -> Result<()> {
        if index >= self.num_dits {
            return Err(Error::InvalidIndex {
                step: self.step_count(),
                role,
                index,
                bound: self.num_dits,
            });
        }
        Ok(())
    }

    fn check_unmeasured(&self, qudit: usize) -> Result<()> {
        if self.measured[qudit] {
            return Err(Error::AlreadyMeasured { step: self.step_count(), qudit });
        }
        Ok(())
    }

    fn check_no_dups(&self, role: &'static str, list: &[usize]) -> Result<()> {
        for (i, &a) in list.iter().enumerate() {
            if list[..i].contains(&a) {
                return Err(Error::DuplicateIndex { step: self.step_count(), role, index: a });
            }
        }
        Ok(())
    }

    fn check_disjoint(&self, ctrls: &[usize], targets: &[usize]) -> Result<()> {
        for &c in ctrls {
            if targets.contains(&c) {
                return Err(Error::InvalidIndex {
                    step: self.step_count(),
                    role: "control/target",
                    index: c,
                    bound: self.num_qudits,
                });
            }
        }
        Ok(())
    }

    fn check_nonempty(&self, role: &'static str, list: &[usize]) -> Result<()> {
        if list.is_empty() {
            return Err(Error::EmptyTargetSet { step: self.step_count(), role });
        }
        Ok(())
    }

    fn check_operand(&self, u: &CMat, qudits: usize) -> Result<()> {
        let expected = self.dim.pow(qudits as u32);
        if u.nrows() != u.ncols() || u.nrows() != expected {
            return Err(Error::ShapeMismatch {
                step: self.step_count(),
                rows: u.nrows(),
                cols: u.ncols(),
                expected,
            });
        }
        Ok(())
    }

    /// Inserts `u` under `key`, or confirms the existing entry is the same
    /// matrix.
    fn intern(&mut self, key: u64, u: &CMat) -> Result<OperandKey> {
        if let Some(existing) = self.operands.get(&key) {
            if !ops::mats_equal(existing, u) {
                return Err(Error::IntegrityViolation { step: self.step_count(), key });
            }
        } else {
            self.operands.insert(key, u.clone());
        }
        Ok(OperandKey(key))
    }

    fn gate_name(&self, explicit: Option<&str>, u: &CMat) -> String {
        match explicit {
            Some(s) => s.to_owned(),
            None => self.library.name_of(u).map(str::to_owned).unwrap_or_default(),
        }
    }

    fn ctrl_name(&self, explicit: Option<&str>, u: &CMat, classical: bool) -> String {
        if let Some(s) = explicit {
            return s.to_owned();
        }
        let prefix = if classical { "cCTRL" } else { "CTRL" };
        match self.library.name_of(u) {
            Some(g) if !g.is_empty() => format!("{}-{}", prefix, g),
            _ => prefix.to_owned(),
        }
    }

    fn push_gate(
        &mut self,
        kind: GateKind,
        operand: OperandKey,
        controls: Vec<usize>,
        targets: Vec<usize>,
        name: String,
        weight: usize,
    ) {
        *self.gate_counts.entry(name.clone()).or_insert(0) += weight;
        self.gates.push(GateStep { kind, operand, controls, targets, name });
        self.step_kinds.push(StepKind::Gate);
    }

    fn push_measure(
        &mut self,
        kind: MeasureKind,
        operands: Vec<OperandKey>,
        targets: Vec<usize>,
        dit: usize,
        name: String,
    ) {
        for &t in targets.iter() {
            self.measured[t] = true;
        }
        *self.measure_counts.entry(name.clone()).or_insert(0) += 1;
        self.measures.push(MeasureStep { kind, operands, targets, dit, name });
        self.step_kinds.push(StepKind::Measurement);
    }

    /// Appends a single-qudit gate on `target`.
    ///
    /// `name` defaults to the library's name for `u`, or the empty string
    /// when the library does not know it.
    ///
    /// # Errors
    /// `InvalidIndex`, `AlreadyMeasured`, `ShapeMismatch`, or
    /// `IntegrityViolation`.
    pub fn gate(&mut self, u: &CMat, target: usize, name: Option<&str>) -> Result<&mut Self> {
        self.check_qudit_bound("target", target)?;
        self.check_unmeasured(target)?;
        self.check_operand(u, 1)?;
        let name = self.gate_name(name, u);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::Single, key, Vec::new(), vec![target], name, 1);
        Ok(self)
    }

    /// Appends a joint two-qudit gate on `(q0, q1)`; `q0` indexes the more
    /// significant digit of the operand.
    ///
    /// # Errors
    /// `InvalidIndex`, `DuplicateIndex`, `AlreadyMeasured`,
    /// `ShapeMismatch`, or `IntegrityViolation`.
    pub fn gate2(&mut self, u: &CMat, q0: usize, q1: usize, name: Option<&str>) -> Result<&mut Self> {
        self.check_qudit_bound("target", q0)?;
        self.check_qudit_bound("target", q1)?;
        self.check_no_dups("target", &[q0, q1])?;
        self.check_unmeasured(q0)?;
        self.check_unmeasured(q1)?;
        self.check_operand(u, 2)?;
        let name = self.gate_name(name, u);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::Two, key, Vec::new(), vec![q0, q1], name, 1);
        Ok(self)
    }

    /// Appends a joint three-qudit gate on `(q0, q1, q2)`.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::gate2`].
    pub fn gate3(
        &mut self,
        u: &CMat,
        q0: usize,
        q1: usize,
        q2: usize,
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_qudit_bound("target", q0)?;
        self.check_qudit_bound("target", q1)?;
        self.check_qudit_bound("target", q2)?;
        self.check_no_dups("target", &[q0, q1, q2])?;
        self.check_unmeasured(q0)?;
        self.check_unmeasured(q1)?;
        self.check_unmeasured(q2)?;
        self.check_operand(u, 3)?;
        let name = self.gate_name(name, u);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::Three, key, Vec::new(), vec![q0, q1, q2], name, 1);
        Ok(self)
    }

    /// Appends a joint gate over an arbitrary target set; the operand must
    /// be `d^k`-dimensional for `k` targets.
    ///
    /// # Errors
    /// `EmptyTargetSet`, `InvalidIndex`, `AlreadyMeasured`,
    /// `DuplicateIndex`, `ShapeMismatch`, or `IntegrityViolation`.
    pub fn gate_custom(&mut self, u: &CMat, targets: &[usize], name: Option<&str>) -> Result<&mut Self> {
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_operand(u, targets.len())?;
        let name = self.gate_name(name, u);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::Custom, key, Vec::new(), targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends one single-qudit gate broadcast over `targets` in order.
    ///
    /// Counts once per target toward [`Circuit::gate_count`].
    ///
    /// # Errors
    /// Same conditions as [`Circuit::gate_custom`], with the operand
    /// required single-qudit.
    pub fn gate_fan(&mut self, u: &CMat, targets: &[usize], name: Option<&str>) -> Result<&mut Self> {
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_operand(u, 1)?;
        let name = self.gate_name(name, u);
        let key = self.intern(ops::hash_matrix(u), u)?;
        let weight = targets.len();
        self.push_gate(GateKind::Fan, key, Vec::new(), targets.to_vec(), name, weight);
        Ok(self)
    }

    /// Broadcasts `u` over every qudit not yet marked measured.
    ///
    /// # Errors
    /// `EmptyTargetSet` when every qudit is measured, plus the conditions
    /// of [`Circuit::gate_fan`].
    pub fn gate_fan_all(&mut self, u: &CMat, name: Option<&str>) -> Result<&mut Self> {
        let targets = self.unmeasured_qudits();
        self.gate_fan(u, &targets, name)
    }

    /// Quantum Fourier transform over `targets`. Reserved.
    ///
    /// # Errors
    /// Always `UnsupportedOperation`; no step is appended.
    pub fn fourier(&mut self, _targets: &[usize]) -> Result<&mut Self> {
        Err(Error::UnsupportedOperation { what: "fourier transform step" })
    }

    /// Inverse quantum Fourier transform over `targets`. Reserved.
    ///
    /// # Errors
    /// Always `UnsupportedOperation`; no step is appended.
    pub fn fourier_inv(&mut self, _targets: &[usize]) -> Result<&mut Self> {
        Err(Error::UnsupportedOperation { what: "inverse fourier transform step" })
    }

    /// Appends a controlled gate: `u^j` on `target` for the branch in which
    /// the control qudit holds level `j`.
    ///
    /// `name` defaults to `CTRL-<g>` when the library knows `u` as `<g>`,
    /// else `CTRL`.
    ///
    /// # Errors
    /// `InvalidIndex` (also for control/target overlap), `AlreadyMeasured`,
    /// `ShapeMismatch`, or `IntegrityViolation`.
    pub fn ctrl(&mut self, u: &CMat, ctrl: usize, target: usize, name: Option<&str>) -> Result<&mut Self> {
        self.check_qudit_bound("control", ctrl)?;
        self.check_qudit_bound("target", target)?;
        self.check_disjoint(&[ctrl], &[target])?;
        self.check_unmeasured(ctrl)?;
        self.check_unmeasured(target)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, false);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::Ctrl, key, vec![ctrl], vec![target], name, 1);
        Ok(self)
    }

    /// Appends a controlled gate fanned over `targets` under one control
    /// qudit.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::ctrl`] plus `EmptyTargetSet` and
    /// `DuplicateIndex`.
    pub fn ctrl_fan(
        &mut self,
        u: &CMat,
        ctrl: usize,
        targets: &[usize],
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_qudit_bound("control", ctrl)?;
        self.check_unmeasured(ctrl)?;
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_disjoint(&[ctrl], targets)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, false);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::CtrlFan, key, vec![ctrl], targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends a gate on `target` under several control qudits; the branch
    /// in which every control holds level `j` receives `u^j`.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::ctrl`] plus `EmptyTargetSet` and
    /// `DuplicateIndex` on the control list.
    pub fn ctrl_multi(
        &mut self,
        u: &CMat,
        ctrls: &[usize],
        target: usize,
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("control", ctrls)?;
        for &c in ctrls {
            self.check_qudit_bound("control", c)?;
            self.check_unmeasured(c)?;
        }
        self.check_no_dups("control", ctrls)?;
        self.check_qudit_bound("target", target)?;
        self.check_unmeasured(target)?;
        self.check_disjoint(ctrls, &[target])?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, false);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::MultiCtrl, key, ctrls.to_vec(), vec![target], name, 1);
        Ok(self)
    }

    /// Appends a controlled gate fanned over `targets` under several
    /// control qudits.
    ///
    /// # Errors
    /// Union of the conditions of [`Circuit::ctrl_fan`] and
    /// [`Circuit::ctrl_multi`].
    pub fn ctrl_multi_fan(
        &mut self,
        u: &CMat,
        ctrls: &[usize],
        targets: &[usize],
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("control", ctrls)?;
        for &c in ctrls {
            self.check_qudit_bound("control", c)?;
            self.check_unmeasured(c)?;
        }
        self.check_no_dups("control", ctrls)?;
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_disjoint(ctrls, targets)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, false);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::MultiCtrlFan, key, ctrls.to_vec(), targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends a controlled joint gate: the operand is `d^k`-dimensional
    /// over the `k` targets.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::ctrl_multi_fan`], with the operand
    /// checked against the full target arity.
    pub fn ctrl_custom(
        &mut self,
        u: &CMat,
        ctrls: &[usize],
        targets: &[usize],
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("control", ctrls)?;
        for &c in ctrls {
            self.check_qudit_bound("control", c)?;
            self.check_unmeasured(c)?;
        }
        self.check_no_dups("control", ctrls)?;
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_disjoint(ctrls, targets)?;
        self.check_operand(u, targets.len())?;
        let name = self.ctrl_name(name, u, false);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::CtrlCustom, key, ctrls.to_vec(), targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends a classically controlled gate: at execution, `u^v` on
    /// `target` where `v` is the value of classical register `dit`.
    ///
    /// `name` defaults to `cCTRL-<g>` when the library knows `u` as `<g>`,
    /// else `cCTRL`.
    ///
    /// # Errors
    /// `InvalidIndex`, `AlreadyMeasured`, `ShapeMismatch`, or
    /// `IntegrityViolation`.
    pub fn cctrl(&mut self, u: &CMat, dit: usize, target: usize, name: Option<&str>) -> Result<&mut Self> {
        self.check_dit_bound("dit", dit)?;
        self.check_qudit_bound("target", target)?;
        self.check_unmeasured(target)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, true);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::CCtrl, key, vec![dit], vec![target], name, 1);
        Ok(self)
    }

    /// Appends a classically controlled gate fanned over `targets` under
    /// one control register.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::cctrl`] plus `EmptyTargetSet` and
    /// `DuplicateIndex`.
    pub fn cctrl_fan(
        &mut self,
        u: &CMat,
        dit: usize,
        targets: &[usize],
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_dit_bound("dit", dit)?;
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, true);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::CCtrlFan, key, vec![dit], targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends a gate on `target` under several control registers; at
    /// execution the gate fires only when all registers agree.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::cctrl`] plus `EmptyTargetSet` and
    /// `DuplicateIndex` on the register list.
    pub fn cctrl_multi(
        &mut self,
        u: &CMat,
        dits: &[usize],
        target: usize,
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("control", dits)?;
        for &d in dits {
            self.check_dit_bound("dit", d)?;
        }
        self.check_no_dups("dit", dits)?;
        self.check_qudit_bound("target", target)?;
        self.check_unmeasured(target)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, true);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::MultiCCtrl, key, dits.to_vec(), vec![target], name, 1);
        Ok(self)
    }

    /// Appends a classically controlled gate fanned over `targets` under
    /// several control registers.
    ///
    /// # Errors
    /// Union of the conditions of [`Circuit::cctrl_fan`] and
    /// [`Circuit::cctrl_multi`].
    pub fn cctrl_multi_fan(
        &mut self,
        u: &CMat,
        dits: &[usize],
        targets: &[usize],
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("control", dits)?;
        for &d in dits {
            self.check_dit_bound("dit", d)?;
        }
        self.check_no_dups("dit", dits)?;
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_operand(u, 1)?;
        let name = self.ctrl_name(name, u, true);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::MultiCCtrlFan, key, dits.to_vec(), targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends a classically controlled joint gate over `targets`.
    ///
    /// # Errors
    /// Same conditions as [`Circuit::cctrl_multi_fan`], with the operand
    /// checked against the full target arity.
    pub fn cctrl_custom(
        &mut self,
        u: &CMat,
        dits: &[usize],
        targets: &[usize],
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("control", dits)?;
        for &d in dits {
            self.check_dit_bound("dit", d)?;
        }
        self.check_no_dups("dit", dits)?;
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_operand(u, targets.len())?;
        let name = self.ctrl_name(name, u, true);
        let key = self.intern(ops::hash_matrix(u), u)?;
        self.push_gate(GateKind::CCtrlCustom, key, dits.to_vec(), targets.to_vec(), name, 1);
        Ok(self)
    }

    /// Appends a destructive computational-basis measurement of `target`
    /// into classical register `dit`. Default name `"Z"`.
    ///
    /// The qudit is marked measured and refuses further instructions.
    ///
    /// # Errors
    /// `InvalidIndex` or `AlreadyMeasured`.
    pub fn measure(&mut self, target: usize, dit: usize, name: Option<&str>) -> Result<&mut Self> {
        self.check_qudit_bound("target", target)?;
        self.check_dit_bound("dit", dit)?;
        self.check_unmeasured(target)?;
        let name = name.map(str::to_owned).unwrap_or_else(|| "Z".to_owned());
        self.push_measure(MeasureKind::Computational, Vec::new(), vec![target], dit, name);
        Ok(self)
    }

    /// Appends a destructive measurement of `target` in the orthonormal
    /// basis given by the columns of `v`.
    ///
    /// # Errors
    /// `InvalidIndex`, `AlreadyMeasured`, `ShapeMismatch`, or
    /// `IntegrityViolation`.
    pub fn measure_in(&mut self, v: &CMat, target: usize, dit: usize, name: Option<&str>) -> Result<&mut Self> {
        self.check_qudit_bound("target", target)?;
        self.check_dit_bound("dit", dit)?;
        self.check_unmeasured(target)?;
        self.check_operand(v, 1)?;
        let name = self.gate_name(name, v);
        let key = self.intern(ops::hash_matrix(v), v)?;
        self.push_measure(MeasureKind::Basis, vec![key], vec![target], dit, name);
        Ok(self)
    }

    /// Appends a destructive joint measurement of `targets` in the
    /// orthonormal basis given by the columns of `v`; the recorded outcome
    /// indexes those columns.
    ///
    /// # Errors
    /// `EmptyTargetSet`, `InvalidIndex`, `AlreadyMeasured`,
    /// `DuplicateIndex`, `ShapeMismatch`, or `IntegrityViolation`.
    pub fn measure_joint(
        &mut self,
        v: &CMat,
        targets: &[usize],
        dit: usize,
        name: Option<&str>,
    ) -> Result<&mut Self> {
        self.check_nonempty("target", targets)?;
        for &t in targets {
            self.check_qudit_bound("target", t)?;
            self.check_unmeasured(t)?;
        }
        self.check_no_dups("target", targets)?;
        self.check_dit_bound("dit", dit)?;
        self.check_operand(v, targets.len())?;
        let name = self.gate_name(name, v);
        let key = self.intern(ops::hash_matrix(v), v)?;
        self.push_measure(MeasureKind::BasisJoint, vec![key], targets.to_vec(), dit, name);
        Ok(self)
    }

    /// Structured description of the circuit: shape, steps, counters, and
    /// measurement markers.
    pub fn report(&self) -> CircuitReport {
        let steps = self
            .steps()
            .map(|step| match step.view() {
                StepView::Gate(g) => StepReport {
                    position: step.position(),
                    kind: "gate".to_owned(),
                    variant: g.kind.to_string(),
                    name: g.name.clone(),
                    controls: g.controls.clone(),
                    targets: g.targets.clone(),
                    dit: None,
                },
                StepView::Measure(m) => StepReport {
                    position: step.position(),
                    kind: "measurement".to_owned(),
                    variant: m.kind.to_string(),
                    name: m.name.clone(),
                    controls: Vec::new(),
                    targets: m.targets.clone(),
                    dit: Some(m.dit),
                },
            })
            .collect();
        CircuitReport {
            num_qudits: self.num_qudits,
            num_dits: self.num_dits,
            dim: self.dim,
            name: self.name.clone(),
            steps,
            gate_count: self.gate_count(),
            measurement_count: self.measurement_count(),
            measured: self.measured_qudits(),
            unmeasured: self.unmeasured_qudits(),
        }
    }
}

fn check_shape(num_qudits: usize, dim: usize) -> Result<()> {
    if num_qudits == 0 {
        return Err(Error::InvalidShape { what: "qudit count", found: num_qudits, min: 1 });
    }
    if dim < 2 {
        return Err(Error::InvalidShape { what: "dimension", found: dim, min: 2 });
    }
    Ok(())
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit")?;
        if let Some(name) = &self.name {
            write!(f, " \"{}\"", name)?;
        }
        write!(f, ": {} qudits, {} dits, dim {}", self.num_qudits, self.num_dits, self.dim)?;
        for step in self.steps() {
            write!(f, "\n  {}", step)?;
        }
        Ok(())
    }
}

/// The typed record behind a [`Step`].
#[derive(Clone, Copy, Debug)]
pub enum StepView<'a> {
    /// A gate instruction.
    Gate(&'a GateStep),
    /// A measurement instruction.
    Measure(&'a MeasureStep),
}

/// Read-only view of one step of the interleaved stream.
#[derive(Clone, Copy, Debug)]
pub struct Step<'a> {
    circuit: &'a Circuit,
    position: usize,
    view: StepView<'a>,
}

impl<'a> Step<'a> {
    /// Circuit this step belongs to.
    pub fn circuit(&self) -> &'a Circuit { self.circuit }

    /// Position in the execution order.
    pub fn position(&self) -> usize { self.position }

    /// Which typed sequence the record lives in.
    pub fn kind(&self) -> StepKind {
        match self.view {
            StepView::Gate(_) => StepKind::Gate,
            StepView::Measure(_) => StepKind::Measurement,
        }
    }

    /// The resolved record.
    pub fn view(&self) -> StepView<'a> { self.view }
}

impl fmt::Display for Step<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.view {
            StepView::Gate(g) => {
                write!(f, "{}: gate {} \"{}\"", self.position, g.kind, g.name)?;
                if !g.controls.is_empty() {
                    let label = if g.kind.is_classical() { "dits" } else { "ctrl" };
                    write!(f, " {} {:?}", label, g.controls)?;
                }
                write!(f, " targets {:?}", g.targets)
            }
            StepView::Measure(m) => write!(
                f,
                "{}: measure {} \"{}\" targets {:?} -> dit {}",
                self.position, m.kind, m.name, m.targets, m.dit
            ),
        }
    }
}

/// Forward, bounds-checked cursor over a circuit's interleaved steps.
///
/// [`Steps::advance`] and [`Steps::current`] report exhaustion as
/// [`Error::InvalidCursor`]; the [`Iterator`] impl maps the same condition
/// to `None`. Equality compares the resolution state (current kind,
/// position, and per-sequence cursors), not the identity of the underlying
/// circuit.
#[derive(Clone, Debug)]
pub struct Steps<'a> {
    circuit: &'a Circuit,
    position: usize,
    kind: Option<StepKind>,
    gate_cursor: usize,
    measure_cursor: usize,
}

impl<'a> Steps<'a> {
    fn new(circuit: &'a Circuit) -> Self {
        Self {
            circuit,
            position: 0,
            kind: circuit.step_kinds.first().copied(),
            gate_cursor: 0,
            measure_cursor: 0,
        }
    }

    /// Position of the cursor in the execution order.
    pub fn position(&self) -> usize { self.position }

    /// Moves to the next step.
    ///
    /// # Errors
    /// `InvalidCursor` when already past the last step.
    pub fn advance(&mut self) -> Result<()> {
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                return Err(Error::InvalidCursor {
                    position: self.position,
                    len: self.circuit.step_count(),
                });
            }
        };
        match kind {
            StepKind::Gate => { self.gate_cursor += 1; }
            StepKind::Measurement => { self.measure_cursor += 1; }
        }
        self.position += 1;
        self.kind = self.circuit.step_kinds.get(self.position).copied();
        Ok(())
    }

    /// Resolves the current step.
    ///
    /// # Errors
    /// `InvalidCursor` past the last step, including on an empty circuit.
    pub fn current(&self) -> Result<Step<'a>> {
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                return Err(Error::InvalidCursor {
                    position: self.position,
                    len: self.circuit.step_count(),
                });
            }
        };
        let view = match kind {
            StepKind::Gate => StepView::Gate(&self.circuit.gates[self.gate_cursor]),
            StepKind::Measurement => StepView::Measure(&self.circuit.measures[self.measure_cursor]),
        };
        Ok(Step { circuit: self.circuit, position: self.position, view })
    }
}

impl PartialEq for Steps<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.position == other.position
            && self.gate_cursor == other.gate_cursor
            && self.measure_cursor == other.measure_cursor
    }
}

impl Eq for Steps<'_> {}

impl<'a> Iterator for Steps<'a> {
    type Item = Step<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = self.current().ok()?;
        let _ = self.advance();
        Some(step)
    }
}

impl<'a> IntoIterator for &'a Circuit {
    type Item = Step<'a>;
    type IntoIter = Steps<'a>;

    fn into_iter(self) -> Steps<'a> {
        self.steps()
    }
}

/// Serializable description of one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Position in execution order.
    pub position: usize,
    /// `"gate"` or `"measurement"`.
    pub kind: String,
    /// Classification token of the instruction.
    pub variant: String,
    pub name: String,
    /// Control qudits, or control registers for the classical kinds.
    pub controls: Vec<usize>,
    pub targets: Vec<usize>,
    /// Destination register; measurements only.
    pub dit: Option<usize>,
}

/// Serializable description of a whole circuit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitReport {
    pub num_qudits: usize,
    pub num_dits: usize,
    pub dim: usize,
    pub name: Option<String>,
    pub steps: Vec<StepReport>,
    pub gate_count: usize,
    pub measurement_count: usize,
    /// Qudits marked measured at build time, ascending.
    pub measured: Vec<usize>,
    pub unmeasured: Vec<usize>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gates::{self, GateLibrary};

    fn circ2() -> Circuit {
        match Circuit::new(2, 2, 2, None) {
            Ok(c) => c,
            Err(e) => panic!("{}", e),
        }
    }

    fn circ(nq: usize, nc: usize, d: usize) -> Circuit {
        match Circuit::new(nq, nc, d, None) {
            Ok(c) => c,
            Err(e) => panic!("{}", e),
        }
    }

    #[test]
    fn rejects_degenerate_shapes() {
        assert!(matches!(
            Circuit::new(0, 0, 2, None),
            Err(Error::InvalidShape { what: "qudit count", .. })
        ));
        assert!(matches!(
            Circuit::new(1, 0, 1, None),
            Err(Error::InvalidShape { what: "dimension", .. })
        ));
        assert!(matches!(
            Circuit::new(1, 0, 0, None),
            Err(Error::InvalidShape { .. })
        ));
    }

    #[test]
    fn builders_chain_and_count() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None)
            .and_then(|c| c.ctrl(&gates::PAULI_X, 0, 1, None))
            .and_then(|c| c.measure(0, 0, None))
            .map(|_| ())
            .unwrap();
        assert_eq!(c.step_count(), 3);
        assert_eq!(c.gate_count(), 2);
        assert_eq!(c.measurement_count(), 1);
        assert_eq!(
            c.step_kinds(),
            &[StepKind::Gate, StepKind::Gate, StepKind::Measurement]
        );
        assert_eq!(c.gate_steps().len(), 2);
        assert_eq!(c.measure_steps().len(), 1);
    }

    #[test]
    fn default_names_come_from_library() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.ctrl(&gates::PAULI_X, 0, 1, None).unwrap();
        c.cctrl(&gates::PAULI_Z, 0, 1, None).unwrap();
        c.ctrl(&gates::rx(0.4), 0, 1, None).unwrap();
        c.gate(&gates::rx(0.4), 1, None).unwrap();
        let names: Vec<&str> = c.gate_steps().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["H", "CTRL-X", "cCTRL-Z", "CTRL", ""]);
        assert_eq!(c.gate_count_of("H"), 1);
        assert_eq!(c.gate_count_of("CTRL-X"), 1);
        assert_eq!(c.gate_count_of(""), 1);
    }

    #[test]
    fn explicit_names_override_library() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, Some("had")).unwrap();
        c.measure(0, 0, Some("read")).unwrap();
        assert_eq!(c.gate_steps()[0].name, "had");
        assert_eq!(c.measure_steps()[0].name, "read");
        assert_eq!(c.gate_count_of("H"), 0);
        assert_eq!(c.measurement_count_of("read"), 1);
    }

    #[test]
    fn measure_defaults_to_z() {
        let mut c = circ2();
        c.measure(1, 0, None).unwrap();
        assert_eq!(c.measure_steps()[0].name, "Z");
        assert_eq!(c.measurement_count_of("Z"), 1);
    }

    #[test]
    fn fan_counts_once_per_target() {
        let mut c = circ(3, 0, 2);
        c.gate_fan(&gates::PAULI_X, &[0, 1, 2], None).unwrap();
        assert_eq!(c.step_count(), 1);
        assert_eq!(c.gate_steps().len(), 1);
        assert_eq!(c.gate_count(), 3);
        assert_eq!(c.gate_count_of("X"), 3);
    }

    #[test]
    fn fan_all_skips_measured_qudits() {
        let mut c = circ(3, 1, 2);
        c.measure(1, 0, None).unwrap();
        c.gate_fan_all(&gates::PAULI_X, None).unwrap();
        assert_eq!(c.gate_steps()[0].targets, vec![0, 2]);
        assert_eq!(c.gate_count_of("X"), 2);
    }

    #[test]
    fn fan_all_with_everything_measured_is_empty() {
        let mut c = circ(1, 1, 2);
        c.measure(0, 0, None).unwrap();
        assert!(matches!(
            c.gate_fan_all(&gates::PAULI_X, None),
            Err(Error::EmptyTargetSet { role: "target", .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let mut c = circ2();
        let err = c.gate(&gates::PAULI_X, 5, None).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidIndex { step: 0, role: "target", index: 5, bound: 2 }
        );
        assert_eq!(c.step_count(), 0);

        c.gate(&gates::PAULI_X, 0, None).unwrap();
        let err = c.ctrl(&gates::PAULI_X, 9, 1, None).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidIndex { step: 1, role: "control", index: 9, bound: 2 }
        );
        assert!(matches!(
            c.measure(0, 7, None),
            Err(Error::InvalidIndex { role: "dit", index: 7, bound: 2, .. })
        ));
        assert!(matches!(
            c.cctrl(&gates::PAULI_X, 3, 0, None),
            Err(Error::InvalidIndex { role: "dit", .. })
        ));
    }

    #[test]
    fn rejects_duplicate_indices() {
        let mut c = circ(3, 0, 2);
        assert!(matches!(
            c.gate2(&gates::CNOT, 1, 1, None),
            Err(Error::DuplicateIndex { role: "target", index: 1, .. })
        ));
        assert!(matches!(
            c.gate_fan(&gates::PAULI_X, &[0, 2, 0], None),
            Err(Error::DuplicateIndex { role: "target", index: 0, .. })
        ));
        assert!(matches!(
            c.ctrl_multi(&gates::PAULI_X, &[0, 0], 1, None),
            Err(Error::DuplicateIndex { role: "control", .. })
        ));
        assert_eq!(c.step_count(), 0);
    }

    #[test]
    fn rejects_empty_sets() {
        let mut c = circ2();
        assert!(matches!(
            c.gate_fan(&gates::PAULI_X, &[], None),
            Err(Error::EmptyTargetSet { role: "target", .. })
        ));
        assert!(matches!(
            c.ctrl_multi(&gates::PAULI_X, &[], 0, None),
            Err(Error::EmptyTargetSet { role: "control", .. })
        ));
        assert!(matches!(
            c.measure_joint(&gates::CNOT, &[], 0, None),
            Err(Error::EmptyTargetSet { role: "target", .. })
        ));
    }

    #[test]
    fn rejects_control_target_overlap() {
        let mut c = circ(3, 0, 2);
        assert!(matches!(
            c.ctrl(&gates::PAULI_X, 1, 1, None),
            Err(Error::InvalidIndex { role: "control/target", index: 1, .. })
        ));
        assert!(matches!(
            c.ctrl_custom(&gates::CNOT, &[0], &[0, 1], None),
            Err(Error::InvalidIndex { role: "control/target", .. })
        ));
        assert_eq!(c.step_count(), 0);
    }

    #[test]
    fn measured_qudits_refuse_instructions() {
        let mut c = circ2();
        c.measure(0, 0, None).unwrap();
        assert!(c.is_measured(0));
        assert!(!c.is_measured(1));
        assert_eq!(c.measured_qudits(), vec![0]);
        assert_eq!(c.unmeasured_qudits(), vec![1]);
        assert!(matches!(
            c.gate(&gates::PAULI_X, 0, None),
            Err(Error::AlreadyMeasured { step: 1, qudit: 0 })
        ));
        assert!(matches!(
            c.ctrl(&gates::PAULI_X, 0, 1, None),
            Err(Error::AlreadyMeasured { qudit: 0, .. })
        ));
        assert!(matches!(
            c.measure(0, 1, None),
            Err(Error::AlreadyMeasured { qudit: 0, .. })
        ));
        assert_eq!(c.step_count(), 1);
    }

    #[test]
    fn rejects_operand_shape_mismatches() {
        let mut c = circ2();
        assert!(matches!(
            c.gate(&gates::CNOT, 0, None),
            Err(Error::ShapeMismatch { rows: 4, cols: 4, expected: 2, .. })
        ));
        assert!(matches!(
            c.gate_custom(&gates::PAULI_X, &[0, 1], None),
            Err(Error::ShapeMismatch { expected: 4, .. })
        ));
        let rect = CMat::zeros(2, 3);
        assert!(matches!(
            c.gate(&rect, 0, None),
            Err(Error::ShapeMismatch { rows: 2, cols: 3, .. })
        ));
        let mut c3 = circ(2, 1, 3);
        assert!(matches!(
            c3.measure_in(&gates::HADAMARD, 0, 0, None),
            Err(Error::ShapeMismatch { expected: 3, .. })
        ));
        assert_eq!(c.step_count(), 0);
    }

    #[test]
    fn operands_are_interned_once() {
        let mut c = circ(3, 0, 2);
        c.gate(&gates::PAULI_X, 0, None).unwrap();
        c.gate(&gates::PAULI_X, 1, None).unwrap();
        c.gate_fan(&gates::PAULI_X, &[0, 1, 2], None).unwrap();
        assert_eq!(c.operand_count(), 1);
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        assert_eq!(c.operand_count(), 2);
        let key = c.gate_steps()[0].operand;
        assert!(c.operand(key).is_some());
        assert!(c.operand(OperandKey(key.0 ^ 1)).is_none());
    }

    #[test]
    fn intern_is_idempotent_and_collision_fatal() {
        let mut c = circ2();
        let key = c.intern(42, &gates::PAULI_X).unwrap();
        assert_eq!(key, OperandKey(42));
        assert_eq!(c.intern(42, &gates::PAULI_X).unwrap(), OperandKey(42));
        assert_eq!(c.operand_count(), 1);
        assert!(matches!(
            c.intern(42, &gates::PAULI_Z),
            Err(Error::IntegrityViolation { key: 42, .. })
        ));
    }

    #[test]
    fn fourier_steps_are_reserved() {
        let mut c = circ2();
        assert!(matches!(
            c.fourier(&[0, 1]),
            Err(Error::UnsupportedOperation { .. })
        ));
        assert!(matches!(
            c.fourier_inv(&[0]),
            Err(Error::UnsupportedOperation { .. })
        ));
        assert_eq!(c.step_count(), 0);
    }

    #[test]
    fn gate_depth_is_not_provided() {
        let c = circ2();
        assert!(matches!(c.gate_depth(), Err(Error::UnsupportedOperation { .. })));
        assert!(matches!(c.gate_depth_of("X"), Err(Error::UnsupportedOperation { .. })));
    }

    #[test]
    fn qudit_dimension_drives_operand_checks() {
        let mut c = circ(2, 1, 3);
        let s = gates::shift(3);
        c.gate(&s, 0, None).unwrap();
        c.ctrl(&s, 0, 1, None).unwrap();
        assert_eq!(c.gate_steps()[0].name, "Xd");
        assert_eq!(c.gate_steps()[1].name, "CTRL-Xd");
        assert!(matches!(
            c.gate(&gates::PAULI_X, 0, None),
            Err(Error::ShapeMismatch { expected: 3, .. })
        ));
    }

    #[test]
    fn custom_library_controls_naming() {
        let mut lib = GateLibrary::empty();
        lib.register(&gates::PAULI_X, "flip");
        let mut c = Circuit::with_library(2, 0, 2, None, lib).unwrap();
        c.gate(&gates::PAULI_X, 0, None).unwrap();
        c.gate(&gates::HADAMARD, 1, None).unwrap();
        assert_eq!(c.gate_steps()[0].name, "flip");
        assert_eq!(c.gate_steps()[1].name, "");
    }

    #[test]
    fn cursor_walks_interleaved_stream() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.measure(0, 0, None).unwrap();
        c.gate(&gates::PAULI_X, 1, None).unwrap();

        let collected: Vec<Step<'_>> = c.steps().collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].kind(), StepKind::Gate);
        assert_eq!(collected[1].kind(), StepKind::Measurement);
        assert_eq!(collected[2].kind(), StepKind::Gate);
        assert_eq!(collected[2].position(), 2);
        match collected[2].view() {
            StepView::Gate(g) => assert_eq!(g.name, "X"),
            StepView::Measure(_) => panic!("expected a gate record"),
        }
    }

    #[test]
    fn cursor_bounds_are_checked() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        let mut steps = c.steps();
        assert!(steps.current().is_ok());
        steps.advance().unwrap();
        assert!(matches!(
            steps.current(),
            Err(Error::InvalidCursor { position: 1, len: 1 })
        ));
        assert!(matches!(
            steps.advance(),
            Err(Error::InvalidCursor { position: 1, len: 1 })
        ));

        let empty = circ2();
        assert!(matches!(empty.steps().current(), Err(Error::InvalidCursor { .. })));
        assert!(empty.steps().next().is_none());
    }

    #[test]
    fn cursor_equality_tracks_resolution_state() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.measure(0, 0, None).unwrap();

        let mut a = c.steps();
        let mut b = c.steps();
        assert_eq!(a, b);
        a.advance().unwrap();
        assert_ne!(a, b);
        b.advance().unwrap();
        assert_eq!(a, b);
        a.advance().unwrap();
        b.advance().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn circuit_is_into_iterator() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.gate(&gates::PAULI_X, 1, None).unwrap();
        let mut count = 0;
        for step in &c {
            assert_eq!(step.position(), count);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn steps_next_returns_none_when_exhausted() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        let mut steps = c.steps();
        assert!(steps.next().is_some());
        assert!(steps.next().is_none());
        assert!(steps.next().is_none());
    }

    #[test]
    fn measured_lists_stay_sorted() {
        let mut c = circ(3, 3, 2);
        c.measure(2, 0, None).unwrap();
        c.measure(0, 1, None).unwrap();
        assert_eq!(c.measured_qudits(), vec![0, 2]);
        assert_eq!(c.unmeasured_qudits(), vec![1]);
    }

    #[test]
    #[should_panic]
    fn is_measured_panics_out_of_range() {
        let c = circ2();
        c.is_measured(5);
    }

    #[test]
    fn report_round_trips_through_json() {
        let mut c = Circuit::new(2, 2, 2, Some("bell")).unwrap();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.ctrl(&gates::PAULI_X, 0, 1, None).unwrap();
        c.measure(0, 0, None).unwrap();
        c.measure(1, 1, None).unwrap();

        let report = c.report();
        assert_eq!(report.num_qudits, 2);
        assert_eq!(report.steps.len(), 4);
        assert_eq!(report.gate_count, 2);
        assert_eq!(report.measurement_count, 2);
        assert_eq!(report.measured, vec![0, 1]);
        assert_eq!(report.steps[1].variant, "ctrl");
        assert_eq!(report.steps[2].dit, Some(0));

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"num_qudits\":2"));
        assert!(json.contains("\"name\":\"bell\""));
        let back: CircuitReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn display_lists_steps() {
        let mut c = Circuit::new(2, 1, 2, Some("demo")).unwrap();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.measure(0, 0, None).unwrap();
        let text = format!("{}", c);
        assert!(text.contains("\"demo\""));
        assert!(text.contains("2 qudits"));
        assert!(text.contains("gate single \"H\""));
        assert!(text.contains("-> dit 0"));
    }

    #[test]
    fn failed_appends_leave_no_trace() {
        let mut c = circ2();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        let gates_before = c.gate_count();
        let operands_before = c.operand_count();
        let steps_before = c.step_count();

        let rect = CMat::zeros(2, 3);
        assert!(c.gate(&rect, 1, None).is_err());
        assert!(c.ctrl(&gates::PAULI_X, 0, 0, None).is_err());
        assert!(c.gate_fan(&gates::PAULI_X, &[1, 1], None).is_err());

        assert_eq!(c.gate_count(), gates_before);
        assert_eq!(c.operand_count(), operands_before);
        assert_eq!(c.step_count(), steps_before);
    }
}
