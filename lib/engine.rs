//! Step-by-step interpreter for circuits.
//!
//! An [`Engine`] borrows a finished [`Circuit`] and replays its steps
//! against a dense state vector, starting from the all-zero basis state.
//! Destructive measurements shrink the state: the measured qudit leaves
//! the register and every live qudit after it shifts down one physical
//! slot. The engine keeps the logical-to-physical map so later steps can
//! keep using build-time indices.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ptr;
use tracing::{debug, trace};

use crate::circuit::{Circuit, GateKind, GateStep, MeasureKind, MeasureStep, OperandKey, Step, StepView};
use crate::error::{Error, Result};
use crate::ops::{self, CMat, CVec};

/// Interpreter state bound to one circuit.
#[derive(Clone, Debug)]
pub struct Engine<'a> {
    circuit: &'a Circuit,
    psi: CVec,
    dits: Vec<usize>,
    probs: Vec<f64>,
    positions: Vec<Option<usize>>,
    rng: StdRng,
}

impl<'a> Engine<'a> {
    /// Binds an engine to `circuit`, preparing the all-zero basis state,
    /// zeroed classical registers, and the identity position map.
    ///
    /// `seed` fixes the sampling sequence; `None` draws from entropy.
    pub fn new(circuit: &'a Circuit, seed: Option<u64>) -> Self {
        let rng = seed.map(StdRng::seed_from_u64).unwrap_or_else(StdRng::from_entropy);
        Self {
            circuit,
            psi: ops::zero_state(circuit.num_qudits(), circuit.dim()),
            dits: vec![0; circuit.num_dits()],
            probs: vec![0.0; circuit.num_dits()],
            positions: (0..circuit.num_qudits()).map(Some).collect(),
            rng,
        }
    }

    /// Circuit the engine is bound to.
    pub fn circuit(&self) -> &'a Circuit { self.circuit }

    /// Live state vector; its length is `dim^k` for `k` live qudits.
    pub fn psi(&self) -> &CVec { &self.psi }

    /// Classical register values.
    pub fn dits(&self) -> &[usize] { &self.dits }

    /// Probability recorded with the last write to each register.
    pub fn probs(&self) -> &[f64] { &self.probs }

    /// Overwrites classical register `dit`.
    ///
    /// Values are not range-limited; joint measurement outcomes exceed the
    /// qudit dimension.
    ///
    /// # Panics
    /// When `dit` is not below the register count.
    pub fn set_dit(&mut self, dit: usize, value: usize) -> &mut Self {
        assert!(dit < self.dits.len());
        self.dits[dit] = value;
        self
    }

    /// True when `qudit` has been consumed by an executed measurement.
    ///
    /// # Panics
    /// When `qudit` is not below the qudit count.
    pub fn is_measured(&self, qudit: usize) -> bool {
        self.positions[qudit].is_none()
    }

    /// Physical slot of `qudit` in the live state, `None` once measured.
    ///
    /// # Panics
    /// When `qudit` is not below the qudit count.
    pub fn position_of(&self, qudit: usize) -> Option<usize> {
        self.positions[qudit]
    }

    /// Qudits consumed so far, ascending.
    pub fn measured_qudits(&self) -> Vec<usize> {
        (0..self.positions.len()).filter(|&q| self.positions[q].is_none()).collect()
    }

    /// Qudits still live, ascending.
    pub fn unmeasured_qudits(&self) -> Vec<usize> {
        (0..self.positions.len()).filter(|&q| self.positions[q].is_some()).collect()
    }

    pub(crate) fn state_and_rng(&mut self) -> (&CVec, &mut StdRng) {
        (&self.psi, &mut self.rng)
    }

    pub(crate) fn set_state(&mut self, psi: CVec) {
        self.psi = psi;
    }

    /// Applies one step to the live state.
    ///
    /// # Errors
    /// `BoundMismatch` for a step of a foreign circuit, `AlreadyMeasured`
    /// when an index resolves to a consumed qudit, `UnsupportedOperation`
    /// for the reserved Fourier kinds, `IntegrityViolation` when a recorded
    /// operand key is missing. A failed call leaves the engine unchanged.
    pub fn execute(&mut self, step: &Step<'_>) -> Result<()> {
        if !ptr::eq(step.circuit(), self.circuit) {
            return Err(Error::BoundMismatch);
        }
        match step.view() {
            StepView::Gate(g) => self.execute_gate(g, step.position()),
            StepView::Measure(m) => self.execute_measure(m, step.position()),
        }
    }

    /// Executes every step from the first.
    ///
    /// The engine is not reset first; pair with [`Engine::reset`] to replay.
    ///
    /// # Errors
    /// The first error any step reports.
    pub fn run(&mut self) -> Result<()> {
        debug!(steps = self.circuit.step_count(), "run");
        let circuit = self.circuit;
        for step in circuit.steps() {
            self.execute(&step)?;
        }
        Ok(())
    }

    /// Restores the initial state: all-zero state vector, zeroed registers
    /// and probabilities, identity position map. The sampling sequence is
    /// not rewound.
    pub fn reset(&mut self) -> &mut Self {
        self.psi = ops::zero_state(self.circuit.num_qudits(), self.circuit.dim());
        self.dits.fill(0);
        self.probs.fill(0.0);
        self.positions = (0..self.circuit.num_qudits()).map(Some).collect();
        self
    }

    /// Snapshot of the classical side: consumed qudits, register values,
    /// recorded probabilities.
    pub fn report(&self) -> EngineReport {
        EngineReport {
            measured: self.measured_qudits(),
            dits: self.dits.clone(),
            probs: self.probs.clone(),
        }
    }

    /// Maps build-time qudit indices to physical slots in the live state.
    fn resolve(&self, logical: &[usize], step: usize) -> Result<Vec<usize>> {
        logical
            .iter()
            .map(|&q| self.positions[q].ok_or(Error::AlreadyMeasured { step, qudit: q }))
            .collect()
    }

    /// Marks `qudit` consumed and shifts the later live slots down.
    fn retire(&mut self, qudit: usize, step: usize) -> Result<()> {
        if self.positions[qudit].is_none() {
            return Err(Error::AlreadyMeasured { step, qudit });
        }
        self.positions[qudit] = None;
        for slot in self.positions[qudit + 1..].iter_mut() {
            if let Some(p) = slot {
                *p -= 1;
            }
        }
        Ok(())
    }

    fn lookup_operand(&self, key: OperandKey, step: usize) -> Result<&'a CMat> {
        self.circuit.operand(key).ok_or(Error::IntegrityViolation { step, key: key.0 })
    }

    /// Fans a single-qudit operand over several targets; joint operands are
    /// applied as given.
    fn apply_fanned(&mut self, u: &CMat, targets: &[usize], dim: usize) {
        if u.nrows() == dim && targets.len() > 1 {
            for &t in targets {
                self.psi = ops::apply(&self.psi, u, &[t], dim);
            }
        } else {
            self.psi = ops::apply(&self.psi, u, targets, dim);
        }
    }

    fn execute_gate(&mut self, g: &GateStep, step: usize) -> Result<()> {
        trace!(step, kind = %g.kind, name = %g.name, "gate");
        let dim = self.circuit.dim();
        match g.kind {
            GateKind::Nop => Ok(()),
            GateKind::Single | GateKind::Two | GateKind::Three | GateKind::Custom => {
                let targets = self.resolve(&g.targets, step)?;
                let u = self.lookup_operand(g.operand, step)?;
                self.psi = ops::apply(&self.psi, u, &targets, dim);
                Ok(())
            }
            GateKind::Fan => {
                let targets = self.resolve(&g.targets, step)?;
                let u = self.lookup_operand(g.operand, step)?;
                for &t in targets.iter() {
                    self.psi = ops::apply(&self.psi, u, &[t], dim);
                }
                Ok(())
            }
            GateKind::Fourier | GateKind::FourierInv => {
                Err(Error::UnsupportedOperation { what: "fourier transform step" })
            }
            GateKind::Ctrl
            | GateKind::CtrlFan
            | GateKind::MultiCtrl
            | GateKind::MultiCtrlFan
            | GateKind::CtrlCustom => {
                let ctrls = self.resolve(&g.controls, step)?;
                let targets = self.resolve(&g.targets, step)?;
                let u = self.lookup_operand(g.operand, step)?;
                self.psi = ops::apply_ctrl(&self.psi, u, &ctrls, &targets, dim);
                Ok(())
            }
            GateKind::CCtrl
            | GateKind::CCtrlFan
            | GateKind::MultiCCtrl
            | GateKind::MultiCCtrlFan
            | GateKind::CCtrlCustom => {
                let targets = self.resolve(&g.targets, step)?;
                let u = self.lookup_operand(g.operand, step)?;
                if self.dits.is_empty() {
                    // no registers to condition on
                    self.apply_fanned(u, &targets, dim);
                    return Ok(());
                }
                let first = self.dits[g.controls[0]];
                if g.controls.iter().all(|&c| self.dits[c] == first) {
                    let powered = ops::powm(u, first);
                    self.apply_fanned(&powered, &targets, dim);
                }
                Ok(())
            }
        }
    }

    fn execute_measure(&mut self, m: &MeasureStep, step: usize) -> Result<()> {
        trace!(step, kind = %m.kind, name = %m.name, "measurement");
        let dim = self.circuit.dim();
        let targets = self.resolve(&m.targets, step)?;
        match m.kind {
            MeasureKind::Computational => {
                let (outcome, p, collapsed) =
                    ops::measure_seq(&self.psi, targets[0], dim, &mut self.rng);
                self.psi = collapsed;
                self.dits[m.dit] = outcome;
                self.probs[m.dit] = p;
                self.retire(m.targets[0], step)
            }
            MeasureKind::Basis | MeasureKind::BasisJoint => {
                let v = self.lookup_operand(m.operands[0], step)?;
                let (outcome, probs, mut branches) =
                    ops::measure_basis(&self.psi, v, &targets, dim, &mut self.rng);
                self.psi = branches.swap_remove(outcome);
                self.dits[m.dit] = outcome;
                self.probs[m.dit] = probs[outcome];
                for &t in m.targets.iter() {
                    self.retire(t, step)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Engine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "engine: measured {:?}, dits {:?}, probs {:?}",
            self.measured_qudits(),
            self.dits,
            self.probs
        )
    }
}

/// Serializable snapshot of an engine's classical side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineReport {
    /// Consumed qudits, ascending.
    pub measured: Vec<usize>,
    /// Classical register values.
    pub dits: Vec<usize>,
    /// Probability recorded with each register's last write.
    pub probs: Vec<f64>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gates;
    use num_complex::Complex64 as C64;

    fn bell() -> Circuit {
        let mut c = Circuit::new(2, 2, 2, Some("bell")).unwrap();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.ctrl(&gates::PAULI_X, 0, 1, None).unwrap();
        c.measure(0, 0, None).unwrap();
        c.measure(1, 1, None).unwrap();
        c
    }

    #[test]
    fn fresh_engine_is_grounded() {
        let c = bell();
        let eng = Engine::new(&c, Some(1));
        assert_eq!(eng.psi().len(), 4);
        assert_eq!(eng.psi()[0], C64::from(1.0));
        assert_eq!(eng.dits(), &[0, 0]);
        assert_eq!(eng.probs(), &[0.0, 0.0]);
        assert_eq!(eng.position_of(0), Some(0));
        assert_eq!(eng.position_of(1), Some(1));
        assert!(eng.unmeasured_qudits() == vec![0, 1]);
    }

    #[test]
    fn bell_measurements_correlate() {
        let c = bell();
        for seed in 0..20 {
            let mut eng = Engine::new(&c, Some(seed));
            eng.run().unwrap();
            let dits = eng.dits();
            assert_eq!(dits[0], dits[1]);
            assert!(dits[0] < 2);
            assert!((eng.probs()[0] - 0.5).abs() < 1e-9);
            assert!((eng.probs()[1] - 1.0).abs() < 1e-9);
            assert_eq!(eng.psi().len(), 1);
            assert!((eng.psi()[0].norm() - 1.0).abs() < 1e-9);
            assert_eq!(eng.measured_qudits(), vec![0, 1]);
        }
    }

    #[test]
    fn stepwise_execution_matches_cursor() {
        let c = bell();
        let mut eng = Engine::new(&c, Some(3));
        let mut steps = c.steps();

        let step = steps.current().unwrap();
        eng.execute(&step).unwrap();
        let h = 0.5_f64.sqrt();
        assert!((eng.psi()[0].re - h).abs() < 1e-12);
        assert!((eng.psi()[2].re - h).abs() < 1e-12);

        steps.advance().unwrap();
        eng.execute(&steps.current().unwrap()).unwrap();
        assert!((eng.psi()[3].re - h).abs() < 1e-12);
        assert!(eng.psi()[2].norm() < 1e-12);
    }

    #[test]
    fn rejects_steps_from_other_circuits() {
        let c1 = bell();
        let c2 = bell();
        let mut eng = Engine::new(&c1, Some(0));
        let steps = c2.steps();
        let foreign = steps.current().unwrap();
        assert!(matches!(eng.execute(&foreign), Err(Error::BoundMismatch)));
        assert_eq!(eng.psi()[0], C64::from(1.0));

        let own = c1.steps().current().unwrap();
        eng.execute(&own).unwrap();
    }

    #[test]
    fn measurement_relabels_later_qudits() {
        let mut c = Circuit::new(3, 1, 2, None).unwrap();
        c.gate(&gates::PAULI_X, 1, None).unwrap();
        c.measure(0, 0, None).unwrap();
        c.gate(&gates::PAULI_X, 2, None).unwrap();

        let mut eng = Engine::new(&c, Some(7));
        eng.run().unwrap();
        assert_eq!(eng.dits()[0], 0);
        assert!((eng.probs()[0] - 1.0).abs() < 1e-12);
        assert!(eng.is_measured(0));
        assert_eq!(eng.position_of(1), Some(0));
        assert_eq!(eng.position_of(2), Some(1));
        // logical |1⟩ and |2⟩ both flipped to one → |11⟩ over two qudits
        assert_eq!(eng.psi().len(), 4);
        assert!((eng.psi()[3].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn basis_measurement_is_deterministic_in_its_own_basis() {
        let mut c = Circuit::new(1, 1, 2, None).unwrap();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.measure_in(&gates::HADAMARD, 0, 0, None).unwrap();

        let mut eng = Engine::new(&c, Some(11));
        eng.run().unwrap();
        assert_eq!(eng.dits()[0], 0);
        assert!((eng.probs()[0] - 1.0).abs() < 1e-9);
        assert_eq!(eng.psi().len(), 1);
        assert!((eng.psi()[0].norm() - 1.0).abs() < 1e-9);
        assert!(eng.is_measured(0));
    }

    #[test]
    fn joint_measurement_identifies_bell_state() {
        let h = C64::from(0.5_f64.sqrt());
        let mut v = CMat::zeros(4, 4);
        // columns: Φ+, Ψ+, Φ-, Ψ-
        v[(0, 0)] = h;
        v[(3, 0)] = h;
        v[(1, 1)] = h;
        v[(2, 1)] = h;
        v[(0, 2)] = h;
        v[(3, 2)] = -h;
        v[(1, 3)] = h;
        v[(2, 3)] = -h;

        let mut c = Circuit::new(2, 1, 2, None).unwrap();
        c.gate(&gates::HADAMARD, 0, None).unwrap();
        c.ctrl(&gates::PAULI_X, 0, 1, None).unwrap();
        c.measure_joint(&v, &[0, 1], 0, Some("bell-basis")).unwrap();

        let mut eng = Engine::new(&c, Some(5));
        eng.run().unwrap();
        assert_eq!(eng.dits()[0], 0);
        assert!((eng.probs()[0] - 1.0).abs() < 1e-9);
        assert_eq!(eng.psi().len(), 1);
        assert_eq!(eng.measured_qudits(), vec![0, 1]);
    }

    #[test]
    fn classical_control_powers_the_operand() {
        let mut c = Circuit::new(1, 1, 3, None).unwrap();
        c.cctrl(&gates::shift(3), 0, 0, None).unwrap();

        let mut eng = Engine::new(&c, Some(0));
        eng.set_dit(0, 2);
        eng.run().unwrap();
        assert!((eng.psi()[2].re - 1.0).abs() < 1e-12);

        let mut eng = Engine::new(&c, Some(0));
        eng.set_dit(0, 1);
        eng.run().unwrap();
        assert!((eng.psi()[1].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn classical_control_with_value_zero_applies_identity() {
        let mut c = Circuit::new(1, 1, 2, None).unwrap();
        c.cctrl(&gates::PAULI_X, 0, 0, None).unwrap();
        let mut eng = Engine::new(&c, Some(0));
        eng.run().unwrap();
        assert_eq!(eng.psi()[0], C64::from(1.0));
    }

    #[test]
    fn classical_control_skips_on_disagreement() {
        let mut c = Circuit::new(1, 2, 2, None).unwrap();
        c.cctrl_multi(&gates::PAULI_X, &[0, 1], 0, None).unwrap();

        let mut eng = Engine::new(&c, Some(0));
        eng.set_dit(0, 0).set_dit(1, 1);
        eng.run().unwrap();
        assert_eq!(eng.psi()[0], C64::from(1.0));

        let mut eng = Engine::new(&c, Some(0));
        eng.set_dit(0, 1).set_dit(1, 1);
        eng.run().unwrap();
        assert!((eng.psi()[1].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn classical_control_fans_over_targets() {
        let mut c = Circuit::new(2, 1, 2, None).unwrap();
        c.cctrl_fan(&gates::PAULI_X, 0, &[0, 1], None).unwrap();
        let mut eng = Engine::new(&c, Some(0));
        eng.set_dit(0, 1);
        eng.run().unwrap();
        assert!((eng.psi()[3].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn quantum_control_variants_dispatch() {
        // TOF via two controls
        let mut c = Circuit::new(3, 0, 2, None).unwrap();
        c.gate_fan(&gates::PAULI_X, &[0, 1], None).unwrap();
        c.ctrl_multi(&gates::PAULI_X, &[0, 1], 2, None).unwrap();
        let mut eng = Engine::new(&c, Some(0));
        eng.run().unwrap();
        assert!((eng.psi()[7].re - 1.0).abs() < 1e-12);

        // joint controlled operand
        let mut c = Circuit::new(3, 0, 2, None).unwrap();
        c.gate(&gates::PAULI_X, 0, None).unwrap();
        c.ctrl_custom(&gates::SWAP, &[0], &[1, 2], None).unwrap();
        let mut eng = Engine::new(&c, Some(0));
        eng.run().unwrap();
        // swap of |00⟩ is |00⟩, control remains set
        assert!((eng.psi()[4].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn reset_restores_the_initial_configuration() {
        let c = bell();
        let mut eng = Engine::new(&c, Some(13));
        eng.run().unwrap();
        assert_eq!(eng.psi().len(), 1);

        eng.reset();
        assert_eq!(eng.psi(), &ops::zero_state(2, 2));
        assert_eq!(eng.dits(), &[0, 0]);
        assert_eq!(eng.probs(), &[0.0, 0.0]);
        assert_eq!(eng.position_of(0), Some(0));
        assert_eq!(eng.position_of(1), Some(1));

        eng.run().unwrap();
        assert_eq!(eng.dits()[0], eng.dits()[1]);
    }

    #[test]
    fn seeded_runs_reproduce() {
        let c = bell();
        let mut a = Engine::new(&c, Some(99));
        let mut b = Engine::new(&c, Some(99));
        a.run().unwrap();
        b.run().unwrap();
        assert_eq!(a.dits(), b.dits());
        assert_eq!(a.report(), b.report());
    }

    #[test]
    fn report_serializes() {
        let c = bell();
        let mut eng = Engine::new(&c, Some(2));
        eng.run().unwrap();
        let report = eng.report();
        assert_eq!(report.measured, vec![0, 1]);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"measured\":[0,1]"));
        let back: EngineReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    #[should_panic]
    fn set_dit_panics_out_of_range() {
        let c = bell();
        let mut eng = Engine::new(&c, Some(0));
        eng.set_dit(9, 1);
    }

    #[test]
    fn display_summarizes_classical_side() {
        let c = bell();
        let mut eng = Engine::new(&c, Some(4));
        eng.run().unwrap();
        let text = format!("{}", eng);
        assert!(text.contains("measured [0, 1]"));
    }
}
