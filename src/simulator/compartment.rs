use serde::{Deserialize, Serialize};

use crate::data::Covariates;
use crate::model::compiled::CompiledModel;
use crate::model::expr::{BoundExpr, Env};
use crate::simulator::delay::{CompiledDelayKind, DelayKernel};

/// A compartment of the structural model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentDef {
    pub name: String,
    /// Initial amount, a formula over parameters and covariates. Zero when absent.
    pub initial: Option<String>,
}

impl CompartmentDef {
    pub fn new(name: impl Into<String>) -> Self {
        CompartmentDef {
            name: name.into(),
            initial: None,
        }
    }

    pub fn with_initial(mut self, initial: impl Into<String>) -> Self {
        self.initial = Some(initial.into());
        self
    }
}

/// Mass transfer between compartments. `to: None` leaves the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Flow {
    /// `rate * A_from`
    Linear {
        from: String,
        to: Option<String>,
        rate: String,
    },
    /// `clearance / volume * A_from`
    Clearance {
        from: String,
        to: Option<String>,
        clearance: String,
        volume: String,
    },
    /// `vmax * C / (km + C)` with `C = A_from / volume`
    MichaelisMenten {
        from: String,
        to: Option<String>,
        vmax: String,
        km: String,
        volume: String,
    },
    /// Free rate expression, removed from `from` and added to `to`
    Expression {
        from: Option<String>,
        to: Option<String>,
        rate: String,
    },
}

impl Flow {
    pub fn linear(from: &str, to: Option<&str>, rate: &str) -> Self {
        Flow::Linear {
            from: from.to_string(),
            to: to.map(str::to_string),
            rate: rate.to_string(),
        }
    }

    pub fn clearance(from: &str, to: Option<&str>, clearance: &str, volume: &str) -> Self {
        Flow::Clearance {
            from: from.to_string(),
            to: to.map(str::to_string),
            clearance: clearance.to_string(),
            volume: volume.to_string(),
        }
    }

    pub fn michaelis_menten(from: &str, to: Option<&str>, vmax: &str, km: &str, volume: &str) -> Self {
        Flow::MichaelisMenten {
            from: from.to_string(),
            to: to.map(str::to_string),
            vmax: vmax.to_string(),
            km: km.to_string(),
            volume: volume.to_string(),
        }
    }

    /// Zero-order production into `to`
    pub fn production(to: &str, rate: &str) -> Self {
        Flow::Expression {
            from: None,
            to: Some(to.to_string()),
            rate: rate.to_string(),
        }
    }

    /// Loss from `from` at an arbitrary rate
    pub fn loss(from: &str, rate: &str) -> Self {
        Flow::Expression {
            from: Some(from.to_string()),
            to: None,
            rate: rate.to_string(),
        }
    }

    pub(crate) fn endpoints(&self) -> (Option<&str>, Option<&str>) {
        match self {
            Flow::Linear { from, to, .. }
            | Flow::Clearance { from, to, .. }
            | Flow::MichaelisMenten { from, to, .. } => (Some(from.as_str()), to.as_deref()),
            Flow::Expression { from, to, .. } => (from.as_deref(), to.as_deref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FluxKind {
    Linear { rate: BoundExpr },
    Clearance { clearance: BoundExpr, volume: BoundExpr },
    MichaelisMenten {
        vmax: BoundExpr,
        km: BoundExpr,
        volume: BoundExpr,
    },
    Expression { rate: BoundExpr },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledFlow {
    pub from: Option<usize>,
    pub to: Option<usize>,
    pub kind: FluxKind,
}

impl CompiledFlow {
    #[inline]
    pub fn flux(&self, env: &Env) -> f64 {
        let amount = self.from.map_or(0.0, |i| env.states[i]);
        match &self.kind {
            FluxKind::Linear { rate } => rate.eval(env) * amount,
            FluxKind::Clearance { clearance, volume } => clearance.eval(env) / volume.eval(env) * amount,
            FluxKind::MichaelisMenten { vmax, km, volume } => {
                let c = amount / volume.eval(env);
                vmax.eval(env) * c / (km.eval(env) + c)
            }
            FluxKind::Expression { rate } => rate.eval(env),
        }
    }
}

/// Scratch buffers reused across right-hand side calls
#[derive(Debug, Clone, Default)]
pub(crate) struct Workspace {
    pub algebraic: Vec<f64>,
    pub delays: Vec<f64>,
    pub covariates: Vec<f64>,
}

impl Workspace {
    pub fn new(model: &CompiledModel, covariates: &[f64]) -> Self {
        Workspace {
            algebraic: vec![0.0; model.algebraic.len()],
            delays: vec![0.0; model.delays.len()],
            covariates: covariates.to_vec(),
        }
    }
}

/// The compartment, delay-chain and cumulative-hazard system of one
/// individual between two discontinuities.
pub(crate) struct OdeSystem<'a> {
    pub model: &'a CompiledModel,
    pub params: &'a [f64],
    pub kernels: &'a [DelayKernel],
    /// Zero-order input rate per state
    pub rates: &'a [f64],
    /// Source of time-varying covariates, when any dynamic formula reads one
    pub covariates: Option<&'a Covariates>,
}

impl OdeSystem<'_> {
    /// Evaluate delay outputs and algebraic variables at `(t, y)` into `work`
    pub fn auxiliaries(&self, t: f64, y: &[f64], work: &mut Workspace) {
        if let Some(covariates) = self.covariates {
            for (value, name) in work.covariates.iter_mut().zip(&self.model.covariate_names) {
                if let Some(v) = covariates.value(name, t) {
                    *value = v;
                }
            }
        }
        for (i, (delay, kernel)) in self.model.delays.iter().zip(self.kernels).enumerate() {
            let stages = &y[delay.offset..delay.offset + delay.stages];
            work.delays[i] = match delay.kind {
                CompiledDelayKind::Signal { .. } => kernel.output(stages),
                CompiledDelayKind::Dose { .. } => kernel.released(stages),
            };
        }
        for i in 0..self.model.algebraic.len() {
            let value = {
                let env = self.env(t, y, work);
                self.model.algebraic[i].1.eval(&env)
            };
            work.algebraic[i] = value;
        }
    }

    pub fn env<'b>(&'b self, t: f64, y: &'b [f64], work: &'b Workspace) -> Env<'b> {
        Env {
            time: t,
            states: y,
            params: self.params,
            algebraic: &work.algebraic,
            delays: &work.delays,
            covariates: &work.covariates,
            ..Env::default()
        }
    }

    pub fn rhs(&self, t: f64, y: &[f64], dy: &mut [f64], work: &mut Workspace) {
        self.auxiliaries(t, y, work);
        let env = self.env(t, y, work);
        let model = self.model;

        dy.copy_from_slice(self.rates);
        for flow in &model.flows {
            let flux = flow.flux(&env);
            if let Some(from) = flow.from {
                dy[from] -= flux;
            }
            if let Some(to) = flow.to {
                dy[to] += flux;
            }
        }

        for (delay, kernel) in model.delays.iter().zip(self.kernels) {
            let range = delay.offset..delay.offset + delay.stages;
            let inflow_first_stage = dy[delay.offset];
            match &delay.kind {
                CompiledDelayKind::Signal { signal, .. } => {
                    let input = signal.eval(&env);
                    kernel.signal_rhs(input, &y[range.clone()], &mut dy[range]);
                }
                CompiledDelayKind::Dose { target } => {
                    let released = kernel.dose_rhs(&y[range.clone()], &mut dy[range]);
                    dy[*target] += released;
                }
            }
            dy[delay.offset] += inflow_first_stage;
        }

        for (state, hazard) in &model.hazards {
            dy[*state] = hazard.eval(&env).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::expr::Slot;

    #[test]
    fn flux_kinds() {
        let states = [10.0, 0.0];
        let params = [0.5, 2.0, 4.0];
        let env = Env {
            states: &states,
            params: &params,
            ..Env::default()
        };
        let p = |i| BoundExpr::Slot(Slot::Param(i));
        let linear = CompiledFlow {
            from: Some(0),
            to: Some(1),
            kind: FluxKind::Linear { rate: p(0) },
        };
        assert_eq!(linear.flux(&env), 5.0);
        let clearance = CompiledFlow {
            from: Some(0),
            to: None,
            kind: FluxKind::Clearance {
                clearance: p(1),
                volume: p(2),
            },
        };
        assert_eq!(clearance.flux(&env), 5.0);
        let saturable = CompiledFlow {
            from: Some(0),
            to: None,
            kind: FluxKind::MichaelisMenten {
                vmax: p(2),
                km: p(0),
                volume: p(1),
            },
        };
        // C = 5, 4 * 5 / 5.5
        assert!((saturable.flux(&env) - 4.0 * 5.0 / 5.5).abs() < 1e-12);
    }

    #[test]
    fn flow_endpoints() {
        assert_eq!(Flow::production("E", "kin").endpoints(), (None, Some("E")));
        assert_eq!(
            Flow::linear("depot", Some("central"), "ka").endpoints(),
            (Some("depot"), Some("central"))
        );
    }
}
