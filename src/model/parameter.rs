//! Structural parameters and their resolution from fixed effects, random
//! effects and covariates.
//!
//! ```
//! use pkpdsim::model::parameter::{ParameterDef, ParameterStyle};
//!
//! // Cl = tvCl * (BW / 70)^dCldBW * exp(nCl)
//! let cl = ParameterDef::structured("Cl", ParameterStyle::LogNormal, "tvCl")
//!     .eta("nCl")
//!     .power_effect("BW", "dCldBW", Some(70.0));
//! assert_eq!(cl.name(), "Cl");
//! ```
use serde::{Deserialize, Serialize};

use crate::error::PkpdError;
use crate::model::expr::{ilogit, BoundExpr, Env};

/// Transformation applied to the linear predictor of a structured parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterStyle {
    /// `tv * exp(effects + eta + kappa)`
    LogNormal,
    /// `tv + effects + eta + kappa`
    Additive,
    /// `ilogit(tv + effects + eta + kappa)`
    LogitNormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectForm {
    /// `theta * ln(c / center)`, a factor `(c / center)^theta` on a log-normal parameter
    Power,
    /// `theta * (c - center)`
    Linear,
}

/// Covariate effect on the linear predictor of a structured parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CovariateEffect {
    Continuous {
        covariate: String,
        /// Fixed effect holding the coefficient
        coefficient: String,
        center: Option<f64>,
        form: EffectForm,
    },
    /// Each non-reference level has its own fixed-effect offset
    Categorical {
        covariate: String,
        reference: f64,
        levels: Vec<(f64, String)>,
    },
}

impl CovariateEffect {
    pub fn covariate(&self) -> &str {
        match self {
            CovariateEffect::Continuous { covariate, .. }
            | CovariateEffect::Categorical { covariate, .. } => covariate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterForm {
    Structured {
        style: ParameterStyle,
        /// Fixed effect holding the typical value, on the logit scale for LogitNormal
        typical: String,
        eta: Option<String>,
        /// Inter-occasion random effect
        iov: Option<String>,
        effects: Vec<CovariateEffect>,
    },
    /// Free formula over fixed effects, random effects, covariates and
    /// previously declared parameters
    Formula(String),
}

/// Declaration of one structural parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    name: String,
    form: ParameterForm,
}

impl ParameterDef {
    pub fn structured(name: impl Into<String>, style: ParameterStyle, typical: impl Into<String>) -> Self {
        ParameterDef {
            name: name.into(),
            form: ParameterForm::Structured {
                style,
                typical: typical.into(),
                eta: None,
                iov: None,
                effects: Vec::new(),
            },
        }
    }

    pub fn log_normal(name: impl Into<String>, typical: impl Into<String>) -> Self {
        Self::structured(name, ParameterStyle::LogNormal, typical)
    }

    pub fn additive(name: impl Into<String>, typical: impl Into<String>) -> Self {
        Self::structured(name, ParameterStyle::Additive, typical)
    }

    pub fn logit_normal(name: impl Into<String>, typical: impl Into<String>) -> Self {
        Self::structured(name, ParameterStyle::LogitNormal, typical)
    }

    pub fn formula(name: impl Into<String>, formula: impl Into<String>) -> Self {
        ParameterDef {
            name: name.into(),
            form: ParameterForm::Formula(formula.into()),
        }
    }

    /// Attach a between-subject random effect. No effect on formula parameters.
    pub fn eta(mut self, eta: impl Into<String>) -> Self {
        if let ParameterForm::Structured { eta: slot, .. } = &mut self.form {
            *slot = Some(eta.into());
        }
        self
    }

    /// Attach an inter-occasion random effect
    pub fn iov(mut self, kappa: impl Into<String>) -> Self {
        if let ParameterForm::Structured { iov, .. } = &mut self.form {
            *iov = Some(kappa.into());
        }
        self
    }

    pub fn effect(mut self, effect: CovariateEffect) -> Self {
        if let ParameterForm::Structured { effects, .. } = &mut self.form {
            effects.push(effect);
        }
        self
    }

    pub fn power_effect(self, covariate: &str, coefficient: &str, center: Option<f64>) -> Self {
        self.effect(CovariateEffect::Continuous {
            covariate: covariate.to_string(),
            coefficient: coefficient.to_string(),
            center,
            form: EffectForm::Power,
        })
    }

    pub fn linear_effect(self, covariate: &str, coefficient: &str, center: Option<f64>) -> Self {
        self.effect(CovariateEffect::Continuous {
            covariate: covariate.to_string(),
            coefficient: coefficient.to_string(),
            center,
            form: EffectForm::Linear,
        })
    }

    /// `levels` pairs each non-reference covariate value with its fixed effect
    pub fn categorical_effect(self, covariate: &str, reference: f64, levels: &[(f64, &str)]) -> Self {
        self.effect(CovariateEffect::Categorical {
            covariate: covariate.to_string(),
            reference,
            levels: levels
                .iter()
                .map(|(level, theta)| (*level, theta.to_string()))
                .collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn form(&self) -> &ParameterForm {
        &self.form
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledEffect {
    Power {
        covariate: usize,
        theta: usize,
        center: f64,
    },
    Linear {
        covariate: usize,
        theta: usize,
        center: f64,
    },
    Categorical {
        covariate: usize,
        reference: f64,
        levels: Vec<(f64, usize)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledForm {
    Structured {
        style: ParameterStyle,
        typical: usize,
        eta: Option<usize>,
        iov: Option<usize>,
        effects: Vec<CompiledEffect>,
    },
    Formula(BoundExpr),
}

/// Index-resolved parameter declarations.
///
/// [ParameterResolver::resolve] is a pure function of its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterResolver {
    names: Vec<String>,
    forms: Vec<CompiledForm>,
    covariate_names: Vec<String>,
}

impl ParameterResolver {
    pub(crate) fn new(
        names: Vec<String>,
        forms: Vec<CompiledForm>,
        covariate_names: Vec<String>,
    ) -> Self {
        ParameterResolver {
            names,
            forms,
            covariate_names,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Compute all structural parameters in declaration order.
    ///
    /// * `theta` - fixed effects
    /// * `eta` - between-subject random effects
    /// * `kappa` - inter-occasion random effects of the current occasion
    /// * `covariates` - covariate values, in model declaration order
    pub fn resolve(
        &self,
        theta: &[f64],
        eta: &[f64],
        kappa: &[f64],
        covariates: &[f64],
    ) -> Result<Vec<f64>, PkpdError> {
        let mut params = Vec::with_capacity(self.forms.len());
        for (name, form) in self.names.iter().zip(&self.forms) {
            let value = match form {
                CompiledForm::Structured {
                    style,
                    typical,
                    eta: eta_index,
                    iov,
                    effects,
                } => {
                    let mut shift = 0.0;
                    for effect in effects {
                        shift += self.effect_contribution(name, effect, theta, covariates)?;
                    }
                    if let Some(i) = eta_index {
                        shift += eta.get(*i).copied().unwrap_or(0.0);
                    }
                    if let Some(i) = iov {
                        shift += kappa.get(*i).copied().unwrap_or(0.0);
                    }
                    let tv = theta[*typical];
                    match style {
                        ParameterStyle::LogNormal => tv * shift.exp(),
                        ParameterStyle::Additive => tv + shift,
                        ParameterStyle::LogitNormal => ilogit(tv + shift),
                    }
                }
                CompiledForm::Formula(expr) => {
                    let env = Env {
                        params: &params,
                        covariates,
                        theta,
                        eta,
                        kappa,
                        ..Env::default()
                    };
                    expr.eval(&env)
                }
            };
            params.push(value);
        }
        Ok(params)
    }

    fn effect_contribution(
        &self,
        parameter: &str,
        effect: &CompiledEffect,
        theta: &[f64],
        covariates: &[f64],
    ) -> Result<f64, PkpdError> {
        let value = |index: usize| -> Result<f64, PkpdError> {
            match covariates.get(index) {
                Some(v) if v.is_finite() => Ok(*v),
                _ => Err(PkpdError::UnresolvedParameter {
                    symbol: self.covariate_names.get(index).cloned().unwrap_or_default(),
                    context: format!("covariate effect on '{}'", parameter),
                }),
            }
        };
        let contribution = match effect {
            CompiledEffect::Power {
                covariate,
                theta: coefficient,
                center,
            } => {
                let c = value(*covariate)?;
                if !(c > 0.0 && *center > 0.0) {
                    return Err(PkpdError::UnresolvedParameter {
                        symbol: self.covariate_names.get(*covariate).cloned().unwrap_or_default(),
                        context: format!(
                            "power effect on '{}' needs a positive covariate and center, got {} / {}",
                            parameter, c, center
                        ),
                    });
                }
                theta[*coefficient] * (c / center).ln()
            }
            CompiledEffect::Linear {
                covariate,
                theta: coefficient,
                center,
            } => theta[*coefficient] * (value(*covariate)? - center),
            CompiledEffect::Categorical {
                covariate,
                reference,
                levels,
            } => {
                let level = value(*covariate)?;
                if level == *reference {
                    0.0
                } else {
                    let theta_index = levels
                        .iter()
                        .find(|(l, _)| *l == level)
                        .map(|(_, t)| *t)
                        .ok_or_else(|| PkpdError::UnresolvedParameter {
                            symbol: format!(
                                "{}={}",
                                self.covariate_names.get(*covariate).cloned().unwrap_or_default(),
                                level
                            ),
                            context: format!("categorical effect on '{}'", parameter),
                        })?;
                    theta[theta_index]
                }
            }
        };
        Ok(contribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn resolver(forms: Vec<CompiledForm>) -> ParameterResolver {
        let names = (0..forms.len()).map(|i| format!("p{}", i)).collect();
        ParameterResolver::new(names, forms, vec!["BW".to_string(), "SEX".to_string()])
    }

    #[test]
    fn log_normal_with_power_effect() {
        let r = resolver(vec![CompiledForm::Structured {
            style: ParameterStyle::LogNormal,
            typical: 0,
            eta: Some(0),
            iov: None,
            effects: vec![CompiledEffect::Power {
                covariate: 0,
                theta: 1,
                center: 70.0,
            }],
        }]);
        let p = r.resolve(&[2.0, 0.75], &[0.1], &[], &[35.0, 0.0]).unwrap();
        assert_relative_eq!(p[0], 2.0 * 0.5f64.powf(0.75) * 0.1f64.exp(), epsilon = 1e-12);
    }

    #[test]
    fn power_effect_needs_positive_values() {
        let power = |center| {
            resolver(vec![CompiledForm::Structured {
                style: ParameterStyle::LogNormal,
                typical: 0,
                eta: None,
                iov: None,
                effects: vec![CompiledEffect::Power {
                    covariate: 0,
                    theta: 1,
                    center,
                }],
            }])
        };
        for bw in [0.0, -70.0] {
            let err = power(70.0).resolve(&[2.0, 0.75], &[], &[], &[bw, 0.0]).unwrap_err();
            assert!(matches!(
                err,
                PkpdError::UnresolvedParameter { ref symbol, ref context }
                    if symbol == "BW" && context.contains("p0")
            ));
        }
        let err = power(0.0).resolve(&[2.0, 0.75], &[], &[], &[70.0, 0.0]).unwrap_err();
        assert!(matches!(err, PkpdError::UnresolvedParameter { .. }));
    }

    #[test]
    fn logit_normal_stays_in_unit_interval() {
        let r = resolver(vec![CompiledForm::Structured {
            style: ParameterStyle::LogitNormal,
            typical: 0,
            eta: Some(0),
            iov: Some(0),
            effects: vec![],
        }]);
        for eta in [-50.0, 0.0, 50.0] {
            let p = r.resolve(&[0.3], &[eta], &[0.2], &[]).unwrap();
            assert!(p[0] >= 0.0 && p[0] <= 1.0);
        }
    }

    #[test]
    fn categorical_reference_level_contributes_nothing() {
        let r = resolver(vec![CompiledForm::Structured {
            style: ParameterStyle::Additive,
            typical: 0,
            eta: None,
            iov: None,
            effects: vec![CompiledEffect::Categorical {
                covariate: 1,
                reference: 0.0,
                levels: vec![(1.0, 1)],
            }],
        }]);
        assert_eq!(r.resolve(&[10.0, -2.0], &[], &[], &[70.0, 0.0]).unwrap(), vec![10.0]);
        assert_eq!(r.resolve(&[10.0, -2.0], &[], &[], &[70.0, 1.0]).unwrap(), vec![8.0]);
        assert!(matches!(
            r.resolve(&[10.0, -2.0], &[], &[], &[70.0, 2.0]),
            Err(PkpdError::UnresolvedParameter { .. })
        ));
    }

    #[test]
    fn missing_covariate_is_unresolved() {
        let r = resolver(vec![CompiledForm::Structured {
            style: ParameterStyle::LogNormal,
            typical: 0,
            eta: None,
            iov: None,
            effects: vec![CompiledEffect::Linear {
                covariate: 0,
                theta: 1,
                center: 0.0,
            }],
        }]);
        let err = r.resolve(&[1.0, 0.1], &[], &[], &[f64::NAN, 0.0]).unwrap_err();
        assert!(matches!(err, PkpdError::UnresolvedParameter { symbol, .. } if symbol == "BW"));
    }
}
