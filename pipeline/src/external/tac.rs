use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Request handed to the physiological compartment solver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TacRequest {
    /// Compartment model name, e.g. `PSMA`.
    pub model: String,
    /// Hot (labelled) ligand amount.
    pub hot_amount: f64,
    /// Cold (unlabelled) ligand amount.
    pub cold_amount: f64,
    /// Physiological parameter overrides by name.
    pub parameters: BTreeMap<String, f64>,
    /// Simulation stop time in minutes.
    pub stop_min: f64,
    /// Number of time steps on the model grid.
    pub steps: usize,
    /// Compartments (VOIs) to observe, in order.
    pub observables: Vec<String>,
}

/// Time-activity curves produced by the solver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TacResult {
    /// Model time grid in minutes, length T.
    pub time_min: Vec<f64>,
    /// One curve of length T per observable, in request order [MBq].
    pub tacs_mbq: Vec<Vec<f64>>,
}

impl TacResult {
    fn validate(&self, observables: &[String]) -> Result<()> {
        if self.tacs_mbq.len() != observables.len() {
            return Err(PipelineError::ToolFailed {
                tool: "TAC solver".into(),
                detail: format!(
                    "returned {} curves for {} observables",
                    self.tacs_mbq.len(),
                    observables.len()
                ),
            });
        }
        if self.tacs_mbq.iter().any(|c| c.len() != self.time_min.len()) {
            return Err(PipelineError::ToolFailed {
                tool: "TAC solver".into(),
                detail: "curve length does not match the time grid".into(),
            });
        }
        Ok(())
    }
}

/// Opaque TAC generator; see [`CommandTacSolver`] for the production
/// implementation.
pub trait TacSolver {
    fn simulate(&self, request: &TacRequest) -> Result<TacResult>;
}

/// Spawns the configured solver executable, writing the request as JSON on
/// stdin and reading the result as JSON from stdout.
pub struct CommandTacSolver {
    pub executable: PathBuf,
}

impl TacSolver for CommandTacSolver {
    fn simulate(&self, request: &TacRequest) -> Result<TacResult> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let payload = serde_json::to_vec(request)?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(&payload)?;

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(PipelineError::ToolFailed {
                tool: self.executable.display().to_string(),
                detail: format!("exited with {}", output.status),
            });
        }
        let result: TacResult = serde_json::from_slice(&output.stdout)?;
        result.validate(&request.observables)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_validation() {
        let observables = vec!["Kidney".to_string(), "Rest".to_string()];
        let good = TacResult {
            time_min: vec![0.0, 1.0, 2.0],
            tacs_mbq: vec![vec![0.0, 1.0, 2.0], vec![3.0, 2.0, 1.0]],
        };
        assert!(good.validate(&observables).is_ok());

        let wrong_count = TacResult {
            time_min: vec![0.0, 1.0],
            tacs_mbq: vec![vec![0.0, 1.0]],
        };
        assert!(wrong_count.validate(&observables).is_err());

        let ragged = TacResult {
            time_min: vec![0.0, 1.0],
            tacs_mbq: vec![vec![0.0], vec![1.0, 2.0]],
        };
        assert!(ragged.validate(&observables).is_err());
    }
}
