//! `spotwardend evaluate`: one engine run over frozen inputs.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use spotwarden_core::{Decision, EngineConfig, Forecast};
use spotwarden_engine::{DecisionInput, Predictions, decide};
use spotwarden_provider::sim::SimForecast;

/// Input file: the engine input plus whatever forecasts the oracle would
/// have returned. Pools without a forecast take the fallback path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateInput {
    #[serde(flatten)]
    pub input: DecisionInput,
    #[serde(default)]
    pub forecasts: Vec<SimForecast>,
}

impl EvaluateInput {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }
}

pub fn evaluate(config: &EngineConfig, file: &EvaluateInput) -> Decision {
    let predictions: Predictions = file
        .forecasts
        .iter()
        .map(|f| {
            (
                f.pool.clone(),
                Forecast {
                    predicted_price: f.predicted_price,
                    confidence: f.confidence,
                },
            )
        })
        .collect();
    decide(config, &file.input, &predictions)
}
