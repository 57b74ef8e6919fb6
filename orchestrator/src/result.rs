use std::collections::BTreeMap;

use log::warn;
use model::{Metrics, ParameterDict};
use parameter_server::{ServerReport, aggregation::ShapleyValues};
use serde::Serialize;
use worker::WorkerMetrics;

use crate::{
    error::{OrchestratorError, Result},
    pool::UnitOutcome,
};

/// What a participant did over the whole task.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ParticipantStats {
    pub rounds_trained: u64,
    pub rounds_skipped: u64,
    pub sent_elements: u64,
    pub total_elements: u64,
    pub last_train_metrics: Metrics,
}

impl From<WorkerMetrics> for ParticipantStats {
    fn from(metrics: WorkerMetrics) -> Self {
        Self {
            rounds_trained: metrics.rounds_trained,
            rounds_skipped: metrics.rounds_skipped,
            sent_elements: metrics.sent_elements,
            total_elements: metrics.total_elements,
            last_train_metrics: metrics.last_train_metrics,
        }
    }
}

/// The merged outcome of a training task, keyed by practitioner id.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingResult {
    /// The evaluation of the final global parameters.
    pub metrics: Metrics,
    /// The evaluation of every round.
    pub performance: BTreeMap<u64, Metrics>,
    /// `round -> practitioner -> value`, only for Shapley based algorithms.
    pub shapley_values: Option<BTreeMap<u64, BTreeMap<u64, f64>>>,
    pub participants: BTreeMap<u64, ParticipantStats>,
    pub round_number: u64,
    pub parameters: ParameterDict,
}

/// Merges the outcome of every execution unit of a task into one result.
///
/// # Arguments
/// * `outcomes` - The outcome of every unit.
/// * `practitioner_ids` - The task's practitioners, ascending, one per worker.
///
/// # Returns
/// The merged result, or the error explaining why the task failed.
pub fn merge(outcomes: Vec<UnitOutcome>, practitioner_ids: &[u64]) -> Result<TrainingResult> {
    let mut reports = Vec::with_capacity(outcomes.len());
    let mut errors = Vec::new();

    for outcome in outcomes {
        match outcome {
            Ok(report) => reports.push(report),
            Err(e) => errors.push(e),
        }
    }

    if let Some(e) = OrchestratorError::root_cause(errors) {
        return Err(e);
    }

    let mut server = None;
    let mut participants = BTreeMap::new();

    for report in reports {
        if let Some(report) = report.server {
            server = Some(report);
        }

        for (worker_id, metrics) in report.workers {
            match practitioner_ids.get(worker_id) {
                Some(&id) => {
                    participants.insert(id, metrics.into());
                }
                None => warn!(worker_id = worker_id; "worker without practitioner"),
            }
        }
    }

    let Some(ServerReport {
        performance,
        shapley_values,
        round_number,
        parameters,
    }) = server
    else {
        return Err(OrchestratorError::InvalidConfig(
            "no execution unit hosted the server".into(),
        ));
    };

    let metrics = performance.values().next_back().cloned().unwrap_or_default();

    Ok(TrainingResult {
        metrics,
        performance,
        shapley_values: shapley_values.map(|values| remap_worker_ids(values, practitioner_ids)),
        participants,
        round_number,
        parameters: (*parameters).clone(),
    })
}

/// Replaces the internal worker ids of a Shapley table by practitioner ids.
///
/// Worker `i` is the `i`-th smallest practitioner id.
pub fn remap_worker_ids(values: ShapleyValues, practitioner_ids: &[u64]) -> BTreeMap<u64, BTreeMap<u64, f64>> {
    let mut sorted = practitioner_ids.to_vec();
    sorted.sort_unstable();

    values
        .into_iter()
        .map(|(round, per_worker)| {
            let per_practitioner = per_worker
                .into_iter()
                .filter_map(|(worker_id, value)| sorted.get(worker_id).map(|&id| (id, value)))
                .collect();

            (round, per_practitioner)
        })
        .collect()
}
