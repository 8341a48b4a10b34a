//! Late-arriving metric values from an external CSV ledger.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

use tl_types::{DataError, Experiment, Observation, TlResult, TrialIndex};

use crate::scheduler::Scheduler;

pub const TRIAL_INDEX_COLUMN: &str = "trial_index";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Placeholder cells replaced by a CSV value.
    pub replaced: usize,
    pub trials: BTreeSet<TrialIndex>,
    /// Configured metrics with no column in the CSV.
    pub missing_columns: Vec<String>,
    /// CSV columns that name no configured metric.
    pub unknown_columns: Vec<String>,
}

fn backfill_error(message: impl Into<String>) -> DataError {
    DataError::Backfill {
        message: message.into(),
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    match cell.to_ascii_lowercase().as_str() {
        "" | "nan" | "null" | "none" => None,
        _ => cell.parse::<f64>().ok().filter(|v| !v.is_nan()),
    }
}

/// Replace pending (NaN) observation cells with values from `reader`.
///
/// Cells that already hold a value are never overwritten, and cells absent
/// from the CSV stay pending.
pub fn reconcile<R: Read>(experiment: &mut Experiment, reader: R) -> TlResult<BackfillReport> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = csv_reader
        .headers()
        .map_err(|e| backfill_error(format!("cannot read header: {e}")))?
        .clone();

    let index_column = headers
        .iter()
        .position(|h| h == TRIAL_INDEX_COLUMN)
        .ok_or_else(|| backfill_error(format!("missing `{TRIAL_INDEX_COLUMN}` column")))?;

    let metric_names = experiment.metric_names();
    let mut report = BackfillReport::default();
    let mut metric_columns = Vec::new();
    for (position, header) in headers.iter().enumerate() {
        if position == index_column {
            continue;
        }
        if metric_names.iter().any(|m| m == header) {
            metric_columns.push((position, header.to_string()));
        } else {
            report.unknown_columns.push(header.to_string());
        }
    }
    if metric_columns.is_empty() {
        return Err(backfill_error("no column matches a configured metric").into());
    }
    report.missing_columns = metric_names
        .iter()
        .filter(|m| !metric_columns.iter().any(|(_, name)| name == *m))
        .cloned()
        .collect();
    if !report.missing_columns.is_empty() {
        warn!(columns = ?report.missing_columns, "backfill CSV lacks metric columns; those cells stay pending");
    }
    if !report.unknown_columns.is_empty() {
        warn!(columns = ?report.unknown_columns, "ignoring backfill columns that name no metric");
    }

    for (line, record) in csv_reader.records().enumerate() {
        let record = record.map_err(|e| backfill_error(format!("row {}: {e}", line + 1)))?;
        let raw_index = record.get(index_column).unwrap_or("");
        let trial_index: TrialIndex = raw_index
            .parse()
            .map_err(|_| backfill_error(format!("row {}: invalid trial_index `{raw_index}`", line + 1)))?;

        for (position, metric) in &metric_columns {
            let Some(value) = record.get(*position).and_then(parse_cell) else {
                continue;
            };
            let pending = experiment
                .observations()
                .get(trial_index, metric)
                .is_some_and(Observation::is_pending);
            if !pending {
                continue;
            }

            let sem = experiment
                .metric(metric)
                .and_then(|m| m.noise_sd)
                .unwrap_or(f64::NAN);
            experiment.attach_observation(Observation::new(trial_index, metric.clone(), value, sem))?;
            debug!(trial = trial_index, metric = %metric, value, "backfilled");
            report.replaced += 1;
            report.trials.insert(trial_index);
        }
    }

    info!(replaced = report.replaced, trials = report.trials.len(), "backfill reconciled");
    Ok(report)
}

impl Scheduler {
    /// Reconcile the experiment against a backfill CSV, re-report the
    /// affected trials to the engine and save the snapshot.
    pub fn reconcile_backfill(&mut self, csv_path: &Path) -> TlResult<BackfillReport> {
        let file = File::open(csv_path)?;
        let report = reconcile(self.experiment_mut(), file)?;
        if report.replaced > 0 {
            self.reobserve(&report.trials)?;
            self.save_snapshot_if_configured()?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tl_types::{MetricConfig, ObjectiveConfig, Parameters, SearchSpace, TlError};

    fn experiment(pending: &[(TrialIndex, &str)], trials: usize) -> Experiment {
        let mut exp = Experiment::new(
            "backfill",
            SearchSpace::new().add_float("x", 0.0, 1.0),
            ObjectiveConfig::new(vec![
                MetricConfig::passthrough("loss").with_noise_sd(0.25),
                MetricConfig::passthrough("time").info_only(),
            ]),
        )
        .unwrap();
        for index in 0..trials {
            let trial = exp.new_trial(Parameters::new(), "manual");
            trial.mark_running();
            trial.mark_completed();
            for metric in ["loss", "time"] {
                let mean = if pending.contains(&(index, metric)) {
                    f64::NAN
                } else {
                    index as f64
                };
                exp.attach_observation(Observation::new(index, metric, mean, 0.0)).unwrap();
            }
        }
        exp
    }

    #[test]
    fn replaces_only_pending_cells() {
        let mut exp = experiment(&[(0, "loss"), (1, "time")], 2);
        let csv = "trial_index, loss, time\n0, 1.5, 9\n1, 7, 3.25\n";
        let report = reconcile(&mut exp, csv.as_bytes()).unwrap();

        assert_eq!(report.replaced, 2);
        let loss = exp.observations().get(0, "loss").unwrap();
        assert_eq!(loss.mean, 1.5);
        assert_eq!(loss.sem, 0.25);
        let time = exp.observations().get(1, "time").unwrap();
        assert_eq!(time.mean, 3.25);
        assert!(time.sem.is_nan());
        // already observed cells keep their values
        assert_eq!(exp.observations().get(0, "time").unwrap().mean, 0.0);
        assert_eq!(exp.observations().get(1, "loss").unwrap().mean, 1.0);
    }

    #[test]
    fn partial_columns_reconcile_what_they_can() {
        let mut exp = experiment(&[(0, "loss"), (0, "time")], 1);
        let csv = "trial_index,loss,notes\n0,2.0,rerun\n";
        let report = reconcile(&mut exp, csv.as_bytes()).unwrap();

        assert_eq!(report.replaced, 1);
        assert_eq!(report.missing_columns, vec!["time".to_string()]);
        assert_eq!(report.unknown_columns, vec!["notes".to_string()]);
        assert!(exp.observations().get(0, "time").unwrap().is_pending());
    }

    #[test]
    fn blank_and_null_cells_are_skipped() {
        let mut exp = experiment(&[(0, "loss"), (1, "loss")], 2);
        let csv = "trial_index,loss\n0,\n1,null\n";
        let report = reconcile(&mut exp, csv.as_bytes()).unwrap();
        assert_eq!(report.replaced, 0);
        assert_eq!(exp.observations().pending_cells().len(), 2);
    }

    #[test]
    fn malformed_ledgers_are_errors() {
        let mut exp = experiment(&[(0, "loss")], 1);
        for csv in ["loss\n1.0\n", "trial_index,other\n0,1\n", "trial_index,loss\nzero,1\n"] {
            assert!(matches!(
                reconcile(&mut exp, csv.as_bytes()),
                Err(TlError::Data(DataError::Backfill { .. }))
            ));
        }
    }

    proptest! {
        #[test]
        fn backfill_supersedes_nan_only(
            pending in proptest::collection::vec(any::<bool>(), 6),
            provided in proptest::collection::vec(proptest::option::of(-100.0f64..100.0), 6),
        ) {
            let metrics = ["loss", "time"];
            let cells: Vec<(TrialIndex, &str)> = (0..3)
                .flat_map(|i| metrics.iter().map(move |m| (i, *m)))
                .collect();
            let pending_cells: Vec<_> = cells.iter().zip(&pending).filter(|(_, p)| **p).map(|(c, _)| *c).collect();
            let mut exp = experiment(&pending_cells, 3);

            let mut csv = String::from("trial_index,loss,time\n");
            for i in 0..3 {
                let render = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
                csv.push_str(&format!("{i},{},{}\n", render(provided[2 * i]), render(provided[2 * i + 1])));
            }
            reconcile(&mut exp, csv.as_bytes()).unwrap();

            for (k, (index, metric)) in cells.iter().enumerate() {
                let mean = exp.observations().get(*index, metric).unwrap().mean;
                match (pending[k], provided[k]) {
                    (true, Some(value)) => prop_assert_eq!(mean, value),
                    (true, None) => prop_assert!(mean.is_nan()),
                    (false, _) => prop_assert_eq!(mean, *index as f64),
                }
            }
        }
    }
}
