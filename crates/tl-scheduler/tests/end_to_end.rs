use std::sync::Arc;

use tempfile::TempDir;
use tl_optimizer::{GenerationStep, GenerationStrategy, GenerationStrategyConfig, ModelKind};
use tl_runner::{branin, FetchContext, MetricData, SharedWrapper, TrialData, Wrapper, WrapperDescriptor};
use tl_scheduler::{load, Scheduler, SchedulerOptions, SerializationContext, TrellisConfig};
use tl_types::{
    Experiment, MetricConfig, ObjectiveConfig, SearchSpace, StatusChange, TlResult, Trial, TrialStatus,
};

/// Evaluates Branin in-process and reports completion on the first poll.
struct BraninWrapper;

impl Wrapper for BraninWrapper {
    fn descriptor(&self) -> WrapperDescriptor {
        WrapperDescriptor::new("branin")
    }

    fn run_model(&self, _trial: &Trial) -> TlResult<()> {
        Ok(())
    }

    fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange> {
        Ok(trial.mark_completed())
    }

    fn fetch_trial_data(&self, trial: &Trial, _context: &FetchContext) -> TlResult<TrialData> {
        let params = trial.parameters()?;
        let x = |name: &str| params.get(name).and_then(|v| v.as_f64()).unwrap_or(0.0);
        Ok(TrialData::Single(MetricData::with_sem(branin(x("x0"), x("x1")), 0.0)))
    }
}

fn fast_options() -> SchedulerOptions {
    SchedulerOptions::default().with_poll_interval(0.0, 1.0, 0.0)
}

fn branin_scheduler(options: SchedulerOptions) -> Scheduler {
    let experiment = Experiment::new(
        "branin",
        SearchSpace::new().add_float("x0", -5.0, 10.0).add_float("x1", -5.0, 10.0),
        ObjectiveConfig::new(vec![MetricConfig::passthrough("branin")]),
    )
    .unwrap();
    let strategy = GenerationStrategy::from_config(&GenerationStrategyConfig::default()).unwrap();
    Scheduler::new(experiment, strategy, Arc::new(BraninWrapper), options).unwrap()
}

#[test]
fn five_trials_on_two_range_parameters() {
    let mut scheduler = branin_scheduler(fast_options().with_n_trials(5));
    let summary = scheduler.run_all_trials().unwrap();

    assert_eq!(summary.num_trials, 5);
    assert!(scheduler.experiment().trials().iter().all(|t| t.is_terminal()));
    assert_eq!(scheduler.experiment().observations().len(), 5);
    assert_eq!(summary.count(TrialStatus::Completed), 5);

    for trial in scheduler.experiment().trials() {
        for value in trial.parameters().unwrap().values() {
            let v = value.as_f64().unwrap();
            assert!((-5.0..=10.0).contains(&v));
        }
    }
    assert!(summary.best_trial.is_some());
}

#[test]
fn resume_from_snapshot_continues_indices() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("state").join("snapshot.json");
    let mut scheduler = branin_scheduler(fast_options().with_snapshot_path(&path));
    scheduler.run_n_trials(3).unwrap();

    let mut context = SerializationContext::with_defaults();
    context.register_wrapper("branin", |_| Ok(Arc::new(BraninWrapper) as SharedWrapper));
    let mut resumed = load(&path, &context).unwrap();
    assert_eq!(resumed.experiment().num_trials(), 3);
    assert_eq!(resumed.experiment().observations().len(), 3);

    let summary = resumed.run_n_trials(2).unwrap();
    assert_eq!(summary.num_trials, 5);
    let indices: Vec<_> = resumed.experiment().trials().iter().map(|t| t.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(resumed.generation_strategy().num_generated(), 5);
}

#[test]
fn global_stopping_ends_an_open_ended_run() {
    let experiment = Experiment::new(
        "flat",
        SearchSpace::new().add_float("x0", 0.0, 1.0),
        ObjectiveConfig::new(vec![MetricConfig::passthrough("branin")]),
    )
    .unwrap();

    struct Flat;
    impl Wrapper for Flat {
        fn descriptor(&self) -> WrapperDescriptor {
            WrapperDescriptor::new("flat")
        }
        fn run_model(&self, _trial: &Trial) -> TlResult<()> {
            Ok(())
        }
        fn set_trial_status(&self, trial: &mut Trial) -> TlResult<StatusChange> {
            Ok(trial.mark_completed())
        }
        fn fetch_trial_data(&self, _trial: &Trial, _context: &FetchContext) -> TlResult<TrialData> {
            Ok(TrialData::Single(MetricData::value(1.0)))
        }
    }

    let strategy = GenerationStrategy::new(vec![GenerationStep::new(ModelKind::Random)]);
    let options = fast_options()
        .with_max_pending_trials(1)
        .with_global_stopping(tl_scheduler::GlobalStoppingConfig {
            min_trials: 3,
            window_size: 2,
            improvement_bar: 0.01,
        });
    let mut scheduler = Scheduler::new(experiment, strategy, Arc::new(Flat), options).unwrap();
    let summary = scheduler.run_all_trials().unwrap();

    assert_eq!(summary.num_trials, 3);
    assert!(summary.stop_reason.unwrap().contains("improved"));
}

#[cfg(unix)]
#[test]
fn script_wrapper_drives_external_commands() {
    let tmp = TempDir::new().unwrap();
    let yaml = format!(
        r#"
name: scripted
objective:
  metrics:
    - name: loss
parameters:
  - name: x
    type: range
    bounds: [1, 3]
generation_strategy:
  steps:
    - model: grid
scheduler:
  max_pending_trials: 2
  init_seconds_between_polls: 0.01
  max_seconds_between_polls: 0.05
script_options:
  experiment_dir: {}
  run_model_command: [sh, -c, "echo '{{\"loss\": 2.5}}' > out.tmp && mv out.tmp output.json"]
"#,
        tmp.path().join("exp").display()
    );
    let config = TrellisConfig::from_yaml_str(&yaml).unwrap();
    let (mut scheduler, wrapper) = config.build_script_scheduler().unwrap();
    let summary = scheduler.run_all_trials().unwrap();

    assert_eq!(summary.count(TrialStatus::Completed), 3);
    assert_eq!(scheduler.experiment().observations().get(2, "loss").unwrap().mean, 2.5);
    assert!(wrapper.artifacts(0).path("parameters.json").exists());
    assert!(wrapper.processes().is_empty());
}
