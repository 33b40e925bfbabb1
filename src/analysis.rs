use crate::config::Config;
use crate::model::Record;
use crate::stats::{Accumulator, AccumulatorReport};
use anyhow::{Context, Result, bail};
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use serde_value::Value;
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Observable computed over the trajectories of an ensemble of runs.
pub trait Obs {
    fn name(&self) -> &'static str;
    fn update(&mut self, records: &[Record]) -> Result<()>;
    fn report(&self) -> Result<Value>;
}

fn to_value<T: Serialize>(report: T) -> Result<Value> {
    serde_value::to_value(report).context("failed to convert report to value")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepReport {
    pub step: usize,
    pub susceptible: AccumulatorReport,
    pub exposed: AccumulatorReport,
    pub infected: AccumulatorReport,
    pub recovered: AccumulatorReport,
    pub dead: AccumulatorReport,
}

/// Ensemble statistics of every state count at every step.
pub struct CompartmentTrajectory {
    acc_mat: Vec<[Accumulator; 5]>,
}

impl CompartmentTrajectory {
    pub fn new(cfg: &Config) -> Self {
        let acc_mat = (0..cfg.run.n_steps)
            .map(|_| std::array::from_fn(|_| Accumulator::new()))
            .collect();
        Self { acc_mat }
    }
}

impl Obs for CompartmentTrajectory {
    fn name(&self) -> &'static str {
        "compartments"
    }

    fn update(&mut self, records: &[Record]) -> Result<()> {
        if records.len() != self.acc_mat.len() {
            bail!(
                "trajectory must have {} records, but has {}",
                self.acc_mat.len(),
                records.len()
            );
        }
        for (acc_vec, record) in self.acc_mat.iter_mut().zip(records) {
            for (acc, count) in acc_vec.iter_mut().zip(record.counts()) {
                acc.add(count as f64);
            }
        }
        Ok(())
    }

    fn report(&self) -> Result<Value> {
        let reports: Vec<_> = self
            .acc_mat
            .iter()
            .enumerate()
            .map(|(step, acc_vec)| {
                let [s, e, i, r, d] = acc_vec.each_ref().map(Accumulator::report);
                StepReport {
                    step,
                    susceptible: s,
                    exposed: e,
                    infected: i,
                    recovered: r,
                    dead: d,
                }
            })
            .collect();
        to_value(reports)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeakReport {
    pub size: AccumulatorReport,
    pub step: AccumulatorReport,
}

/// Height and timing of the infection peak.
///
/// Ties are resolved in favour of the earliest step.
pub struct PeakInfected {
    size_acc: Accumulator,
    step_acc: Accumulator,
}

impl PeakInfected {
    pub fn new() -> Self {
        Self {
            size_acc: Accumulator::new(),
            step_acc: Accumulator::new(),
        }
    }
}

impl Obs for PeakInfected {
    fn name(&self) -> &'static str {
        "peak_infected"
    }

    fn update(&mut self, records: &[Record]) -> Result<()> {
        let peak = records
            .iter()
            .min_by_key(|record| (Reverse(record.infected), record.step))
            .context("trajectory is empty")?;
        self.size_acc.add(peak.infected as f64);
        self.step_acc.add(peak.step as f64);
        Ok(())
    }

    fn report(&self) -> Result<Value> {
        to_value(PeakReport {
            size: self.size_acc.report(),
            step: self.step_acc.report(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalSizeReport {
    pub recovered: AccumulatorReport,
    pub dead: AccumulatorReport,
    pub affected: AccumulatorReport,
}

/// Outcome of the epidemic at the last step.
///
/// `affected` counts every agent that left the susceptible state.
pub struct FinalSize {
    n_agents: usize,
    recovered_acc: Accumulator,
    dead_acc: Accumulator,
    affected_acc: Accumulator,
}

impl FinalSize {
    pub fn new(cfg: &Config) -> Self {
        Self {
            n_agents: cfg.init.n_agents,
            recovered_acc: Accumulator::new(),
            dead_acc: Accumulator::new(),
            affected_acc: Accumulator::new(),
        }
    }
}

impl Obs for FinalSize {
    fn name(&self) -> &'static str {
        "final_size"
    }

    fn update(&mut self, records: &[Record]) -> Result<()> {
        let last = records.last().context("trajectory is empty")?;
        self.recovered_acc.add(last.recovered as f64);
        self.dead_acc.add(last.dead as f64);
        self.affected_acc
            .add(self.n_agents.saturating_sub(last.susceptible) as f64);
        Ok(())
    }

    fn report(&self) -> Result<Value> {
        to_value(FinalSizeReport {
            recovered: self.recovered_acc.report(),
            dead: self.dead_acc.report(),
            affected: self.affected_acc.report(),
        })
    }
}

/// Collects run trajectories and summarizes them across the ensemble.
pub struct Analyzer {
    n_steps: usize,
    n_agents: usize,
    n_runs: usize,
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new(cfg: &Config) -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(CompartmentTrajectory::new(cfg)),
            Box::new(PeakInfected::new()),
            Box::new(FinalSize::new(cfg)),
        ];
        Self {
            n_steps: cfg.run.n_steps,
            n_agents: cfg.init.n_agents,
            n_runs: 0,
            obs_ptr_vec,
        }
    }

    pub fn n_runs(&self) -> usize {
        self.n_runs
    }

    /// Add the trajectory of one run.
    ///
    /// The trajectory is checked before any observable sees it, so a rejected
    /// run leaves the analyzer unchanged.
    pub fn add_records(&mut self, records: &[Record]) -> Result<()> {
        self.check_records(records)
            .context("invalid trajectory")?;
        for obs in &mut self.obs_ptr_vec {
            obs.update(records)
                .with_context(|| format!("failed to update {}", obs.name()))?;
        }
        self.n_runs += 1;
        Ok(())
    }

    fn check_records(&self, records: &[Record]) -> Result<()> {
        if records.len() != self.n_steps {
            bail!(
                "trajectory must have {} records, but has {}",
                self.n_steps,
                records.len()
            );
        }
        for (i_step, record) in records.iter().enumerate() {
            if record.step != i_step {
                bail!("record {i_step} has step {}", record.step);
            }
            if record.total() != self.n_agents {
                bail!(
                    "record {i_step} counts {} agents, but population has {}",
                    record.total(),
                    self.n_agents
                );
            }
        }
        Ok(())
    }

    /// Add the trajectory stored in a MessagePack file.
    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);

        let records: Vec<Record> =
            decode::from_read(&mut reader).context("failed to deserialize trajectory")?;

        self.add_records(&records)
    }

    /// Reports of every observable, keyed by name.
    pub fn results(&self) -> Result<BTreeMap<&'static str, Value>> {
        let mut results = BTreeMap::new();
        results.insert("n_runs", Value::U64(self.n_runs as u64));
        for obs in &self.obs_ptr_vec {
            results.insert(obs.name(), obs.report()?);
        }
        Ok(results)
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let results = self.results()?;

        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        encode::write_named(&mut writer, &results).context("failed to serialize results")?;
        writer.flush().context("failed to flush writer stream")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn record(step: usize, counts: [usize; 5]) -> Record {
        let [susceptible, exposed, infected, recovered, dead] = counts;
        Record {
            step,
            susceptible,
            exposed,
            infected,
            recovered,
            dead,
        }
    }

    fn trajectory(infected: &[usize]) -> Vec<Record> {
        infected
            .iter()
            .enumerate()
            .map(|(step, &i)| record(step, [10 - i - step, 0, i, step, 0]))
            .collect()
    }

    #[test]
    fn peak_prefers_earliest_step() {
        let mut obs = PeakInfected::new();
        obs.update(&trajectory(&[1, 3, 2, 3])).expect("failed to update");
        obs.update(&trajectory(&[2, 1, 1, 1])).expect("failed to update");

        let report = obs.size_acc.report();
        assert_eq!(report.mean, 2.5);
        let report = obs.step_acc.report();
        assert_eq!((report.min, report.max), (0.0, 1.0));
    }

    #[test]
    fn final_size_counts_affected_agents() {
        let mut cfg = test_config();
        cfg.init.n_agents = 10;
        let mut obs = FinalSize::new(&cfg);
        obs.update(&[record(0, [4, 1, 1, 3, 1])]).expect("failed to update");

        assert_eq!(obs.affected_acc.report().mean, 6.0);
        assert_eq!(obs.dead_acc.report().mean, 1.0);
    }

    #[test]
    fn analyzer_rejects_wrong_trajectory_length() {
        let mut cfg = test_config();
        cfg.init.n_agents = 10;
        cfg.run.n_steps = 4;
        let mut analyzer = Analyzer::new(&cfg);

        analyzer
            .add_records(&trajectory(&[1, 2, 2, 1]))
            .expect("failed to add records");
        assert!(analyzer.add_records(&trajectory(&[1, 2, 1])).is_err());
        assert_eq!(analyzer.n_runs(), 1);

        let results = analyzer.results().expect("failed to build results");
        assert_eq!(results["n_runs"], Value::U64(1));
        assert!(results.contains_key("compartments"));
        assert!(results.contains_key("peak_infected"));
        assert!(results.contains_key("final_size"));
    }

    #[test]
    fn rejected_run_leaves_observables_untouched() {
        let mut cfg = test_config();
        cfg.init.n_agents = 10;
        cfg.run.n_steps = 4;

        let run_a = trajectory(&[1, 2, 2, 1]);
        let run_b = trajectory(&[2, 3, 1, 0]);
        let mut bad_run = trajectory(&[1, 1, 1, 1]);
        bad_run[3].dead += 1;

        let mut analyzer = Analyzer::new(&cfg);
        analyzer.add_records(&run_a).expect("failed to add records");
        assert!(analyzer.add_records(&bad_run).is_err());
        analyzer.add_records(&run_b).expect("failed to add records");

        let mut clean_analyzer = Analyzer::new(&cfg);
        clean_analyzer.add_records(&run_a).expect("failed to add records");
        clean_analyzer.add_records(&run_b).expect("failed to add records");

        assert_eq!(analyzer.n_runs(), 2);
        assert_eq!(
            analyzer.results().expect("failed to build results"),
            clean_analyzer.results().expect("failed to build results")
        );
    }
}
