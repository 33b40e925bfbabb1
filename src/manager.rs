use crate::analysis::Analyzer;
use crate::config::Config;
use crate::engine::Engine;
use crate::model::Record;
use anyhow::{Context, Result};
use glob::glob;
use rmp_serde::encode;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

/// Owns a simulation directory: its configuration and the runs stored in it.
pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Perform `n_runs` new independent runs.
    pub fn create_runs(&self, n_runs: usize) -> Result<()> {
        for _ in 0..n_runs {
            self.create_run().context("failed to create run")?;
        }
        Ok(())
    }

    fn create_run(&self) -> Result<()> {
        let run_idx = self.count_run_dirs().context("failed to count run dirs")?;

        // Offset the seed so that every run of the ensemble draws its own stream.
        let mut cfg = self.cfg.clone();
        cfg.run.seed = cfg.run.seed.map(|seed| seed.wrapping_add(run_idx as u64));

        let mut engine =
            Engine::generate_initial_condition(cfg).context("failed to generate initial condition")?;
        let records = engine
            .run_simulation()
            .context("failed to run simulation")?;

        // The run dir only appears once there is a complete trajectory to put in it.
        let run_dir = self.run_dir(run_idx);
        fs::create_dir_all(&run_dir).with_context(|| format!("failed to create {run_dir:?}"))?;
        log::info!("created {run_dir:?}");

        if let Err(error) = self.write_run(run_idx, &records) {
            fs::remove_dir_all(&run_dir).ok();
            return Err(error);
        }

        Ok(())
    }

    fn write_run(&self, run_idx: usize, records: &[Record]) -> Result<()> {
        let trajectory_file = self.trajectory_file(run_idx);
        write_trajectory(&trajectory_file, records)
            .with_context(|| format!("failed to write {trajectory_file:?}"))?;

        let table_file = self.table_file(run_idx);
        write_table(&table_file, records)
            .with_context(|| format!("failed to write {table_file:?}"))?;
        log::info!("wrote {trajectory_file:?} and {table_file:?}");

        Ok(())
    }

    pub fn analyze_sim(&self) -> Result<()> {
        let mut analyzer = Analyzer::new(&self.cfg);

        let n_runs = self.count_run_dirs().context("failed to count run dirs")?;
        for run_idx in 0..n_runs {
            let trajectory_file = self.trajectory_file(run_idx);
            analyzer
                .add_file(&trajectory_file)
                .with_context(|| format!("failed to add {trajectory_file:?}"))?;
        }

        let results_file = self.results_file();
        analyzer
            .save_results(&results_file)
            .context("failed to save results")?;
        log::info!("analyzed {} runs into {results_file:?}", analyzer.n_runs());

        Ok(())
    }

    pub fn clean_sim(&self) -> Result<()> {
        for run_dir in self.run_dirs()? {
            fs::remove_dir_all(&run_dir)
                .with_context(|| format!("failed to remove {run_dir:?}"))?;
            log::info!("removed {run_dir:?}");
        }

        let results_file = self.results_file();
        if results_file.exists() {
            fs::remove_file(&results_file)
                .with_context(|| format!("failed to remove {results_file:?}"))?;
            log::info!("removed {results_file:?}");
        }

        Ok(())
    }

    fn run_dirs(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.sim_dir.join("run-*");
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let run_dirs = glob(pattern)
            .context("failed to glob run dirs")?
            .filter_map(Result::ok)
            .filter(|p| p.is_dir())
            .collect();
        Ok(run_dirs)
    }

    fn count_run_dirs(&self) -> Result<usize> {
        Ok(self.run_dirs()?.len())
    }

    fn run_dir(&self, run_idx: usize) -> PathBuf {
        self.sim_dir.join(format!("run-{run_idx:04}"))
    }

    fn trajectory_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("trajectory.msgpack")
    }

    fn table_file(&self, run_idx: usize) -> PathBuf {
        self.run_dir(run_idx).join("trajectory.csv")
    }

    fn results_file(&self) -> PathBuf {
        self.sim_dir.join("results.msgpack")
    }
}

fn write_trajectory(file: &Path, records: &[Record]) -> Result<()> {
    let file = File::create(file).context("failed to create file")?;
    let mut writer = BufWriter::new(file);
    encode::write(&mut writer, records).context("failed to serialize trajectory")?;
    writer.flush().context("failed to flush writer stream")?;
    Ok(())
}

fn write_table(file: &Path, records: &[Record]) -> Result<()> {
    let mut writer = csv::Writer::from_path(file).context("failed to create file")?;
    for record in records {
        writer.serialize(record).context("failed to serialize record")?;
    }
    writer.flush().context("failed to flush writer stream")?;
    Ok(())
}
