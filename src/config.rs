use crate::utils::{check_num, check_prob};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

/// Model parameters.
///
/// Immutable for the whole run.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Scaling factor for the number of contacts per step.
    pub max_mix: u32,
    /// Probability that a contact with an exposed agent exposes a susceptible one.
    pub s2e_prob: f64,
    /// Per-step probability of becoming infected once past the minimum incubation.
    pub e2i_prob: f64,
    /// Per-step probability of dying while infected.
    pub i2d_prob: f64,
}

/// Initial population parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Number of agents.
    pub n_agents: usize,
    /// Number of initially exposed agents.
    pub n_exposed: usize,
    /// Number of initially infected agents.
    pub n_infected: usize,
}

impl InitConfig {
    /// Check that the population is non-empty and can hold every seeded agent.
    pub fn check(&self) -> Result<()> {
        check_num(self.n_agents, 1..).context("invalid number of agents")?;
        let Some(n_seeded) = self.n_exposed.checked_add(self.n_infected) else {
            bail!("number of exposed and infected agents overflows");
        };
        if n_seeded > self.n_agents {
            bail!(
                "number of exposed and infected agents ({n_seeded}) exceeds number of agents ({})",
                self.n_agents
            );
        }
        Ok(())
    }
}

/// Run parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of steps to simulate.
    pub n_steps: usize,
    /// Seed of the random number generator (drawn from the OS if absent).
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub init: InitConfig,
    pub run: RunConfig,
}

/// Context attached to every validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidConfiguration;

impl fmt::Display for InvalidConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration")
    }
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate all parameters.
    ///
    /// Every error returned carries [`InvalidConfiguration`] as context.
    pub fn validate(&self) -> Result<()> {
        self.check_values().context(InvalidConfiguration)
    }

    fn check_values(&self) -> Result<()> {
        check_num(self.model.max_mix, 0..=1000).context("invalid maximum mixing")?;
        check_prob(self.model.s2e_prob).context("invalid exposure probability")?;
        check_prob(self.model.e2i_prob).context("invalid infection probability")?;
        check_prob(self.model.i2d_prob).context("invalid death probability")?;

        check_num(self.init.n_agents, ..10_000_000).context("too many agents")?;
        self.init.check()?;

        check_num(self.run.n_steps, 1..1_000_000).context("invalid number of steps")?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        model: ModelConfig {
            max_mix: 5,
            s2e_prob: 0.15,
            e2i_prob: 0.1,
            i2d_prob: 0.01,
        },
        init: InitConfig {
            n_agents: 100,
            n_exposed: 2,
            n_infected: 3,
        },
        run: RunConfig {
            n_steps: 25,
            seed: Some(42),
        },
    }
}
