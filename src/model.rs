//! Simulation data types.

use serde::{Deserialize, Serialize};

/// Steps an agent may stay exposed before resolving without becoming infectious.
pub const MAX_TIME_EXPOSED: u32 = 14;
/// Steps an agent must stay exposed before it can become infected.
pub const MIN_TIME_EXPOSED: u32 = 3;
/// Steps an agent may stay infected before recovering.
pub const MAX_TIME_INFECTED: u32 = 14;

/// Epidemiological state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiseaseState {
    Susceptible,
    Exposed,
    Infected,
    Recovered,
    Dead,
}

impl DiseaseState {
    /// Whether an agent in this state can be drawn as a contact.
    pub fn is_contactable(self) -> bool {
        matches!(self, Self::Susceptible | Self::Exposed)
    }
}

/// Agent of the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    id: usize,
    mixing: f64,

    pub state: DiseaseState,
    pub time_exposed: u32,
    pub time_infected: u32,
}

impl Agent {
    /// Create a new susceptible agent with zero dwell times.
    pub fn new(id: usize, mixing: f64) -> Self {
        Self {
            id,
            mixing,
            state: DiseaseState::Susceptible,
            time_exposed: 0,
            time_infected: 0,
        }
    }

    /// Get the identifier of the agent (`1..=N`).
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get the mixing propensity of the agent.
    pub fn mixing(&self) -> f64 {
        self.mixing
    }
}

/// Population of a single run.
///
/// The number of agents is fixed; deaths change state, not membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    pub agt_vec: Vec<Agent>,
}

impl Population {
    /// Copy of the current state of every agent, indexed like `agt_vec`.
    pub fn snapshot(&self) -> Vec<DiseaseState> {
        self.agt_vec.iter().map(|agt| agt.state).collect()
    }

    /// Count the agents in each state.
    pub fn record(&self, step: usize) -> Record {
        let mut record = Record {
            step,
            susceptible: 0,
            exposed: 0,
            infected: 0,
            recovered: 0,
            dead: 0,
        };
        for agt in &self.agt_vec {
            match agt.state {
                DiseaseState::Susceptible => record.susceptible += 1,
                DiseaseState::Exposed => record.exposed += 1,
                DiseaseState::Infected => record.infected += 1,
                DiseaseState::Recovered => record.recovered += 1,
                DiseaseState::Dead => record.dead += 1,
            }
        }
        record
    }
}

/// Aggregate counts of the simulation after a single step.
///
/// A run produces one record per step; the sequence is the run's time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Simulation step (starting at 0).
    pub step: usize,

    pub susceptible: usize,
    pub exposed: usize,
    pub infected: usize,
    pub recovered: usize,
    pub dead: usize,
}

impl Record {
    /// Total number of agents counted.
    pub fn total(&self) -> usize {
        self.susceptible + self.exposed + self.infected + self.recovered + self.dead
    }

    /// Counts in the order S, E, I, R, D.
    pub fn counts(&self) -> [usize; 5] {
        [
            self.susceptible,
            self.exposed,
            self.infected,
            self.recovered,
            self.dead,
        ]
    }
}
