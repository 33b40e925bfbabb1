use crate::model::DiseaseState;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand::distr::weighted::{Error as WeightedError, WeightedIndex};

enum PoolDist {
    Empty,
    Uniform,
    Weighted(WeightedIndex<f64>),
}

/// Agents that can be drawn as contacts during one step.
///
/// Built from a snapshot of the states at the start of the step, so
/// transitions made while sampling do not change who can be contacted.
pub struct ContactPool {
    i_agt_vec: Vec<usize>,
    dist: PoolDist,
}

impl ContactPool {
    /// Build the pool of susceptible and exposed agents.
    ///
    /// Agents are weighted by their mixing propensity. If every candidate has
    /// zero weight the pool falls back to uniform sampling.
    pub fn new(states: &[DiseaseState], mixing: impl Fn(usize) -> f64) -> Result<Self> {
        let i_agt_vec: Vec<usize> = states
            .iter()
            .enumerate()
            .filter(|(_, state)| state.is_contactable())
            .map(|(i_agt, _)| i_agt)
            .collect();

        if i_agt_vec.is_empty() {
            return Ok(Self {
                i_agt_vec,
                dist: PoolDist::Empty,
            });
        }

        let weights = i_agt_vec.iter().map(|&i_agt| mixing(i_agt));
        let dist = match WeightedIndex::new(weights) {
            Ok(dist) => PoolDist::Weighted(dist),
            Err(WeightedError::InsufficientNonZero) => PoolDist::Uniform,
            Err(error) => {
                return Err(error).context("failed to build contact weights");
            }
        };

        Ok(Self { i_agt_vec, dist })
    }

    pub fn len(&self) -> usize {
        self.i_agt_vec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i_agt_vec.is_empty()
    }

    /// Draw one contact (an index into the population), or `None` if the pool is empty.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<usize> {
        match &self.dist {
            PoolDist::Empty => None,
            PoolDist::Uniform => self.i_agt_vec.choose(rng).copied(),
            PoolDist::Weighted(dist) => Some(self.i_agt_vec[dist.sample(rng)]),
        }
    }

    /// Draw `n_contacts` contacts independently, with replacement.
    pub fn sample_many<R: Rng + ?Sized>(&self, rng: &mut R, n_contacts: usize) -> Vec<usize> {
        if self.is_empty() {
            return Vec::new();
        }
        (0..n_contacts).filter_map(|_| self.sample(rng)).collect()
    }
}
