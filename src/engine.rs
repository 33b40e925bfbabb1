use crate::config::{Config, InitConfig, InvalidConfiguration};
use crate::contact::ContactPool;
use crate::model::{
    Agent, DiseaseState, MAX_TIME_EXPOSED, MAX_TIME_INFECTED, MIN_TIME_EXPOSED, Population,
    Record,
};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Bernoulli, Binomial, Uniform};

/// Simulation engine.
///
/// Holds the configuration, current population, and random number generator,
/// and provides methods to initialize and run a simulation.
pub struct Engine {
    cfg: Config,
    pop: Population,
    rng: ChaCha12Rng,
}

impl Engine {
    /// Create a new `Engine` with the given configuration and a random initial population.
    ///
    /// The configuration is validated before anything is generated.
    pub fn generate_initial_condition(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let mut rng = match cfg.run.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };

        let pop = generate_population(&cfg.init, &mut rng)
            .context("failed to generate population")?;

        Ok(Self { cfg, pop, rng })
    }

    /// Perform `n_steps` steps and return the per-step counts.
    pub fn run_simulation(&mut self) -> Result<Vec<Record>> {
        let n_steps = self.cfg.run.n_steps;
        let steps_per_report = (n_steps / 10).max(1);

        let mut records = Vec::with_capacity(n_steps);
        for i_step in 0..n_steps {
            self.perform_step()
                .with_context(|| format!("failed to perform step {i_step}"))?;

            let record = self.pop.record(i_step);
            log::debug!("{record:?}");
            records.push(record);

            if (i_step + 1) % steps_per_report == 0 || i_step + 1 == n_steps {
                let progress = 100.0 * (i_step + 1) as f64 / n_steps as f64;
                log::info!("completed {progress:06.2}%");
            }
        }

        Ok(records)
    }

    fn perform_step(&mut self) -> Result<()> {
        // Expose susceptible agents through weighted contacts.
        self.expose_susceptibles()
            .context("failed to expose susceptible agents")?;

        // Advance exposed and infected agents.
        self.progress_disease()
            .context("failed to progress disease")?;

        Ok(())
    }

    fn expose_susceptibles(&mut self) -> Result<()> {
        // Every decision in this pass reads the states at the start of the step.
        let states = self.pop.snapshot();

        let agt_vec = &mut self.pop.agt_vec;
        let pool = ContactPool::new(&states, |i_agt| agt_vec[i_agt].mixing())?;
        if pool.is_empty() {
            return Ok(());
        }
        log::trace!("contact pool size {}", pool.len());

        let max_mix = f64::from(self.cfg.model.max_mix);
        let s2e_dist = Bernoulli::new(self.cfg.model.s2e_prob)?;

        for (i_agt, &state) in states.iter().enumerate() {
            if state != DiseaseState::Susceptible {
                continue;
            }

            let n_contacts = count_contacts(agt_vec[i_agt].mixing(), max_mix);
            let i_cnt_vec = pool.sample_many(&mut self.rng, n_contacts);

            for i_cnt in i_cnt_vec {
                if states[i_cnt] != DiseaseState::Exposed {
                    continue;
                }
                if s2e_dist.sample(&mut self.rng) {
                    agt_vec[i_agt].state = DiseaseState::Exposed;
                    log::trace!("agent {} exposed", agt_vec[i_agt].id());
                    break;
                }
            }
        }

        Ok(())
    }

    fn progress_disease(&mut self) -> Result<()> {
        let e2i_dist = Bernoulli::new(self.cfg.model.e2i_prob)?;
        let i2d_prob = self.cfg.model.i2d_prob;
        let rng = &mut self.rng;
        let agt_vec = &mut self.pop.agt_vec;

        // Exposed agents that outlast the incubation window resolve on their own.
        for agt in agt_vec.iter_mut() {
            if agt.state == DiseaseState::Exposed {
                agt.time_exposed += 1;
                if agt.time_exposed > MAX_TIME_EXPOSED {
                    agt.state = DiseaseState::Recovered;
                }
            }
        }

        for agt in agt_vec.iter_mut() {
            if agt.state == DiseaseState::Exposed
                && agt.time_exposed > MIN_TIME_EXPOSED
                && e2i_dist.sample(rng)
            {
                agt.state = DiseaseState::Infected;
            }
        }

        for agt in agt_vec.iter_mut() {
            if agt.state == DiseaseState::Infected {
                agt.time_infected += 1;
                if agt.time_infected > MAX_TIME_INFECTED {
                    agt.state = DiseaseState::Recovered;
                }
            }
        }

        // Mortality is a per-step hazard, only faced before the infection times out.
        for agt in agt_vec.iter_mut() {
            if agt.state == DiseaseState::Infected && rng.random::<f64>() <= i2d_prob {
                agt.state = DiseaseState::Dead;
            }
        }

        Ok(())
    }
}

/// Number of contacts made in one step by an agent with the given mixing.
///
/// Rounds half to even and adds one, so every agent meets someone.
fn count_contacts(mixing: f64, max_mix: f64) -> usize {
    (mixing * max_mix).round_ties_even() as usize + 1
}

/// Generate the initial population.
///
/// The first `n_exposed` agents start exposed, the next `n_infected` start
/// infected, and the rest susceptible. Seeded dwell times are spread out so
/// the initial cohort does not progress in lockstep.
pub fn generate_population<R: Rng + ?Sized>(init: &InitConfig, rng: &mut R) -> Result<Population> {
    init.check().context(InvalidConfiguration)?;
    let n_seeded = init.n_exposed + init.n_infected;

    let mix_dist = Uniform::new(0.0, 1.0)?;
    let time_exposed_dist = Binomial::new(13, 0.5)?;
    let time_infected_dist = Binomial::new(12, 0.5)?;

    let mut agt_vec: Vec<Agent> = (0..init.n_agents)
        .map(|i_agt| Agent::new(i_agt + 1, mix_dist.sample(rng)))
        .collect();

    for agt in &mut agt_vec[..init.n_exposed] {
        agt.state = DiseaseState::Exposed;
        agt.time_exposed = time_exposed_dist.sample(rng) as u32 + 1;
    }

    for agt in &mut agt_vec[init.n_exposed..n_seeded] {
        agt.state = DiseaseState::Infected;
        agt.time_infected = time_infected_dist.sample(rng) as u32 + 1;
    }

    Ok(Population { agt_vec })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    impl Engine {
        fn from_population(cfg: Config, agt_vec: Vec<Agent>, seed: u64) -> Self {
            Self {
                cfg,
                pop: Population { agt_vec },
                rng: ChaCha12Rng::seed_from_u64(seed),
            }
        }

        fn population(&self) -> &Population {
            &self.pop
        }
    }

    fn run(cfg: Config) -> Vec<Record> {
        let mut engine = Engine::generate_initial_condition(cfg).expect("failed to build engine");
        engine.run_simulation().expect("failed to run simulation")
    }

    fn agent(id: usize, state: DiseaseState, time_exposed: u32, time_infected: u32) -> Agent {
        let mut agt = Agent::new(id, 0.5);
        agt.state = state;
        agt.time_exposed = time_exposed;
        agt.time_infected = time_infected;
        agt
    }

    #[test]
    fn population_is_seeded_in_order() {
        let init = InitConfig {
            n_agents: 50,
            n_exposed: 4,
            n_infected: 6,
        };
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let pop = generate_population(&init, &mut rng).expect("failed to generate population");

        assert_eq!(pop.agt_vec.len(), 50);
        for (i_agt, agt) in pop.agt_vec.iter().enumerate() {
            assert_eq!(agt.id(), i_agt + 1);
            assert!((0.0..1.0).contains(&agt.mixing()));
            match i_agt {
                0..4 => {
                    assert_eq!(agt.state, DiseaseState::Exposed);
                    assert!((1..=14).contains(&agt.time_exposed));
                    assert_eq!(agt.time_infected, 0);
                }
                4..10 => {
                    assert_eq!(agt.state, DiseaseState::Infected);
                    assert!((1..=13).contains(&agt.time_infected));
                    assert_eq!(agt.time_exposed, 0);
                }
                _ => {
                    assert_eq!(agt.state, DiseaseState::Susceptible);
                    assert_eq!((agt.time_exposed, agt.time_infected), (0, 0));
                }
            }
        }
    }

    #[test]
    fn population_rejects_invalid_sizes() {
        let mut rng = ChaCha12Rng::seed_from_u64(8);

        let init = InitConfig {
            n_agents: 3,
            n_exposed: 2,
            n_infected: 2,
        };
        let err = generate_population(&init, &mut rng).expect_err("E0 + I0 > N");
        assert!(err.downcast_ref::<InvalidConfiguration>().is_some());

        let init = InitConfig {
            n_agents: 0,
            n_exposed: 0,
            n_infected: 0,
        };
        let err = generate_population(&init, &mut rng).expect_err("N = 0");
        assert!(err.downcast_ref::<InvalidConfiguration>().is_some());

        let init = InitConfig {
            n_agents: 10,
            n_exposed: usize::MAX,
            n_infected: 1,
        };
        let err = generate_population(&init, &mut rng).expect_err("E0 + I0 overflows");
        assert!(err.downcast_ref::<InvalidConfiguration>().is_some());
    }

    #[test]
    fn invalid_config_fails_before_any_step() {
        let mut cfg = test_config();
        cfg.model.i2d_prob = 2.0;
        let err = Engine::generate_initial_condition(cfg)
            .err()
            .expect("engine should reject config");
        assert!(err.downcast_ref::<InvalidConfiguration>().is_some());
    }

    #[test]
    fn contact_count_rounds_half_to_even() {
        assert_eq!(count_contacts(0.0, 5.0), 1);
        assert_eq!(count_contacts(0.5, 5.0), 3);
        assert_eq!(count_contacts(0.3, 5.0), 3);
        assert_eq!(count_contacts(0.7, 5.0), 5);
        assert_eq!(count_contacts(1.0, 5.0), 6);
        assert_eq!(count_contacts(0.9, 0.0), 1);
    }

    #[test]
    fn reference_scenario_conserves_population() {
        let records = run(test_config());

        assert_eq!(records.len(), 25);
        for (i_step, record) in records.iter().enumerate() {
            assert_eq!(record.step, i_step);
            assert_eq!(record.total(), 100);
        }
        for pair in records.windows(2) {
            assert!(pair[1].recovered >= pair[0].recovered);
            assert!(pair[1].dead >= pair[0].dead);
        }
    }

    #[test]
    fn same_seed_gives_identical_runs() {
        let cfg = test_config();
        assert_eq!(run(cfg.clone()), run(cfg));
    }

    #[test]
    fn no_transmission_keeps_susceptibles() {
        let mut cfg = test_config();
        cfg.model.s2e_prob = 0.0;
        cfg.run.n_steps = 40;

        for record in run(cfg) {
            assert_eq!(record.susceptible, 95);
            assert!(record.exposed <= 2);
        }
    }

    #[test]
    fn no_progression_resolves_exposed_cohort() {
        let mut cfg = test_config();
        cfg.model.s2e_prob = 0.0;
        cfg.model.e2i_prob = 0.0;
        cfg.run.n_steps = 30;

        let records = run(cfg);
        for pair in records.windows(2) {
            assert!(pair[1].infected <= pair[0].infected);
        }
        for record in &records[14..] {
            assert_eq!(record.exposed, 0);
        }
    }

    #[test]
    fn no_progression_never_adds_infected() {
        let mut cfg = test_config();
        cfg.model.s2e_prob = 0.9;
        cfg.model.e2i_prob = 0.0;
        cfg.run.n_steps = 60;

        let records = run(cfg);
        assert!(records[0].infected <= 3);
        for pair in records.windows(2) {
            assert!(pair[1].infected <= pair[0].infected);
        }
    }

    #[test]
    fn no_exposed_source_means_no_transmission() {
        let mut cfg = test_config();
        cfg.model.s2e_prob = 1.0;
        cfg.init.n_exposed = 0;
        cfg.init.n_infected = 0;

        for record in run(cfg) {
            assert_eq!(record.susceptible, 100);
        }
    }

    #[test]
    fn single_exposed_agent_resolves() {
        let mut cfg = test_config();
        cfg.init = InitConfig {
            n_agents: 1,
            n_exposed: 1,
            n_infected: 0,
        };
        cfg.run.n_steps = 40;

        let records = run(cfg);
        for record in &records {
            assert_eq!(record.total(), 1);
            assert_eq!(record.susceptible, 0);
        }
        assert_eq!(records[14].exposed, 0);
        let last = records.last().expect("run should produce records");
        assert_eq!(last.recovered + last.dead, 1);
    }

    #[test]
    fn newly_exposed_agents_do_not_expose_others_in_same_step() {
        let mut cfg = test_config();
        cfg.model.max_mix = 100;
        cfg.model.s2e_prob = 1.0;
        cfg.model.e2i_prob = 0.0;

        let mut agt_vec = vec![Agent::new(1, 1.0)];
        agt_vec[0].state = DiseaseState::Exposed;
        agt_vec[0].time_exposed = 1;
        agt_vec.extend((2..=1000).map(|id| Agent::new(id, 1.0)));

        let mut engine = Engine::from_population(cfg, agt_vec, 9);
        engine.expose_susceptibles().expect("failed to expose");

        // Each susceptible draws 101 contacts and only the seeded agent can expose
        // them, so about 10% get exposed. A cascade would reach almost everyone.
        let record = engine.population().record(0);
        assert!(record.exposed > 1);
        assert!(record.exposed < 200, "{record:?}");
    }

    #[test]
    fn exposed_agents_time_out_or_progress() {
        let mut cfg = test_config();
        cfg.model.e2i_prob = 1.0;
        cfg.model.i2d_prob = 0.0;

        let agt_vec = vec![
            agent(1, DiseaseState::Exposed, 14, 0),
            agent(2, DiseaseState::Exposed, 3, 0),
            agent(3, DiseaseState::Exposed, 2, 0),
        ];
        let mut engine = Engine::from_population(cfg, agt_vec, 10);
        engine.progress_disease().expect("failed to progress disease");

        let agt_vec = &engine.population().agt_vec;
        assert_eq!(agt_vec[0].state, DiseaseState::Recovered);
        assert_eq!(agt_vec[1].state, DiseaseState::Infected);
        assert_eq!(agt_vec[1].time_infected, 1);
        assert_eq!(agt_vec[2].state, DiseaseState::Exposed);
        assert_eq!(agt_vec[2].time_exposed, 3);
    }

    #[test]
    fn infected_agents_recover_or_die() {
        let mut cfg = test_config();
        cfg.model.i2d_prob = 1.0;

        let agt_vec = vec![
            agent(1, DiseaseState::Infected, 0, 14),
            agent(2, DiseaseState::Infected, 0, 5),
            agent(3, DiseaseState::Recovered, 15, 0),
            agent(4, DiseaseState::Dead, 0, 3),
        ];
        let mut engine = Engine::from_population(cfg, agt_vec, 11);
        engine.progress_disease().expect("failed to progress disease");

        let states: Vec<_> = engine.population().snapshot();
        assert_eq!(
            states,
            [
                DiseaseState::Recovered,
                DiseaseState::Dead,
                DiseaseState::Recovered,
                DiseaseState::Dead,
            ]
        );
        assert_eq!(engine.population().agt_vec[3].time_infected, 3);
    }
}
