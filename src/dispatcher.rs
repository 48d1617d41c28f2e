use crate::config::Config;
use crate::error::Error;
use crate::job::{Decision, Job};
use crate::resources::Grid;

/// A dispatch policy: owns the workload source, turns jobs into placement
/// decisions, and observes the simulation through lifecycle hooks.
///
/// `assign` is the only mutator of job fate; the executor still verifies
/// the returned placement against the resource model before committing a
/// reservation. Every hook defaults to a no-op.
pub trait Dispatcher {
    fn name(&self) -> &'static str;

    /// Hand out up to `limit` jobs in ingestion order; negative means the
    /// whole workload.
    fn workload(&mut self, limit: i64) -> Result<Vec<Job>, Error>;

    /// Called once after the platform is built; policies may cache views
    /// (site orderings, priorities) here.
    fn provide_topology(&mut self, _grid: &Grid) {}

    fn assign(&mut self, job: &Job, grid: &Grid) -> Result<Decision, Error>;

    fn on_simulation_start(&mut self) {}
    fn on_simulation_end(&mut self) {}
    fn on_job_execution_start(&mut self, _job: &Job) {}
    fn on_job_execution_end(&mut self, _job: &Job) {}
    fn on_job_transfer_start(&mut self, _job: &Job) {}
    fn on_job_transfer_end(&mut self, _job: &Job) {}
    fn on_file_read_start(&mut self, _job: &Job, _file: &str) {}
    fn on_file_read_end(&mut self, _job: &Job, _file: &str) {}
    fn on_file_write_start(&mut self, _job: &Job, _file: &str) {}
    fn on_file_write_end(&mut self, _job: &Job, _file: &str) {}
    fn on_file_transfer_start(&mut self, _job: &Job, _file: &str) {}
    fn on_file_transfer_end(&mut self, _job: &Job, _file: &str) {}
}

pub type Factory = fn(&Config) -> Result<Box<dyn Dispatcher>, Error>;

/// Explicit, name-keyed policy registry. Built-in policies register at
/// construction; embedders may add their own factories before lookup.
pub struct Registry {
    factories: std::collections::HashMap<String, Factory>,
}

impl Registry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: std::collections::HashMap::new(),
        };
        registry.register("first-fit", crate::first_fit::factory);
        registry.register("weighted-score", crate::weighted::factory);
        registry.register("remote-policy", crate::remote::factory);
        registry
    }

    pub fn register(&mut self, name: &str, factory: Factory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, name: &str, cfg: &Config) -> Result<Box<dyn Dispatcher>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))?;
        factory(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["first-fit", "remote-policy", "weighted-score"]
        );
    }

    #[test]
    fn test_unknown_policy() {
        let registry = Registry::with_builtins();
        let cfg: Config = serde_json::from_str(
            r#"{
                "Grid_Name": "g",
                "Sites_Information": "s.json",
                "Sites_Connection_Information": "c.json",
                "Dispatcher_Plugin": "no-such-policy",
                "Output_DB": "out.csv",
                "Num_of_Jobs": -1
            }"#,
        )
        .unwrap();
        assert!(matches!(
            registry.create(&cfg.policy_name(), &cfg),
            Err(Error::UnknownPolicy(_))
        ));
    }
}
