use crate::activity::{self, ActivityTag, JobDag};
use crate::engine::Engine;
use crate::error::Error;
use crate::files::FileRegistry;
use crate::job::{Job, JobId};
use crate::resources::{Grid, HostId};

/// One worker per host, consuming the host's job queue.
///
/// In the cooperative model the worker does not spin on its own: the
/// executor posts job messages and polls the queue at its suspension
/// points. On each poll the worker builds the activity graph for every
/// queued job and submits it to the engine; completions flow back to the
/// executor as events, never through the worker.
#[derive(Debug)]
pub struct HostWorker {
    pub host: HostId,
    queue: std::collections::VecDeque<JobId>,
}

impl HostWorker {
    pub fn new(host: HostId) -> Self {
        Self {
            host,
            queue: std::collections::VecDeque::new(),
        }
    }

    pub fn post(&mut self, job: JobId) {
        log::debug!("job {job} queued to host worker #{}", self.host.0);
        self.queue.push_back(job);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Consume every queued job message, building and starting its
    /// activity graph.
    pub fn run_once(
        &mut self,
        jobs: &std::collections::HashMap<JobId, Job>,
        grid: &Grid,
        registry: &FileRegistry,
        engine: &mut Engine<ActivityTag>,
    ) -> Result<Vec<(JobId, JobDag)>, Error> {
        let mut built = vec![];
        while let Some(id) = self.queue.pop_front() {
            let job = jobs
                .get(&id)
                .ok_or_else(|| Error::Workload(format!("unknown job {id} on host queue")))?;
            let dag = activity::build(job, grid, registry, engine)?;
            built.push((id, dag));
        }
        Ok(built)
    }
}
