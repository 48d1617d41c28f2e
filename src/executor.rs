use crate::activity::{ActivityKind, ActivityTag, JobDag};
use crate::dispatcher::Dispatcher;
use crate::engine::{Engine, Event};
use crate::error::Error;
use crate::files::FileRegistry;
use crate::job::{sort_workload, Decision, JobId, JobStatus, Placement};
use crate::resources::Grid;
use crate::stats::{JobRecord, RunReport, StatsBook};
use crate::worker::HostWorker;

/// The dispatch loop.
///
/// Ingests the workload, asks the policy for one placement at a time,
/// verifies and commits reservations against the resource model, posts
/// assigned jobs to their host workers, and consumes engine events to
/// advance job state. Jobs the policy cannot place wait in a pending list
/// and are re-attempted whenever an execution completes and frees
/// resources; the run ends when no work is in flight and nothing pending
/// can ever be placed.
pub struct Executor {
    grid: Grid,
    registry: FileRegistry,
    dispatcher: Box<dyn Dispatcher>,
    engine: Engine<ActivityTag>,
    jobs: std::collections::HashMap<JobId, crate::job::Job>,
    dags: std::collections::HashMap<JobId, JobDag>,
    transfers_left: std::collections::HashMap<JobId, usize>,
    transfer_seen: std::collections::HashSet<JobId>,
    workers: Vec<HostWorker>,
    pending: Vec<JobId>,
    stats: StatsBook,
    records: Vec<JobRecord>,
    finished: u64,
    failed: u64,
}

impl Executor {
    pub fn new(grid: Grid, registry: FileRegistry, dispatcher: Box<dyn Dispatcher>) -> Self {
        let workers = (0..grid.num_hosts())
            .map(|i| HostWorker::new(crate::resources::HostId(i)))
            .collect();
        Self {
            grid,
            registry,
            dispatcher,
            engine: Engine::new(),
            jobs: std::collections::HashMap::new(),
            dags: std::collections::HashMap::new(),
            transfers_left: std::collections::HashMap::new(),
            transfer_seen: std::collections::HashSet::new(),
            workers,
            pending: vec![],
            stats: StatsBook::default(),
            records: vec![],
            finished: 0,
            failed: 0,
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub fn job(&self, id: JobId) -> Option<&crate::job::Job> {
        self.jobs.get(&id)
    }

    pub fn stats(&self) -> &StatsBook {
        &self.stats
    }

    /// Run the whole simulation and return the report.
    pub fn run(&mut self, num_jobs: i64) -> Result<RunReport, Error> {
        self.dispatcher.provide_topology(&self.grid);
        self.dispatcher.on_simulation_start();

        let mut batch = self.dispatcher.workload(num_jobs)?;
        sort_workload(&mut batch);
        log::info!("ingested {} jobs", batch.len());

        for mut job in batch {
            job.times.enqueue = Some(self.engine.now());
            self.registry.resolve_inputs(&mut job)?;
            let id = job.id;
            self.jobs.insert(id, job);
            self.try_dispatch(id)?;
        }
        self.drain_workers()?;

        while let Some(event) = self.engine.advance() {
            self.handle_event(event)?;
            self.drain_workers()?;
        }

        // nothing in flight anymore: leftover pending jobs can never be
        // unblocked by a release
        let unplaceable = std::mem::take(&mut self.pending);
        for id in unplaceable {
            log::warn!("job {id} can never be placed on this platform");
            self.fail(id);
        }

        self.dispatcher.on_simulation_end();
        let report = RunReport {
            simulated_time: self.engine.now(),
            finished: self.finished,
            failed: self.failed,
            records: std::mem::take(&mut self.records),
        };
        Ok(report)
    }

    /// One `assign` call for one job, serialized by construction.
    fn try_dispatch(&mut self, id: JobId) -> Result<(), Error> {
        let decision = self.dispatcher.assign(&self.jobs[&id], &self.grid)?;
        match decision {
            Decision::Assigned(placement) => match self.commit(id, placement) {
                Ok(()) => {}
                Err(Error::ResourceInsufficient { host, reason }) => {
                    log::debug!("job {id}: placement on {host} infeasible ({reason})");
                    self.park(id);
                }
                Err(Error::TopologyMissing(what)) => {
                    log::warn!("job {id}: policy placement names unknown topology: {what}");
                    self.fail(id);
                }
                Err(e) => return Err(e),
            },
            Decision::Pending => self.park(id),
            Decision::Failed => {
                log::debug!("job {id}: policy declared it unplaceable");
                self.fail(id);
            }
        }
        Ok(())
    }

    /// Verify a placement against the resource model, take the
    /// reservation, and hand the job to its host worker.
    fn commit(&mut self, id: JobId, placement: Placement) -> Result<(), Error> {
        self.grid
            .check_placement(placement.site, placement.host, placement.disk)?;
        let (cores, bytes) = {
            let job = &self.jobs[&id];
            (job.cores, job.total_bytes())
        };
        self.grid
            .reserve(placement.host, cores, placement.disk, bytes, id)?;

        let now = self.engine.now();
        let site_name = self.grid.site(placement.site).name.clone();
        let gflops = self.grid.site(placement.site).gflops_per_core;
        if let Some(job) = self.jobs.get_mut(&id) {
            if job.flops <= 0.0 {
                job.flops = gflops * job.cpu_consumption_time * job.cores as f64;
            }
            let was_pending = job.status == JobStatus::Pending;
            job.set_status(JobStatus::Assigned);
            job.placement = Some(placement);
            job.times.assign = Some(now);
            self.stats.on_assigned(&site_name, was_pending);
        }

        log::debug!(
            "job {id} assigned to {} at t={now}",
            self.grid.host(placement.host).name
        );
        self.workers[placement.host.0].post(id);
        Ok(())
    }

    fn park(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            if job.status != JobStatus::Pending {
                let site = job.submit_site.clone();
                job.set_status(JobStatus::Pending);
                self.stats.on_pending(site.as_deref());
            }
        }
        self.pending.push(id);
    }

    fn fail(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get_mut(&id) {
            let was_pending = job.status == JobStatus::Pending;
            let site = job.submit_site.clone();
            job.set_status(JobStatus::Failed);
            self.stats.on_failed(site.as_deref(), was_pending);
        }
        self.failed += 1;
        self.record(id);
    }

    /// Poll every host worker once; newly posted jobs get their activity
    /// graphs built and started.
    fn drain_workers(&mut self) -> Result<(), Error> {
        for i in 0..self.workers.len() {
            if self.workers[i].is_empty() {
                continue;
            }
            let built =
                self.workers[i].run_once(&self.jobs, &self.grid, &self.registry, &mut self.engine)?;
            for (id, dag) in built {
                self.transfers_left.insert(id, dag.transfers.len());
                self.dags.insert(id, dag);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: Event<ActivityTag>) -> Result<(), Error> {
        match event {
            Event::Started { tag, at, .. } => self.on_started(tag, at),
            Event::Completed {
                tag, started, at, ..
            } => self.on_completed(tag, started, at)?,
        }
        Ok(())
    }

    fn on_started(&mut self, tag: ActivityTag, at: f64) {
        let id = tag.job;
        match tag.kind {
            ActivityKind::Transfer { file, .. } => {
                if self.transfer_seen.insert(id) {
                    self.dispatcher.on_job_transfer_start(&self.jobs[&id]);
                }
                self.dispatcher.on_file_transfer_start(&self.jobs[&id], &file);
            }
            ActivityKind::Read { file } => {
                self.dispatcher.on_file_read_start(&self.jobs[&id], &file);
            }
            ActivityKind::Exec => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.set_status(JobStatus::Running);
                    job.times.exec_start = Some(at);
                }
                self.dispatcher.on_job_execution_start(&self.jobs[&id]);
            }
            ActivityKind::Write { file, .. } => {
                self.dispatcher.on_file_write_start(&self.jobs[&id], &file);
            }
        }
    }

    fn on_completed(&mut self, tag: ActivityTag, started: f64, at: f64) -> Result<(), Error> {
        let id = tag.job;
        match tag.kind {
            ActivityKind::Transfer { file, size, dst, .. } => {
                self.registry.create(&file, size, &dst)?;
                self.dispatcher.on_file_transfer_end(&self.jobs[&id], &file);
                if let Some(left) = self.transfers_left.get_mut(&id) {
                    *left = left.saturating_sub(1);
                    if *left == 0 {
                        if let Some(job) = self.jobs.get_mut(&id) {
                            job.times.transfer_done = Some(at);
                        }
                        self.dispatcher.on_job_transfer_end(&self.jobs[&id]);
                    }
                }
            }
            ActivityKind::Read { file } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.io_read_time += at - started;
                }
                self.dispatcher.on_file_read_end(&self.jobs[&id], &file);
            }
            ActivityKind::Exec => {
                let (placement, cores, bytes) = {
                    let job = self
                        .jobs
                        .get_mut(&id)
                        .ok_or_else(|| Error::Workload(format!("exec end for unknown job {id}")))?;
                    job.set_status(JobStatus::Finished);
                    job.times.exec_done = Some(at);
                    (
                        job.placement.ok_or(Error::NotAssigned(id))?,
                        job.cores,
                        job.total_bytes(),
                    )
                };
                self.grid
                    .release(placement.host, cores, placement.disk, bytes, id);
                let site_name = self.grid.site(placement.site).name.clone();
                self.stats.on_finished(&site_name);
                self.finished += 1;
                self.dispatcher.on_job_execution_end(&self.jobs[&id]);
                self.record(id);
                // freed cores and bytes may unblock pending jobs
                self.retry_pending()?;
            }
            ActivityKind::Write { file, size, site } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.io_write_time += at - started;
                }
                self.registry.create(&file, size, &site)?;
                self.dispatcher.on_file_write_end(&self.jobs[&id], &file);
            }
        }
        Ok(())
    }

    /// Re-attempt every pending job, preserving arrival order within each
    /// priority class.
    fn retry_pending(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let waiting = std::mem::take(&mut self.pending);
        log::debug!("retrying {} pending jobs", waiting.len());
        for id in waiting {
            if self.jobs.get(&id).map_or(true, |j| j.status.is_terminal()) {
                continue;
            }
            if let Some(job) = self.jobs.get_mut(&id) {
                job.retries += 1;
            }
            self.try_dispatch(id)?;
        }
        Ok(())
    }

    fn record(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let names = job.placement.map(|p| {
            (
                self.grid.site(p.site).name.clone(),
                self.grid.host(p.host).name.clone(),
                self.grid.disk(p.disk).name.clone(),
            )
        });
        self.records.push(JobRecord::from_job(job, names));
    }
}
