use crate::resources::{DiskId, HostId, SiteId};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Pending,
    Assigned,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }

    /// Legal forward transitions. A job never regresses.
    fn may_become(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Created, Assigned | Pending | Failed) => true,
            (Pending, Assigned | Pending | Failed) => true,
            (Assigned, Running | Failed) => true,
            (Running, Finished | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                JobStatus::Created => "created",
                JobStatus::Pending => "pending",
                JobStatus::Assigned => "assigned",
                JobStatus::Running => "running",
                JobStatus::Finished => "finished",
                JobStatus::Failed => "failed",
            }
        )
    }
}

/// Where an assigned job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub site: SiteId,
    pub host: HostId,
    pub disk: DiskId,
}

/// Outcome of one `assign` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Assigned(Placement),
    Pending,
    Failed,
}

/// Simulated-clock instants of a job's milestones, seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamps {
    pub enqueue: Option<f64>,
    pub assign: Option<f64>,
    pub transfer_done: Option<f64>,
    pub exec_start: Option<f64>,
    pub exec_done: Option<f64>,
}

/// One input file as the workload declares it; size and locations are
/// filled in from the file registry before dispatch.
#[derive(Debug, Clone, Default)]
pub struct InputFile {
    pub size: u64,
    pub locations: std::collections::BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub priority: i32,
    pub cores: u32,
    /// Explicit flops amount; 0 means derive one from the placement site's
    /// per-core throughput and `cpu_consumption_time` at assignment.
    pub flops: f64,
    pub cpu_consumption_time: f64,
    /// Site the workload submitted this job to, if any.
    pub submit_site: Option<String>,
    pub input_files: std::collections::BTreeMap<String, InputFile>,
    pub output_files: std::collections::BTreeMap<String, u64>,

    pub status: JobStatus,
    pub placement: Option<Placement>,
    pub retries: u32,
    pub times: Timestamps,
    pub io_read_time: f64,
    pub io_write_time: f64,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            priority: 0,
            cores: 0,
            flops: 0.0,
            cpu_consumption_time: 0.0,
            submit_site: None,
            input_files: std::collections::BTreeMap::new(),
            output_files: std::collections::BTreeMap::new(),
            status: JobStatus::Created,
            placement: None,
            retries: 0,
            times: Timestamps::default(),
            io_read_time: 0.0,
            io_write_time: 0.0,
        }
    }

    pub fn total_input_bytes(&self) -> u64 {
        self.input_files.values().map(|f| f.size).sum()
    }

    pub fn total_output_bytes(&self) -> u64 {
        self.output_files.values().sum()
    }

    /// Bytes reserved on the placement disk for the job's lifetime.
    pub fn total_bytes(&self) -> u64 {
        self.total_input_bytes() + self.total_output_bytes()
    }

    pub fn set_status(&mut self, next: JobStatus) {
        debug_assert!(
            self.status.may_become(next),
            "job {}: illegal transition {} -> {}",
            self.id,
            self.status,
            next
        );
        if self.status != next {
            log::debug!("job {}: {} -> {}", self.id, self.status, next);
        }
        self.status = next;
    }
}

/// Stable dispatch order: priority descending, then job id ascending.
pub fn sort_workload(jobs: &mut [Job]) {
    jobs.sort_by_key(|j| (std::cmp::Reverse(j.priority), j.id));
}
