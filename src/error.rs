/// Error kinds surfaced by the simulator core.
///
/// Placement shortfalls (`ResourceInsufficient`) and inconclusive policy
/// answers are recovered by demoting the job to pending; `PolicyFailed` and
/// `TopologyMissing` are terminal for the job only; registry violations and
/// an unreachable decision server abort the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not enough resources on host {host}: {reason}")]
    ResourceInsufficient { host: String, reason: String },

    #[error("policy declared job {0} unplaceable")]
    PolicyFailed(u64),

    #[error("placement names unknown topology: {0}")]
    TopologyMissing(String),

    #[error("file {0} is not registered anywhere")]
    FileMissing(String),

    #[error("file {file} is not registered at site {site}")]
    FileMissingAt { file: String, site: String },

    #[error("unknown site {0}")]
    UnknownSite(String),

    #[error("site {site} storage exhausted: {needed} B needed, {remaining} B left")]
    OutOfStorage {
        site: String,
        needed: u64,
        remaining: u64,
    },

    #[error("file {file} already exists at {site} with size {have} B, got {got} B")]
    FileConflict {
        file: String,
        site: String,
        have: u64,
        got: u64,
    },

    #[error("job {0} has no placement yet")]
    NotAssigned(u64),

    #[error("policy protocol error: {0}")]
    Protocol(String),

    #[error("cannot reach decision server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no dispatch policy registered under {0:?}")]
    UnknownPolicy(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("workload: {0}")]
    Workload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that demote the affected job to pending instead of
    /// terminating it or the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceInsufficient { .. } | Error::Protocol(_)
        )
    }
}
