use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::job::{Decision, Job, Placement};
use crate::resources::{Grid, SiteId};
use crate::workload::WorkloadSource;

/// First-fit placement: walk the hosts of a site in insertion order and
/// take the first one with enough free cores and a disk that can hold the
/// job's input and output bytes.
///
/// A job that names a submission site is confined to it; an unknown site
/// name fails the job. Jobs without one scan every site in insertion
/// order.
pub struct FirstFit {
    source: WorkloadSource,
}

pub fn factory(cfg: &Config) -> Result<Box<dyn Dispatcher>, Error> {
    Ok(Box::new(FirstFit {
        source: WorkloadSource::from_config(cfg)?,
    }))
}

impl FirstFit {
    pub fn new(source: WorkloadSource) -> Self {
        Self { source }
    }

    fn fit_in_site(grid: &Grid, site: SiteId, job: &Job) -> Option<Placement> {
        let need = job.total_bytes();
        for host_id in grid.site(site).hosts() {
            let host = grid.host(*host_id);
            if host.cores_available < job.cores {
                continue;
            }
            let disk = host
                .disks()
                .iter()
                .find(|d| grid.disk(**d).free_bytes >= need);
            if let Some(disk) = disk {
                return Some(Placement {
                    site,
                    host: *host_id,
                    disk: *disk,
                });
            }
        }
        None
    }
}

impl Dispatcher for FirstFit {
    fn name(&self) -> &'static str {
        "first-fit"
    }

    fn workload(&mut self, limit: i64) -> Result<Vec<Job>, Error> {
        Ok(self.source.take(limit))
    }

    fn assign(&mut self, job: &Job, grid: &Grid) -> Result<Decision, Error> {
        if let Some(site_name) = &job.submit_site {
            let Some(site) = grid.site_by_name(site_name) else {
                log::warn!("job {}: unknown submission site {site_name}", job.id);
                return Ok(Decision::Failed);
            };
            return Ok(match Self::fit_in_site(grid, site, job) {
                Some(placement) => Decision::Assigned(placement),
                None => Decision::Pending,
            });
        }

        for site in grid.compute_sites() {
            if let Some(placement) = Self::fit_in_site(grid, site, job) {
                return Ok(Decision::Assigned(placement));
            }
        }
        Ok(Decision::Pending)
    }
}
