use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::job::{Decision, Job, Placement};
use crate::resources::{DiskId, Grid, SiteId};
use crate::workload::WorkloadSource;

/// Scoring weights. All default to 1.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub speed: f64,
    pub cores: f64,
    pub io: f64,
    pub storage: f64,
    pub disk: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            speed: 1.0,
            cores: 1.0,
            io: 1.0,
            storage: 1.0,
            disk: 1.0,
        }
    }
}

const BW_SCALE: f64 = 10.0;
const STORAGE_SCALE: f64 = 1e10;

/// Weighted-score placement.
///
/// Sites are ranked once, when the topology arrives, by the average host
/// quality `speed/1e8 * W_speed + cores * W_cores`. Per job, sites are
/// visited in that order and the first site holding any feasible host
/// yields the argmax of
///
/// ```text
///   host_score = speed/1e8 * W_speed + cores_available * W_cores
///   disk_score = (read_bw + write_bw)/10 * W_io + free/1e10 * W_storage
///   total      = host_score + best_disk_score * W_disk
/// ```
///
/// Hosts whose disks cannot hold the job's bytes are infeasible, never
/// scored. Ties break on the lexicographically least host name.
pub struct WeightedScore {
    source: WorkloadSource,
    weights: Weights,
    site_order: Vec<SiteId>,
}

pub fn factory(cfg: &Config) -> Result<Box<dyn Dispatcher>, Error> {
    Ok(Box::new(WeightedScore::new(
        WorkloadSource::from_config(cfg)?,
        Weights::default(),
    )))
}

impl WeightedScore {
    pub fn new(source: WorkloadSource, weights: Weights) -> Self {
        Self {
            source,
            weights,
            site_order: vec![],
        }
    }

    fn site_priority(&self, grid: &Grid, site: SiteId) -> i64 {
        let hosts = grid.site(site).hosts();
        if hosts.is_empty() {
            return 0;
        }
        let sum: f64 = hosts
            .iter()
            .map(|h| {
                let host = grid.host(*h);
                host.speed / 1e8 * self.weights.speed + host.total_cores as f64 * self.weights.cores
            })
            .sum();
        (sum / hosts.len() as f64).round() as i64
    }

    fn best_disk(&self, grid: &Grid, disks: &[DiskId], need: u64) -> Option<(DiskId, f64)> {
        let mut best: Option<(DiskId, f64)> = None;
        for id in disks {
            let d = grid.disk(*id);
            if d.free_bytes < need {
                continue;
            }
            let score = (d.read_bw + d.write_bw) / BW_SCALE * self.weights.io
                + d.free_bytes as f64 / STORAGE_SCALE * self.weights.storage;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((*id, score));
            }
        }
        best
    }

    fn best_in_site(&self, grid: &Grid, site: SiteId, job: &Job) -> Option<Placement> {
        let need = job.total_bytes();
        let mut best: Option<(f64, &str, Placement)> = None;
        for host_id in grid.site(site).hosts() {
            let host = grid.host(*host_id);
            if host.cores_available < job.cores {
                continue;
            }
            let Some((disk, disk_score)) = self.best_disk(grid, host.disks(), need) else {
                continue;
            };
            let host_score = host.speed / 1e8 * self.weights.speed
                + host.cores_available as f64 * self.weights.cores;
            let total = host_score + disk_score * self.weights.disk;

            let better = match &best {
                None => true,
                Some((score, name, _)) => {
                    total > *score || (total == *score && host.name.as_str() < *name)
                }
            };
            if better {
                best = Some((
                    total,
                    host.name.as_str(),
                    Placement {
                        site,
                        host: *host_id,
                        disk,
                    },
                ));
            }
        }
        best.map(|(_, _, placement)| placement)
    }
}

impl Dispatcher for WeightedScore {
    fn name(&self) -> &'static str {
        "weighted-score"
    }

    fn workload(&mut self, limit: i64) -> Result<Vec<Job>, Error> {
        Ok(self.source.take(limit))
    }

    fn provide_topology(&mut self, grid: &Grid) {
        let mut ranked: Vec<(i64, String, SiteId)> = grid
            .compute_sites()
            .map(|s| (self.site_priority(grid, s), grid.site(s).name.clone(), s))
            .collect();
        // priority descending, name ascending for ties
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (priority, name, _) in &ranked {
            log::debug!("site {name} ranked with priority {priority}");
        }
        self.site_order = ranked.into_iter().map(|(_, _, s)| s).collect();
    }

    fn assign(&mut self, job: &Job, grid: &Grid) -> Result<Decision, Error> {
        for site in &self.site_order {
            if let Some(placement) = self.best_in_site(grid, *site, job) {
                return Ok(Decision::Assigned(placement));
            }
        }
        Ok(Decision::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        let mut grid = Grid::new("g");
        // SLOW site: one weak host
        let slow = grid.add_site("SLOW", 0, 10.0, 1_000_000);
        let hs = grid.add_host(slow, "SLOW_cpu-0", 1e8, 2);
        grid.add_disk(hs, "d", "/d/", 1e8, 1e8, 1_000_000);
        // FAST site: two hosts, one clearly better disk
        let fast = grid.add_site("FAST", 0, 100.0, 1_000_000);
        let h0 = grid.add_host(fast, "FAST_cpu-0", 2e9, 8);
        grid.add_disk(h0, "small", "/s/", 1e7, 1e7, 500);
        grid.add_disk(h0, "big", "/b/", 2e8, 2e8, 1_000_000);
        let h1 = grid.add_host(fast, "FAST_cpu-1", 2e9, 8);
        grid.add_disk(h1, "d", "/d/", 1e8, 1e8, 1_000_000);
        grid
    }

    fn dispatcher(grid: &Grid) -> WeightedScore {
        let mut d = WeightedScore::new(WorkloadSource::preloaded(vec![]), Weights::default());
        d.provide_topology(grid);
        d
    }

    #[test]
    fn test_high_priority_site_first() {
        let grid = grid();
        let d = dispatcher(&grid);
        let names: Vec<&str> = d
            .site_order
            .iter()
            .map(|s| grid.site(*s).name.as_str())
            .collect();
        assert_eq!(names, vec!["FAST", "SLOW"]);
    }

    #[test]
    fn test_argmax_picks_best_disk_and_host() {
        let grid = grid();
        let mut d = dispatcher(&grid);
        let mut job = Job::new(1);
        job.cores = 4;
        job.output_files.insert("o".into(), 1_000);

        match d.assign(&job, &grid).unwrap() {
            Decision::Assigned(p) => {
                assert_eq!(grid.site(p.site).name, "FAST");
                // FAST_cpu-0 wins through its high-bandwidth disk; the
                // undersized disk is never scored
                assert_eq!(grid.host(p.host).name, "FAST_cpu-0");
                assert_eq!(grid.disk(p.disk).name, "big");
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_falls_through_to_lower_priority_site() {
        let mut grid = grid();
        let mut d = dispatcher(&grid);
        // saturate FAST
        for host in ["FAST_cpu-0", "FAST_cpu-1"] {
            let h = grid.host_by_name(host).unwrap();
            let disk = grid.host(h).disks()[0];
            grid.reserve(h, 8, disk, 0, 99).unwrap();
        }
        let mut job = Job::new(1);
        job.cores = 2;
        match d.assign(&job, &grid).unwrap() {
            Decision::Assigned(p) => assert_eq!(grid.site(p.site).name, "SLOW"),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_disk_less_host_is_infeasible() {
        let mut grid = Grid::new("g");
        let site = grid.add_site("A", 0, 1.0, 0);
        grid.add_host(site, "A_cpu-0", 1e9, 8);
        let mut d = WeightedScore::new(WorkloadSource::preloaded(vec![]), Weights::default());
        d.provide_topology(&grid);

        let mut job = Job::new(1);
        job.cores = 1;
        assert_eq!(d.assign(&job, &grid).unwrap(), Decision::Pending);
    }
}
