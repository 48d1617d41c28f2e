use crate::error::Error;

/// Handle into [`Grid::sites`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub usize);

/// Handle into [`Grid::hosts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub usize);

/// Handle into [`Grid::disks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskId(pub usize);

#[derive(Debug)]
pub struct Disk {
    pub name: String,
    pub mount: String,
    pub host: HostId,
    /// Read bandwidth, bytes/s.
    pub read_bw: f64,
    /// Write bandwidth, bytes/s.
    pub write_bw: f64,
    pub free_bytes: u64,
}

#[derive(Debug)]
pub struct Host {
    pub name: String,
    pub site: SiteId,
    /// Processing speed, flops/s.
    pub speed: f64,
    pub total_cores: u32,
    pub cores_available: u32,
    pub running_jobs: std::collections::HashSet<u64>,
    disks: Vec<DiskId>,
}

impl Host {
    pub fn disks(&self) -> &[DiskId] {
        &self.disks
    }
}

#[derive(Debug)]
pub struct Site {
    pub name: String,
    pub priority: i64,
    /// Per-core throughput hint, gigaflops. Used to derive a flops amount
    /// for jobs that only report a CPU consumption time.
    pub gflops_per_core: f64,
    pub total_storage_bytes: u64,
    /// Number of hosts currently running at least one job. Advisory.
    pub cpus_in_use: u32,
    hosts: Vec<HostId>,
}

impl Site {
    pub fn hosts(&self) -> &[HostId] {
        &self.hosts
    }
}

/// Inter-site link parameters, bytes/s and seconds.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub bandwidth: f64,
    pub latency: f64,
}

/// Deterministic matrices over the grid, used as policy features.
///
/// Sites are sorted lexicographically by name, hosts likewise within each
/// site; rows are padded to the widest site with zeros so the layout is
/// stable regardless of map iteration order.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub site_order: Vec<SiteId>,
    pub total_cores: Vec<Vec<i32>>,
    pub available_cores: Vec<Vec<i32>>,
    pub core_speeds: Vec<Vec<f64>>,
}

impl Snapshot {
    pub fn num_sites(&self) -> usize {
        self.site_order.len()
    }

    pub fn row_width(&self) -> usize {
        self.total_cores.first().map_or(0, Vec::len)
    }
}

/// In-memory mirror of the grid topology with live core and byte counters.
///
/// Sites, hosts and disks live in arenas and are addressed by index
/// handles; jobs carry handles rather than names once placed.
#[derive(Debug)]
pub struct Grid {
    pub name: String,
    sites: Vec<Site>,
    hosts: Vec<Host>,
    disks: Vec<Disk>,
    site_index: std::collections::HashMap<String, SiteId>,
    host_index: std::collections::HashMap<String, HostId>,
    links: std::collections::HashMap<(SiteId, SiteId), Link>,
    job_server: Option<SiteId>,
}

impl Grid {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sites: vec![],
            hosts: vec![],
            disks: vec![],
            site_index: std::collections::HashMap::new(),
            host_index: std::collections::HashMap::new(),
            links: std::collections::HashMap::new(),
            job_server: None,
        }
    }

    pub fn add_site(
        &mut self,
        name: impl Into<String>,
        priority: i64,
        gflops_per_core: f64,
        total_storage_bytes: u64,
    ) -> SiteId {
        let name = name.into();
        let id = SiteId(self.sites.len());
        self.sites.push(Site {
            name: name.clone(),
            priority,
            gflops_per_core,
            total_storage_bytes,
            cpus_in_use: 0,
            hosts: vec![],
        });
        self.site_index.insert(name, id);
        id
    }

    /// Register the pseudo-site hosting the job server. It owns no compute
    /// and is excluded from placement and feature views.
    pub fn add_job_server(&mut self, name: impl Into<String>) -> SiteId {
        let id = self.add_site(name, 0, 0.0, 0);
        self.job_server = Some(id);
        id
    }

    pub fn add_host(
        &mut self,
        site: SiteId,
        name: impl Into<String>,
        speed: f64,
        cores: u32,
    ) -> HostId {
        let name = name.into();
        let id = HostId(self.hosts.len());
        self.hosts.push(Host {
            name: name.clone(),
            site,
            speed,
            total_cores: cores,
            cores_available: cores,
            running_jobs: std::collections::HashSet::new(),
            disks: vec![],
        });
        self.sites[site.0].hosts.push(id);
        self.host_index.insert(name, id);
        id
    }

    pub fn add_disk(
        &mut self,
        host: HostId,
        name: impl Into<String>,
        mount: impl Into<String>,
        read_bw: f64,
        write_bw: f64,
        capacity_bytes: u64,
    ) -> DiskId {
        let id = DiskId(self.disks.len());
        self.disks.push(Disk {
            name: name.into(),
            mount: mount.into(),
            host,
            read_bw,
            write_bw,
            free_bytes: capacity_bytes,
        });
        self.hosts[host.0].disks.push(id);
        id
    }

    pub fn add_link(&mut self, a: SiteId, b: SiteId, bandwidth: f64, latency: f64) {
        self.links.insert((a, b), Link { bandwidth, latency });
    }

    /// Link between two sites, looked up in either direction.
    pub fn link_between(&self, a: SiteId, b: SiteId) -> Option<Link> {
        self.links
            .get(&(a, b))
            .or_else(|| self.links.get(&(b, a)))
            .copied()
    }

    pub fn site(&self, id: SiteId) -> &Site {
        &self.sites[id.0]
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.0]
    }

    pub fn disk(&self, id: DiskId) -> &Disk {
        &self.disks[id.0]
    }

    pub fn site_by_name(&self, name: &str) -> Option<SiteId> {
        self.site_index.get(name).copied()
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostId> {
        self.host_index.get(name).copied()
    }

    pub fn disk_by_name(&self, host: HostId, name: &str) -> Option<DiskId> {
        self.hosts[host.0]
            .disks
            .iter()
            .copied()
            .find(|d| self.disks[d.0].name == name)
    }

    /// Sites eligible for placement, in insertion order. The job-server
    /// pseudo-site is skipped.
    pub fn compute_sites(&self) -> impl Iterator<Item = SiteId> + '_ {
        let skip = self.job_server;
        (0..self.sites.len()).map(SiteId).filter(move |s| Some(*s) != skip)
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// Validate that a placement triple is internally consistent.
    pub fn check_placement(
        &self,
        site: SiteId,
        host: HostId,
        disk: DiskId,
    ) -> Result<(), Error> {
        if site.0 >= self.sites.len() || Some(site) == self.job_server {
            return Err(Error::TopologyMissing(format!("site #{}", site.0)));
        }
        let h = self
            .hosts
            .get(host.0)
            .ok_or_else(|| Error::TopologyMissing(format!("host #{}", host.0)))?;
        if h.site != site {
            return Err(Error::TopologyMissing(format!(
                "host {} does not belong to site {}",
                h.name, self.sites[site.0].name
            )));
        }
        let d = self
            .disks
            .get(disk.0)
            .ok_or_else(|| Error::TopologyMissing(format!("disk #{}", disk.0)))?;
        if d.host != host {
            return Err(Error::TopologyMissing(format!(
                "disk {} is not attached to host {}",
                d.name, h.name
            )));
        }
        Ok(())
    }

    /// Atomically take `cores` from a host and `bytes` from one of its
    /// disks for a job. Fails without side effects if either counter would
    /// go negative.
    pub fn reserve(
        &mut self,
        host: HostId,
        cores: u32,
        disk: DiskId,
        bytes: u64,
        job: u64,
    ) -> Result<(), Error> {
        let h = &self.hosts[host.0];
        if h.cores_available < cores {
            return Err(Error::ResourceInsufficient {
                host: h.name.clone(),
                reason: format!("{} cores free, {} requested", h.cores_available, cores),
            });
        }
        let d = &self.disks[disk.0];
        if d.free_bytes < bytes {
            return Err(Error::ResourceInsufficient {
                host: h.name.clone(),
                reason: format!(
                    "{} B free on disk {}, {} B requested",
                    d.free_bytes, d.name, bytes
                ),
            });
        }

        let h = &mut self.hosts[host.0];
        let was_idle = h.cores_available == h.total_cores;
        h.cores_available -= cores;
        h.running_jobs.insert(job);
        self.disks[disk.0].free_bytes -= bytes;
        if was_idle && h.cores_available < h.total_cores {
            self.sites[h.site.0].cpus_in_use += 1;
        }
        Ok(())
    }

    /// Give back what [`Grid::reserve`] took. Releasing a job the host no
    /// longer runs is a silent no-op, so completion callbacks may race.
    pub fn release(&mut self, host: HostId, cores: u32, disk: DiskId, bytes: u64, job: u64) {
        let h = &mut self.hosts[host.0];
        if !h.running_jobs.remove(&job) {
            return;
        }
        let was_busy = h.cores_available < h.total_cores;
        h.cores_available = (h.cores_available + cores).min(h.total_cores);
        self.disks[disk.0].free_bytes += bytes;
        if was_busy && h.cores_available == h.total_cores {
            let site = h.site;
            self.sites[site.0].cpus_in_use = self.sites[site.0].cpus_in_use.saturating_sub(1);
        }
    }

    fn sites_sorted_by_name(&self) -> Vec<SiteId> {
        let mut out: Vec<SiteId> = self.compute_sites().collect();
        out.sort_by(|a, b| self.sites[a.0].name.cmp(&self.sites[b.0].name));
        out
    }

    fn hosts_sorted_by_name(&self, site: SiteId) -> Vec<HostId> {
        let mut out = self.sites[site.0].hosts.clone();
        out.sort_by(|a, b| self.hosts[a.0].name.cmp(&self.hosts[b.0].name));
        out
    }

    /// Widest host count across placement sites; defines the feature row
    /// width.
    pub fn max_hosts_per_site(&self) -> usize {
        self.compute_sites()
            .map(|s| self.sites[s.0].hosts.len())
            .max()
            .unwrap_or(0)
    }

    /// Materialize the deterministic feature matrices. Two calls with an
    /// unchanged grid produce identical output.
    pub fn snapshot(&self) -> Snapshot {
        let site_order = self.sites_sorted_by_name();
        let max_c = self.max_hosts_per_site();

        let mut total = vec![vec![0_i32; max_c]; site_order.len()];
        let mut avail = vec![vec![0_i32; max_c]; site_order.len()];
        let mut speeds = vec![vec![0.0_f64; max_c]; site_order.len()];

        for (si, site) in site_order.iter().enumerate() {
            for (ci, host) in self.hosts_sorted_by_name(*site).iter().enumerate() {
                let h = &self.hosts[host.0];
                total[si][ci] = h.total_cores as i32;
                avail[si][ci] = h.cores_available as i32;
                speeds[si][ci] = h.speed;
            }
        }

        Snapshot {
            site_order,
            total_cores: total,
            available_cores: avail,
            core_speeds: speeds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_site_grid() -> Grid {
        let mut grid = Grid::new("test-grid");
        let b = grid.add_site("SITE-B", 0, 10.0, 1_000);
        let hb = grid.add_host(b, "SITE-B_cpu-0", 2e9, 8);
        grid.add_disk(hb, "scratch", "/scratch/", 1e8, 1e8, 10_000);
        let a = grid.add_site("SITE-A", 0, 20.0, 2_000);
        let ha0 = grid.add_host(a, "SITE-A_cpu-1", 1e9, 4);
        grid.add_disk(ha0, "scratch", "/scratch/", 1e8, 1e8, 10_000);
        let ha1 = grid.add_host(a, "SITE-A_cpu-0", 1e9, 4);
        grid.add_disk(ha1, "scratch", "/scratch/", 1e8, 1e8, 10_000);
        grid.add_job_server("JOB-SERVER");
        grid
    }

    #[test]
    fn test_reserve_release_round_trip() {
        let mut grid = two_site_grid();
        let host = grid.host_by_name("SITE-B_cpu-0").unwrap();
        let disk = grid.host(host).disks()[0];

        grid.reserve(host, 3, disk, 500, 42).unwrap();
        assert_eq!(grid.host(host).cores_available, 5);
        assert_eq!(grid.disk(disk).free_bytes, 9_500);
        assert!(grid.host(host).running_jobs.contains(&42));
        assert_eq!(grid.site(grid.host(host).site).cpus_in_use, 1);

        grid.release(host, 3, disk, 500, 42);
        assert_eq!(grid.host(host).cores_available, 8);
        assert_eq!(grid.disk(disk).free_bytes, 10_000);
        assert!(grid.host(host).running_jobs.is_empty());
        assert_eq!(grid.site(grid.host(host).site).cpus_in_use, 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut grid = two_site_grid();
        let host = grid.host_by_name("SITE-B_cpu-0").unwrap();
        let disk = grid.host(host).disks()[0];

        grid.reserve(host, 2, disk, 100, 7).unwrap();
        grid.release(host, 2, disk, 100, 7);
        grid.release(host, 2, disk, 100, 7);
        assert_eq!(grid.host(host).cores_available, 8);
        assert_eq!(grid.disk(disk).free_bytes, 10_000);
    }

    #[test]
    fn test_reserve_rejects_overcommit() {
        let mut grid = two_site_grid();
        let host = grid.host_by_name("SITE-B_cpu-0").unwrap();
        let disk = grid.host(host).disks()[0];

        assert!(matches!(
            grid.reserve(host, 9, disk, 0, 1),
            Err(Error::ResourceInsufficient { .. })
        ));
        assert!(matches!(
            grid.reserve(host, 1, disk, 10_001, 1),
            Err(Error::ResourceInsufficient { .. })
        ));
        // nothing was taken
        assert_eq!(grid.host(host).cores_available, 8);
        assert_eq!(grid.disk(disk).free_bytes, 10_000);
    }

    #[test]
    fn test_snapshot_is_name_sorted_and_padded() {
        let grid = two_site_grid();
        let snap = grid.snapshot();

        // SITE-A before SITE-B despite insertion order, job server excluded
        assert_eq!(snap.num_sites(), 2);
        assert_eq!(grid.site(snap.site_order[0]).name, "SITE-A");
        assert_eq!(grid.site(snap.site_order[1]).name, "SITE-B");

        // widest site has two hosts, SITE-B row padded with zeros
        assert_eq!(snap.row_width(), 2);
        assert_eq!(snap.total_cores[0], vec![4, 4]);
        assert_eq!(snap.total_cores[1], vec![8, 0]);
        assert_eq!(snap.core_speeds[1], vec![2e9, 0.0]);
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let grid = two_site_grid();
        let a = grid.snapshot();
        let b = grid.snapshot();
        assert_eq!(a.total_cores, b.total_cores);
        assert_eq!(a.available_cores, b.available_cores);
        assert_eq!(a.core_speeds, b.core_speeds);
        assert_eq!(a.site_order, b.site_order);
    }

    #[test]
    fn test_check_placement_rejects_foreign_disk() {
        let grid = two_site_grid();
        let a = grid.site_by_name("SITE-A").unwrap();
        let host_a = grid.host_by_name("SITE-A_cpu-0").unwrap();
        let host_b = grid.host_by_name("SITE-B_cpu-0").unwrap();
        let disk_b = grid.host(host_b).disks()[0];

        assert!(grid.check_placement(a, host_a, disk_b).is_err());
        assert!(grid
            .check_placement(a, host_b, disk_b)
            .is_err());
    }
}
