use crate::activity::{ActivityKind, ActivitySpec};
use crate::error::Error;
use crate::job::Job;
use crate::resources::{DiskId, Grid, HostId};

/// Which files live where, how big they are, and how much storage each
/// site has left.
///
/// The two site/file mappings are kept reciprocal: a file listed under a
/// site always lists that site among its locations. Write and transfer
/// completions feed back into the registry through [`FileRegistry::create`].
#[derive(Debug, Default)]
pub struct FileRegistry {
    site_files: std::collections::HashMap<String, std::collections::HashSet<String>>,
    file_sites: std::collections::HashMap<String, std::collections::BTreeSet<String>>,
    file_sizes: std::collections::HashMap<String, u64>,
    remaining: std::collections::HashMap<String, u64>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a site with its storage capacity and the files initially
    /// resident there.
    pub fn register_site(
        &mut self,
        site: &str,
        capacity_bytes: u64,
        files: impl IntoIterator<Item = (String, u64)>,
    ) -> Result<(), Error> {
        self.site_files.entry(site.to_string()).or_default();
        self.remaining.entry(site.to_string()).or_insert(capacity_bytes);
        for (name, size) in files {
            self.create(&name, size, site)?;
        }
        Ok(())
    }

    pub fn locate(&self, filename: &str) -> Result<&std::collections::BTreeSet<String>, Error> {
        self.file_sites
            .get(filename)
            .ok_or_else(|| Error::FileMissing(filename.to_string()))
    }

    pub fn size_of(&self, filename: &str) -> Result<u64, Error> {
        self.file_sizes
            .get(filename)
            .copied()
            .ok_or_else(|| Error::FileMissing(filename.to_string()))
    }

    pub fn remaining_on(&self, site: &str) -> Result<u64, Error> {
        self.remaining
            .get(site)
            .copied()
            .ok_or_else(|| Error::UnknownSite(site.to_string()))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.file_sizes.contains_key(filename)
    }

    pub fn exists_at(&self, filename: &str, site: &str) -> bool {
        self.site_files
            .get(site)
            .is_some_and(|files| files.contains(filename))
    }

    /// Materialize a file at a site, charging its storage. Re-creating an
    /// identical (file, site) pair is a no-op; a size mismatch is a
    /// conflict.
    pub fn create(&mut self, filename: &str, size: u64, site: &str) -> Result<(), Error> {
        let remaining = self
            .remaining
            .get_mut(site)
            .ok_or_else(|| Error::UnknownSite(site.to_string()))?;

        if let Some(have) = self.file_sizes.get(filename) {
            if *have != size {
                return Err(Error::FileConflict {
                    file: filename.to_string(),
                    site: site.to_string(),
                    have: *have,
                    got: size,
                });
            }
            if self.site_files[site].contains(filename) {
                return Ok(());
            }
        }

        if *remaining < size {
            return Err(Error::OutOfStorage {
                site: site.to_string(),
                needed: size,
                remaining: *remaining,
            });
        }
        *remaining -= size;

        self.site_files
            .get_mut(site)
            .ok_or_else(|| Error::UnknownSite(site.to_string()))?
            .insert(filename.to_string());
        self.file_sites
            .entry(filename.to_string())
            .or_default()
            .insert(site.to_string());
        self.file_sizes.insert(filename.to_string(), size);
        Ok(())
    }

    /// Drop a file replica from a site and refund its storage.
    pub fn remove(&mut self, filename: &str, site: &str) -> Result<(), Error> {
        let files = self
            .site_files
            .get_mut(site)
            .ok_or_else(|| Error::UnknownSite(site.to_string()))?;
        if !files.remove(filename) {
            return Err(Error::FileMissingAt {
                file: filename.to_string(),
                site: site.to_string(),
            });
        }
        let size = self.size_of(filename)?;
        if let Some(remaining) = self.remaining.get_mut(site) {
            *remaining += size;
        }
        let sites = self
            .file_sites
            .get_mut(filename)
            .ok_or_else(|| Error::FileMissing(filename.to_string()))?;
        sites.remove(site);
        if sites.is_empty() {
            self.file_sites.remove(filename);
            self.file_sizes.remove(filename);
        }
        Ok(())
    }

    /// Fill in sizes and locations for a job's declared input files.
    pub fn resolve_inputs(&self, job: &mut Job) -> Result<(), Error> {
        for (name, input) in job.input_files.iter_mut() {
            input.size = self
                .file_sizes
                .get(name)
                .copied()
                .ok_or_else(|| Error::FileMissing(name.clone()))?;
            input.locations = self.locate(name)?.clone();
        }
        Ok(())
    }

    /// Activity that reads `file` off the given disk. The file must be
    /// resident at the site.
    pub fn read_activity(
        &self,
        grid: &Grid,
        file: &str,
        site: &str,
        _host: HostId,
        disk: DiskId,
    ) -> Result<ActivitySpec, Error> {
        if !self.exists_at(file, site) {
            return Err(Error::FileMissingAt {
                file: file.to_string(),
                site: site.to_string(),
            });
        }
        let size = self.size_of(file)?;
        let d = grid.disk(disk);
        Ok(ActivitySpec {
            kind: ActivityKind::Read {
                file: file.to_string(),
            },
            duration: size as f64 / d.read_bw,
        })
    }

    /// Activity that writes `size` bytes of `file` onto the given disk.
    /// Registry state changes when the activity completes, not here.
    pub fn write_activity(
        &self,
        grid: &Grid,
        file: &str,
        size: u64,
        site: &str,
        _host: HostId,
        disk: DiskId,
    ) -> ActivitySpec {
        let d = grid.disk(disk);
        ActivitySpec {
            kind: ActivityKind::Write {
                file: file.to_string(),
                size,
                site: site.to_string(),
            },
            duration: size as f64 / d.write_bw,
        }
    }

    /// Activity that moves `file` between two sites over their link. A
    /// transfer to a site that already holds the file is a zero-length
    /// no-op.
    pub fn transfer_activity(
        &self,
        grid: &Grid,
        file: &str,
        src_site: &str,
        dst_site: &str,
    ) -> Result<ActivitySpec, Error> {
        if !self.exists_at(file, src_site) {
            return Err(Error::FileMissingAt {
                file: file.to_string(),
                site: src_site.to_string(),
            });
        }
        let size = self.size_of(file)?;
        let kind = ActivityKind::Transfer {
            file: file.to_string(),
            size,
            src: src_site.to_string(),
            dst: dst_site.to_string(),
        };
        if self.exists_at(file, dst_site) {
            return Ok(ActivitySpec {
                kind,
                duration: 0.0,
            });
        }
        let src = grid
            .site_by_name(src_site)
            .ok_or_else(|| Error::UnknownSite(src_site.to_string()))?;
        let dst = grid
            .site_by_name(dst_site)
            .ok_or_else(|| Error::UnknownSite(dst_site.to_string()))?;
        let link = grid.link_between(src, dst).ok_or_else(|| {
            Error::TopologyMissing(format!("no link between {src_site} and {dst_site}"))
        })?;
        Ok(ActivitySpec {
            kind,
            duration: link.latency + size as f64 / link.bandwidth,
        })
    }
}
