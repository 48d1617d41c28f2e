use crate::error::Error;
use crate::job::{Job, JobStatus};

/// Live per-site job counters, updated on every status transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct SiteStats {
    pub assigned: u64,
    pub pending: u64,
    pub failed: u64,
    pub finished: u64,
}

/// Counters for all sites; jobs without a known site land under `-`.
#[derive(Debug, Default)]
pub struct StatsBook {
    per_site: std::collections::BTreeMap<String, SiteStats>,
}

impl StatsBook {
    fn entry(&mut self, site: Option<&str>) -> &mut SiteStats {
        self.per_site.entry(site.unwrap_or("-").to_string()).or_default()
    }

    pub fn on_assigned(&mut self, site: &str, was_pending: bool) {
        let s = self.entry(Some(site));
        s.assigned += 1;
        if was_pending {
            s.pending = s.pending.saturating_sub(1);
        }
    }

    pub fn on_pending(&mut self, site: Option<&str>) {
        self.entry(site).pending += 1;
    }

    pub fn on_failed(&mut self, site: Option<&str>, was_pending: bool) {
        let s = self.entry(site);
        s.failed += 1;
        if was_pending {
            s.pending = s.pending.saturating_sub(1);
        }
    }

    pub fn on_finished(&mut self, site: &str) {
        let s = self.entry(Some(site));
        s.finished += 1;
        s.assigned = s.assigned.saturating_sub(1);
    }

    pub fn site(&self, name: &str) -> SiteStats {
        self.per_site.get(name).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SiteStats)> {
        self.per_site.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One row of the run's job table.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: u64,
    pub status: JobStatus,
    pub site: String,
    pub host: String,
    pub disk: String,
    pub enqueue: f64,
    pub assign: f64,
    pub exec_start: f64,
    pub exec_end: f64,
    pub io_read_time: f64,
    pub io_write_time: f64,
    pub retries: u32,
}

impl JobRecord {
    pub fn header() -> &'static str {
        "jobid,status,site,host,disk,enqueue,assign,exec-start,exec-end,io-read-time,io-write-time,retries"
    }

    pub fn from_job(job: &Job, names: Option<(String, String, String)>) -> Self {
        let (site, host, disk) = names.unwrap_or_default();
        Self {
            id: job.id,
            status: job.status,
            site,
            host,
            disk,
            enqueue: job.times.enqueue.unwrap_or(0.0),
            assign: job.times.assign.unwrap_or(0.0),
            exec_start: job.times.exec_start.unwrap_or(0.0),
            exec_end: job.times.exec_done.unwrap_or(0.0),
            io_read_time: job.io_read_time,
            io_write_time: job.io_write_time,
            retries: job.retries,
        }
    }
}

impl std::fmt::Display for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.id,
            self.status,
            self.site,
            self.host,
            self.disk,
            self.enqueue,
            self.assign,
            self.exec_start,
            self.exec_end,
            self.io_read_time,
            self.io_write_time,
            self.retries
        )
    }
}

/// Everything a finished run reports.
#[derive(Debug)]
pub struct RunReport {
    pub simulated_time: f64,
    pub finished: u64,
    pub failed: u64,
    pub records: Vec<JobRecord>,
}

impl RunReport {
    pub fn write_csv(&self, path: &std::path::Path) -> Result<(), Error> {
        use std::io::Write;
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(out, "{}", JobRecord::header())?;
        for record in &self.records {
            writeln!(out, "{record}")?;
        }
        Ok(())
    }

    /// Log aggregate turnaround figures over the finished jobs.
    pub fn log_summary(&self) {
        let mut turnaround = incr_stats::incr::Stats::new();
        for record in &self.records {
            if record.status == JobStatus::Finished {
                let _ = turnaround.update(record.exec_end - record.enqueue);
            }
        }
        log::info!(
            "simulated {:.3} s: {} finished, {} failed",
            self.simulated_time,
            self.finished,
            self.failed
        );
        if turnaround.count() > 0 {
            log::info!(
                "turnaround: mean {:.3} s, min {:.3} s, max {:.3} s",
                turnaround.mean().unwrap_or(0.0),
                turnaround.min().unwrap_or(0.0),
                turnaround.max().unwrap_or(0.0)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_transitions() {
        let mut book = StatsBook::default();
        book.on_pending(Some("A"));
        book.on_assigned("A", true);
        book.on_finished("A");
        book.on_failed(None, false);

        let a = book.site("A");
        assert_eq!(a.pending, 0);
        assert_eq!(a.assigned, 0);
        assert_eq!(a.finished, 1);
        assert_eq!(book.site("-").failed, 1);
    }

    #[test]
    fn test_record_csv_shape() {
        let record = JobRecord {
            id: 7,
            status: JobStatus::Finished,
            site: "A".into(),
            host: "A_cpu-0".into(),
            disk: "d".into(),
            enqueue: 0.0,
            assign: 0.0,
            exec_start: 1.0,
            exec_end: 11.0,
            io_read_time: 2.0,
            io_write_time: 3.0,
            retries: 1,
        };
        let line = record.to_string();
        assert_eq!(
            line.split(',').count(),
            JobRecord::header().split(',').count()
        );
        assert!(line.starts_with("7,finished,A,"));
    }
}
