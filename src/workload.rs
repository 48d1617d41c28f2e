use rand::{distributions::Distribution, seq::SliceRandom, Rng, SeedableRng};

use crate::config::Config;
use crate::error::Error;
use crate::job::{InputFile, Job};

/// Environment override for the workload CSV path.
pub const JOB_CSV_ENV: &str = "CGSIM_JOB_CSV";

/// Ordered batch of jobs a dispatch policy hands out on request.
#[derive(Debug)]
pub struct WorkloadSource {
    jobs: std::collections::VecDeque<Job>,
}

impl WorkloadSource {
    /// Resolve the workload for a run: the `CGSIM_JOB_CSV` environment
    /// variable wins, then the configured CSV, then a seeded synthetic
    /// batch when the config asks for one.
    pub fn from_config(cfg: &Config) -> Result<Self, Error> {
        if let Ok(path) = std::env::var(JOB_CSV_ENV) {
            if !path.is_empty() {
                return Ok(Self::preloaded(load_csv(
                    std::path::Path::new(&path),
                    cfg.num_of_jobs,
                )?));
            }
        }
        if let Some(path) = &cfg.input_job_csv {
            return Ok(Self::preloaded(load_csv(path, cfg.num_of_jobs)?));
        }
        if let Some(seed) = cfg.synthetic_seed {
            let count = if cfg.num_of_jobs < 0 {
                100
            } else {
                cfg.num_of_jobs as u64
            };
            return Ok(Self::preloaded(synthetic(count, seed)));
        }
        Err(Error::Workload(format!(
            "no workload: set Input_Job_CSV, Synthetic_Seed or ${JOB_CSV_ENV}"
        )))
    }

    pub fn preloaded(jobs: Vec<Job>) -> Self {
        Self { jobs: jobs.into() }
    }

    /// Hand out up to `limit` jobs in ingestion order; negative takes all.
    pub fn take(&mut self, limit: i64) -> Vec<Job> {
        let n = if limit < 0 {
            self.jobs.len()
        } else {
            (limit as usize).min(self.jobs.len())
        };
        self.jobs.drain(..n).collect()
    }
}

fn field<'a>(
    record: &'a csv::StringRecord,
    columns: &std::collections::HashMap<String, usize>,
    name: &str,
) -> Option<&'a str> {
    let idx = *columns.get(name)?;
    record.get(idx).filter(|v| !v.is_empty())
}

fn numeric<T: std::str::FromStr + Default>(
    record: &csv::StringRecord,
    columns: &std::collections::HashMap<String, usize>,
    name: &str,
) -> T {
    field(record, columns, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// Names of the input files listed in a `files_info` cell. The cell is a
/// JSON object in well-formed workloads; older exports use a loose
/// `{key: value, ...}` spelling, handled by stripping braces and quotes.
fn parse_files_info(cell: &str) -> Vec<(String, u64)> {
    if let Ok(map) =
        serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(cell)
    {
        return map
            .into_iter()
            .map(|(name, value)| (name, value.as_u64().unwrap_or(0)))
            .collect();
    }
    cell.trim_matches(['{', '}', ' '])
        .split(',')
        .filter_map(|token| {
            let key = token.split(':').next()?;
            let key = key.trim().trim_matches('"');
            (!key.is_empty()).then(|| (key.to_string(), 0))
        })
        .collect()
}

/// Load a workload CSV. Columns are located by lowercased header name;
/// rows that fail to parse are skipped with a warning, as the historical
/// loader did.
pub fn load_csv(path: &std::path::Path, limit: i64) -> Result<Vec<Job>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::Workload(format!("cannot open {}: {e}", path.display())))?;

    let columns: std::collections::HashMap<String, usize> = reader
        .headers()
        .map_err(|e| Error::Workload(format!("bad header in {}: {e}", path.display())))?
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim().to_lowercase(), i))
        .collect();

    let mut jobs = vec![];
    for record in reader.records() {
        if limit >= 0 && jobs.len() as i64 >= limit {
            break;
        }
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                log::warn!("skipping unreadable workload row: {e}");
                continue;
            }
        };

        let id = match field(&record, &columns, "pandaid").and_then(|v| v.parse().ok()) {
            Some(id) => id,
            None => {
                log::warn!("skipping workload row without a job id");
                continue;
            }
        };

        let mut job = Job::new(id);
        job.priority = numeric(&record, &columns, "priority");
        job.cores = numeric(&record, &columns, "corecount");
        job.cpu_consumption_time = numeric(&record, &columns, "cpuconsumptiontime");
        job.submit_site = field(&record, &columns, "computingsite").map(str::to_string);

        if let Some(cell) = field(&record, &columns, "files_info") {
            for (name, size) in parse_files_info(cell) {
                job.input_files.insert(
                    name,
                    InputFile {
                        size,
                        locations: Default::default(),
                    },
                );
            }
        }

        let out_files: u32 = numeric(&record, &columns, "noutputdatafiles");
        let out_bytes: f64 = numeric(&record, &columns, "outputfilebytes");
        if out_files > 0 {
            let each = (out_bytes / out_files as f64) as u64;
            for k in 1..=out_files {
                job.output_files
                    .insert(format!("/output/user.output.{id}.0000{k}.root"), each);
            }
        }

        jobs.push(job);
    }
    log::info!("loaded {} jobs from {}", jobs.len(), path.display());
    Ok(jobs)
}

/// Seeded synthetic workload: no inputs, one or two outputs, exponential
/// CPU demand. Useful for exercising a platform without a trace.
pub fn synthetic(count: u64, seed: u64) -> Vec<Job> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let cpu_time = rand_distr::Exp::new(1.0 / 3600.0).unwrap();
    let out_size = rand_distr::LogNormal::new(18.0, 1.0).unwrap();

    (0..count)
        .map(|i| {
            let mut job = Job::new(i + 1);
            job.cores = *[1_u32, 1, 2, 4].choose(&mut rng).unwrap_or(&1);
            job.priority = rng.gen_range(0..3);
            job.cpu_consumption_time = rand_distr::Distribution::<f64>::sample(&cpu_time, &mut rng).ceil();
            for k in 1..=rng.gen_range(1..=2_u32) {
                job.output_files.insert(
                    format!("/output/user.output.{}.0000{}.root", job.id, k),
                    out_size.sample(&mut rng) as u64,
                );
            }
            job
        })
        .collect()
}
