use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::job::{Decision, Job, Placement};
use crate::npy::{Dtype, Tensor};
use crate::proto;
use crate::resources::{Grid, SiteId, Snapshot};
use crate::workload::WorkloadSource;

/// Placement by an external decision server over the framed protocol.
///
/// Per job the client sends `SBMT`, the three `[S, maxC]` grid tensors
/// (total cores, available cores, core speeds) and a `[1, 4]` job feature
/// vector, each acknowledged by the server, then `WAIT`s for a one-hot
/// site vector. The chosen site's host is picked locally, uniformly at
/// random among feasible hosts, with a seeded generator.
///
/// Framing faults and inconclusive answers demote the job to pending; the
/// run aborts once they exceed the configured limit, or immediately when
/// the server cannot be reached at all.
pub struct RemotePolicy {
    addr: String,
    source: WorkloadSource,
    stream: Option<std::net::TcpStream>,
    rng: rand::rngs::StdRng,
    protocol_errors: u32,
    protocol_error_limit: u32,
}

pub fn factory(cfg: &Config) -> Result<Box<dyn Dispatcher>, Error> {
    Ok(Box::new(RemotePolicy::new(
        cfg.policy_server.clone(),
        WorkloadSource::from_config(cfg)?,
        cfg.policy_seed,
        cfg.protocol_error_limit,
    )))
}

impl RemotePolicy {
    pub fn new(
        addr: String,
        source: WorkloadSource,
        seed: u64,
        protocol_error_limit: u32,
    ) -> Self {
        Self {
            addr,
            source,
            stream: None,
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            protocol_errors: 0,
            protocol_error_limit,
        }
    }

    /// Lazily connect, retrying once with a short backoff, and consume the
    /// server's `CONN` hello. An unreachable server or a bad hello is
    /// fatal.
    fn ensure_connected(&mut self) -> Result<&mut std::net::TcpStream, Error> {
        if self.stream.is_none() {
            let stream = match std::net::TcpStream::connect(&self.addr) {
                Ok(s) => s,
                Err(first) => {
                    log::warn!("decision server not reachable ({first}), retrying once");
                    std::thread::sleep(std::time::Duration::from_millis(500));
                    std::net::TcpStream::connect(&self.addr).map_err(|source| {
                        Error::Connect {
                            addr: self.addr.clone(),
                            source,
                        }
                    })?
                }
            };
            let mut stream = stream;
            let hello = proto::read_message(&mut stream)?;
            if hello != proto::CONN {
                return Err(Error::Connect {
                    addr: self.addr.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("hello mismatch: expected CONN, got {hello:?}"),
                    ),
                });
            }
            log::info!("connected to decision server at {}", self.addr);
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().expect("just connected"))
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    /// `[core_count, num_input_files, flops_estimate, total_input_bytes]`.
    /// Without an explicit flops amount the estimate uses the best
    /// per-core throughput any site advertises.
    fn job_features(job: &Job, grid: &Grid) -> [f64; 4] {
        let flops = if job.flops > 0.0 {
            job.flops
        } else {
            let best_gflops = grid
                .compute_sites()
                .map(|s| grid.site(s).gflops_per_core)
                .fold(0.0, f64::max);
            best_gflops * job.cpu_consumption_time * job.cores as f64
        };
        [
            job.cores as f64,
            job.input_files.len() as f64,
            flops,
            job.total_input_bytes() as f64,
        ]
    }

    fn exchange(&mut self, job: &Job, grid: &Grid, snap: &Snapshot) -> Result<Decision, Error> {
        let s = snap.num_sites();
        let max_c = snap.row_width();
        let flatten_i32 = |m: &Vec<Vec<i32>>| -> Vec<i32> {
            m.iter().flatten().copied().collect()
        };
        let features = Self::job_features(job, grid);

        let stream = self.ensure_connected()?;
        proto::write_message(stream, proto::SBMT)?;
        proto::expect(stream, proto::WAIT)?;

        proto::write_tensor(
            stream,
            &Tensor::from_i32(vec![s, max_c], &flatten_i32(&snap.total_cores)),
        )?;
        proto::expect(stream, proto::CNFM)?;
        proto::write_tensor(
            stream,
            &Tensor::from_i32(vec![s, max_c], &flatten_i32(&snap.available_cores)),
        )?;
        proto::expect(stream, proto::CNFM)?;
        let speeds: Vec<f64> = snap.core_speeds.iter().flatten().copied().collect();
        proto::write_tensor(stream, &Tensor::from_f64(vec![s, max_c], &speeds))?;
        proto::expect(stream, proto::CNFM)?;

        proto::write_tensor(stream, &Tensor::from_f64(vec![1, 4], &features))?;
        proto::expect(stream, proto::CNFM)?;

        proto::write_message(stream, proto::WAIT)?;
        let decision = proto::read_tensor(stream)?;

        let Some(site) = Self::decode_site(&decision, snap)? else {
            log::debug!("job {}: decision server declined every site", job.id);
            return Ok(Decision::Pending);
        };
        Ok(self.place_in_site(job, grid, site))
    }

    /// Accept `[S]` or `[1, S]` in `u8` or `f64`; the chosen site is the
    /// first non-zero element. `None` for an all-zero vector.
    fn decode_site(decision: &Tensor, snap: &Snapshot) -> Result<Option<SiteId>, Error> {
        let s = snap.num_sites();
        let shape_ok = match decision.shape.as_slice() {
            [n] => *n == s,
            [1, n] => *n == s,
            _ => false,
        };
        if !shape_ok {
            return Err(Error::Protocol(format!(
                "decision shape {:?} does not address {s} sites",
                decision.shape
            )));
        }
        if !matches!(decision.dtype, Dtype::U1 | Dtype::F8) {
            return Err(Error::Protocol(format!(
                "decision dtype {:?} unsupported",
                decision.dtype
            )));
        }
        Ok(decision.first_nonzero().map(|i| snap.site_order[i]))
    }

    fn place_in_site(&mut self, job: &Job, grid: &Grid, site: SiteId) -> Decision {
        let need = job.total_bytes();
        let feasible: Vec<Placement> = grid
            .site(site)
            .hosts()
            .iter()
            .filter_map(|host_id| {
                let host = grid.host(*host_id);
                if host.cores_available < job.cores {
                    return None;
                }
                host.disks()
                    .iter()
                    .find(|d| grid.disk(**d).free_bytes >= need)
                    .map(|disk| Placement {
                        site,
                        host: *host_id,
                        disk: *disk,
                    })
            })
            .collect();
        if feasible.is_empty() {
            log::debug!(
                "job {}: no feasible host at {}",
                job.id,
                grid.site(site).name
            );
            return Decision::Pending;
        }
        Decision::Assigned(feasible[self.rng.gen_range(0..feasible.len())])
    }
}

impl Dispatcher for RemotePolicy {
    fn name(&self) -> &'static str {
        "remote-policy"
    }

    fn workload(&mut self, limit: i64) -> Result<Vec<Job>, Error> {
        Ok(self.source.take(limit))
    }

    fn assign(&mut self, job: &Job, grid: &Grid) -> Result<Decision, Error> {
        let snap = grid.snapshot();
        if snap.num_sites() == 0 {
            return Ok(Decision::Failed);
        }

        let mut attempt = self.exchange(job, grid, &snap);
        if let Err(Error::Io(e)) = &attempt {
            // one reconnect, then give the job back as pending
            log::warn!("decision server link dropped ({e}), reconnecting");
            self.disconnect();
            attempt = self.exchange(job, grid, &snap);
        }

        match attempt {
            Ok(decision) => Ok(decision),
            Err(Error::Protocol(msg)) => {
                self.protocol_errors += 1;
                log::warn!(
                    "protocol error #{} from decision server: {msg}",
                    self.protocol_errors
                );
                // the stream may be desynchronized, start afresh
                self.disconnect();
                if self.protocol_errors >= self.protocol_error_limit {
                    return Err(Error::Protocol(format!(
                        "{} protocol errors, giving up (last: {msg})",
                        self.protocol_errors
                    )));
                }
                Ok(Decision::Pending)
            }
            Err(Error::Io(e)) => {
                log::warn!("decision server unavailable after reconnect: {e}");
                self.disconnect();
                Ok(Decision::Pending)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    /// Scripted decision server: accepts once, greets, then answers each
    /// SBMT exchange with the next vector from `answers`.
    fn spawn_server(answers: Vec<Tensor>) -> (String, std::thread::JoinHandle<()>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            proto::write_message(&mut stream, proto::CONN).unwrap();
            for answer in answers {
                match proto::read_message(&mut stream).as_deref() {
                    Ok(proto::SBMT) => {}
                    _ => return,
                }
                proto::write_message(&mut stream, proto::WAIT).unwrap();
                for _ in 0..4 {
                    proto::read_tensor(&mut stream).unwrap();
                    proto::write_message(&mut stream, proto::CNFM).unwrap();
                }
                proto::read_message(&mut stream).unwrap(); // WAIT
                proto::write_tensor(&mut stream, &answer).unwrap();
            }
        });
        (addr, handle)
    }

    fn two_site_grid() -> Grid {
        let mut grid = Grid::new("g");
        let a = grid.add_site("A", 0, 10.0, 1_000_000);
        let ha = grid.add_host(a, "A_cpu-0", 1e9, 4);
        grid.add_disk(ha, "d", "/d/", 1e8, 1e8, 1_000_000);
        let b = grid.add_site("B", 0, 10.0, 1_000_000);
        let hb = grid.add_host(b, "B_cpu-0", 1e9, 4);
        grid.add_disk(hb, "d", "/d/", 1e8, 1e8, 1_000_000);
        grid
    }

    fn policy(addr: String) -> RemotePolicy {
        RemotePolicy::new(addr, WorkloadSource::preloaded(vec![]), 42, 3)
    }

    #[test]
    fn test_one_hot_selects_site_by_sorted_index() {
        let (addr, server) = spawn_server(vec![Tensor::from_u8(vec![2], &[0, 1])]);
        let grid = two_site_grid();
        let mut p = policy(addr);

        let mut job = Job::new(1);
        job.cores = 2;
        match p.assign(&job, &grid).unwrap() {
            Decision::Assigned(placement) => {
                assert_eq!(grid.site(placement.site).name, "B");
                assert_eq!(grid.host(placement.host).name, "B_cpu-0");
            }
            other => panic!("expected assignment, got {other:?}"),
        }
        drop(p);
        server.join().unwrap();
    }

    #[test]
    fn test_all_zero_decision_is_pending() {
        let (addr, server) = spawn_server(vec![Tensor::from_f64(vec![1, 2], &[0.0, 0.0])]);
        let grid = two_site_grid();
        let mut p = policy(addr);

        let mut job = Job::new(1);
        job.cores = 1;
        assert_eq!(p.assign(&job, &grid).unwrap(), Decision::Pending);
        assert_eq!(p.protocol_errors, 0);
        drop(p);
        server.join().unwrap();
    }

    #[test]
    fn test_wrong_shape_is_protocol_error_then_pending() {
        let (addr, server) = spawn_server(vec![Tensor::from_u8(vec![3], &[0, 0, 1])]);
        let grid = two_site_grid();
        let mut p = policy(addr);

        let mut job = Job::new(1);
        job.cores = 1;
        assert_eq!(p.assign(&job, &grid).unwrap(), Decision::Pending);
        assert_eq!(p.protocol_errors, 1);
        drop(p);
        server.join().unwrap();
    }

    #[test]
    fn test_bad_hello_is_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            proto::write_message(&mut stream, "NOPE").unwrap();
            let mut sink = vec![];
            stream.read_to_end(&mut sink).ok();
        });
        let grid = two_site_grid();
        let mut p = policy(addr);
        let mut job = Job::new(1);
        job.cores = 1;
        assert!(matches!(
            p.assign(&job, &grid),
            Err(Error::Connect { .. })
        ));
        drop(p);
        server.join().unwrap();
    }

    #[test]
    fn test_chosen_site_without_capacity_is_pending() {
        let (addr, server) = spawn_server(vec![Tensor::from_u8(vec![2], &[1, 0])]);
        let mut grid = two_site_grid();
        let ha = grid.host_by_name("A_cpu-0").unwrap();
        let disk = grid.host(ha).disks()[0];
        grid.reserve(ha, 4, disk, 0, 99).unwrap();

        let mut p = policy(addr);
        let mut job = Job::new(1);
        job.cores = 2;
        assert_eq!(p.assign(&job, &grid).unwrap(), Decision::Pending);
        drop(p);
        server.join().unwrap();
    }

    #[test]
    fn test_feature_tensor_contents() {
        // captured server side: verify the four feature values
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || -> Vec<f64> {
            let (mut stream, _) = listener.accept().unwrap();
            proto::write_message(&mut stream, proto::CONN).unwrap();
            proto::read_message(&mut stream).unwrap(); // SBMT
            proto::write_message(&mut stream, proto::WAIT).unwrap();
            let mut features = vec![];
            for i in 0..4 {
                let t = proto::read_tensor(&mut stream).unwrap();
                if i == 3 {
                    features = t.as_f64();
                }
                proto::write_message(&mut stream, proto::CNFM).unwrap();
            }
            proto::read_message(&mut stream).unwrap(); // WAIT
            proto::write_tensor(&mut stream, &Tensor::from_u8(vec![2], &[1, 0])).unwrap();
            let mut sink = vec![];
            stream.read_to_end(&mut sink).ok();
            features
        });

        let grid = two_site_grid();
        let mut p = policy(addr);
        let mut job = Job::new(7);
        job.cores = 2;
        job.cpu_consumption_time = 100.0;
        job.input_files.insert(
            "f".into(),
            crate::job::InputFile {
                size: 1_000,
                locations: ["A".to_string()].into(),
            },
        );
        p.assign(&job, &grid).unwrap();
        drop(p);

        let features = server.join().unwrap();
        // [cores, inputs, 10 gflops/core * 100 s * 2 cores, input bytes]
        assert_eq!(features, vec![2.0, 1.0, 2_000.0, 1_000.0]);
    }
}
