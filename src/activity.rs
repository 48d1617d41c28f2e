use crate::engine::{ActivityId, Engine};
use crate::error::Error;
use crate::files::FileRegistry;
use crate::job::{Job, JobId};
use crate::resources::Grid;

/// What an activity does, carried as the engine tag so completion events
/// can be routed without any side lookup.
#[derive(Debug, Clone)]
pub enum ActivityKind {
    Transfer {
        file: String,
        size: u64,
        src: String,
        dst: String,
    },
    Read {
        file: String,
    },
    Exec,
    Write {
        file: String,
        size: u64,
        site: String,
    },
}

#[derive(Debug, Clone)]
pub struct ActivityTag {
    pub job: JobId,
    pub kind: ActivityKind,
}

/// An activity before it is handed to the engine: its kind plus the
/// duration derived from bandwidths, link parameters or host speed.
#[derive(Debug, Clone)]
pub struct ActivitySpec {
    pub kind: ActivityKind,
    pub duration: f64,
}

/// The per-job activity graph, with handles into the engine.
#[derive(Debug)]
pub struct JobDag {
    pub graph: petgraph::Graph<ActivityId, ()>,
    pub transfers: Vec<ActivityId>,
    pub reads: Vec<ActivityId>,
    pub exec: ActivityId,
    pub writes: Vec<ActivityId>,
}

/// Build and arm the activity DAG for an assigned job:
///
/// ```text
///   per input file f:   [transfer f -> placement site]?  ->  read f
///   exec                (after all reads)
///   per output file o:  write o     (after exec)
/// ```
///
/// A transfer node appears only when the file is absent from the placement
/// site; its source is the lexicographically least site holding the file,
/// so rebuilding the same DAG is deterministic.
pub fn build(
    job: &Job,
    grid: &Grid,
    registry: &FileRegistry,
    engine: &mut Engine<ActivityTag>,
) -> Result<JobDag, Error> {
    let placement = job.placement.ok_or(Error::NotAssigned(job.id))?;
    let site_name = &grid.site(placement.site).name;
    let host = grid.host(placement.host);

    let mut graph = petgraph::Graph::new();
    let mut transfers = vec![];
    let mut reads = vec![];
    let mut read_nodes = vec![];

    for (file, input) in &job.input_files {
        let mut transfer = None;
        if !input.locations.contains(site_name) {
            let src = input
                .locations
                .iter()
                .next()
                .ok_or_else(|| Error::FileMissing(file.clone()))?;
            let spec = registry.transfer_activity(grid, file, src, site_name)?;
            let id = engine.add(
                ActivityTag {
                    job: job.id,
                    kind: spec.kind,
                },
                spec.duration,
                &[],
            );
            transfers.push(id);
            transfer = Some((id, graph.add_node(id)));
        }

        // the read waits for its transfer; sizing uses the source replica
        // since the local copy materializes only on transfer completion
        let spec = match registry.read_activity(grid, file, site_name, placement.host, placement.disk)
        {
            Ok(spec) => spec,
            Err(Error::FileMissingAt { .. }) if transfer.is_some() => ActivitySpec {
                kind: ActivityKind::Read { file: file.clone() },
                duration: input.size as f64 / grid.disk(placement.disk).read_bw,
            },
            Err(e) => return Err(e),
        };
        let deps: Vec<ActivityId> = transfer.iter().map(|(id, _)| *id).collect();
        let id = engine.add(
            ActivityTag {
                job: job.id,
                kind: spec.kind,
            },
            spec.duration,
            &deps,
        );
        reads.push(id);
        let node = graph.add_node(id);
        if let Some((_, transfer_node)) = transfer {
            graph.add_edge(transfer_node, node, ());
        }
        read_nodes.push(node);
    }

    let exec = engine.add(
        ActivityTag {
            job: job.id,
            kind: ActivityKind::Exec,
        },
        job.flops / host.speed,
        &reads,
    );
    let exec_node = graph.add_node(exec);
    for node in read_nodes {
        graph.add_edge(node, exec_node, ());
    }

    let mut writes = vec![];
    for (file, size) in &job.output_files {
        let spec = registry.write_activity(
            grid,
            file,
            *size,
            site_name,
            placement.host,
            placement.disk,
        );
        let id = engine.add(
            ActivityTag {
                job: job.id,
                kind: spec.kind,
            },
            spec.duration,
            &[exec],
        );
        writes.push(id);
        let node = graph.add_node(id);
        graph.add_edge(exec_node, node, ());
    }

    for id in transfers.iter().chain(&reads).chain([&exec]).chain(&writes) {
        engine.start(*id);
    }

    log::debug!(
        "job {}: dag with {} transfers, {} reads, {} writes on {}",
        job.id,
        transfers.len(),
        reads.len(),
        writes.len(),
        host.name
    );

    Ok(JobDag {
        graph,
        transfers,
        reads,
        exec,
        writes,
    })
}
