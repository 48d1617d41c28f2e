use crate::error::Error;
use crate::files::FileRegistry;
use crate::resources::Grid;

/// Name of the pseudo-site the executor runs on. It owns no compute.
pub const JOB_SERVER: &str = "JOB-SERVER";

/// One disk of a host group, as the sites document declares it.
/// `mount` and `size_bytes` travel in the property bag.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DiskSpec {
    pub name: String,
    pub read_bw: f64,
    pub write_bw: f64,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, String>,
}

/// A group of `count` identical hosts.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HostGroupSpec {
    #[serde(default = "one")]
    pub count: u32,
    pub cores: u32,
    pub speed: f64,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SiteSpec {
    #[serde(rename = "SITE_PROPERTIES", default)]
    pub properties: std::collections::HashMap<String, String>,
    #[serde(rename = "CPUInfo", default)]
    pub cpus: Vec<HostGroupSpec>,
    /// Files initially resident at the site, `[name, bytes]` pairs.
    #[serde(default)]
    pub files: Vec<(String, u64)>,
}

/// The sites document: site name to description, name-ordered.
pub type SitesDoc = std::collections::BTreeMap<String, SiteSpec>;

#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct LinkSpec {
    pub bandwidth: f64,
    pub latency: f64,
}

/// The connections document: `"A:B"` keys to link parameters.
pub type ConnectionsDoc = std::collections::BTreeMap<String, LinkSpec>;

fn keep(filter: &[String], site: &str) -> bool {
    filter.is_empty() || filter.iter().any(|s| s == site)
}

pub fn load_sites(path: &std::path::Path, filter: &[String]) -> Result<SitesDoc, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut doc: SitesDoc = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
    doc.retain(|name, _| keep(filter, name));
    Ok(doc)
}

pub fn load_connections(
    path: &std::path::Path,
    filter: &[String],
) -> Result<ConnectionsDoc, Error> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut doc: ConnectionsDoc = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
    doc.retain(|key, _| match key.split_once(':') {
        Some((a, b)) => keep(filter, a) && keep(filter, b),
        None => false,
    });
    Ok(doc)
}

fn prop<T: std::str::FromStr + Default>(
    properties: &std::collections::HashMap<String, String>,
    key: &str,
) -> T {
    properties
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// Build the live grid and seed the file registry from the two topology
/// documents. Hosts of a group are expanded to `<site>_cpu-<i>`; every
/// site also registers its resident files against its storage capacity.
pub fn build_grid(
    grid_name: &str,
    sites: &SitesDoc,
    connections: &ConnectionsDoc,
    registry: &mut FileRegistry,
) -> Result<Grid, Error> {
    let mut grid = Grid::new(grid_name);

    for (name, spec) in sites {
        let storage: u64 = prop(&spec.properties, "storage_capacity_bytes");
        let gflops: f64 = prop(&spec.properties, "gflops");
        let priority: i64 = prop(&spec.properties, "priority");
        let site = grid.add_site(name.clone(), priority, gflops, storage);

        let mut cpu_counter = 0;
        for group in &spec.cpus {
            for _ in 0..group.count {
                let host = grid.add_host(
                    site,
                    format!("{name}_cpu-{cpu_counter}"),
                    group.speed,
                    group.cores,
                );
                cpu_counter += 1;
                for disk in &group.disks {
                    let mount = disk
                        .properties
                        .get("mount")
                        .cloned()
                        .unwrap_or_else(|| "/".to_string());
                    let capacity = disk
                        .properties
                        .get("size_bytes")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(storage);
                    grid.add_disk(host, disk.name.clone(), mount, disk.read_bw, disk.write_bw, capacity);
                }
            }
        }

        registry.register_site(name, storage, spec.files.iter().cloned())?;
        log::debug!(
            "site {name}: {cpu_counter} hosts, {} resident files",
            spec.files.len()
        );
    }

    for (key, link) in connections {
        let Some((a, b)) = key.split_once(':') else {
            continue;
        };
        let (Some(a), Some(b)) = (grid.site_by_name(a), grid.site_by_name(b)) else {
            return Err(Error::Config(format!("connection {key:?} names unknown sites")));
        };
        grid.add_link(a, b, link.bandwidth, link.latency);
    }

    grid.add_job_server(JOB_SERVER);
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITES: &str = r#"{
        "SITE-A": {
            "SITE_PROPERTIES": {
                "gflops": "20",
                "storage_capacity_bytes": "100000",
                "priority": "2"
            },
            "CPUInfo": [{
                "count": 2,
                "cores": 4,
                "speed": 1e9,
                "disks": [{
                    "name": "scratch",
                    "read_bw": 1e8,
                    "write_bw": 5e7,
                    "properties": {"mount": "/scratch/", "size_bytes": "50000"}
                }]
            }],
            "files": [["data.root", 1000]]
        },
        "SITE-B": {
            "SITE_PROPERTIES": {"gflops": "10", "storage_capacity_bytes": "40000"},
            "CPUInfo": [{"cores": 8, "speed": 2e9, "disks": [
                {"name": "d0", "read_bw": 1e8, "write_bw": 1e8}
            ]}]
        }
    }"#;

    const CONNS: &str = r#"{
        "SITE-A:SITE-B": {"bandwidth": 1.25e8, "latency": 0.01}
    }"#;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}_{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_build_grid_from_documents() {
        let sites: SitesDoc = serde_json::from_str(SITES).unwrap();
        let conns: ConnectionsDoc = serde_json::from_str(CONNS).unwrap();
        let mut registry = FileRegistry::new();
        let grid = build_grid("test-grid", &sites, &conns, &mut registry).unwrap();

        // two compute sites plus the job server, which placement skips
        assert_eq!(grid.compute_sites().count(), 2);

        let a = grid.site_by_name("SITE-A").unwrap();
        assert_eq!(grid.site(a).hosts().len(), 2);
        assert_eq!(grid.site(a).priority, 2);
        assert_eq!(grid.site(a).gflops_per_core, 20.0);

        let h0 = grid.host_by_name("SITE-A_cpu-0").unwrap();
        assert_eq!(grid.host(h0).total_cores, 4);
        let d = grid.host(h0).disks()[0];
        assert_eq!(grid.disk(d).mount, "/scratch/");
        assert_eq!(grid.disk(d).free_bytes, 50_000);

        // disk without explicit size falls back to site storage
        let b = grid.site_by_name("SITE-B").unwrap();
        let hb = grid.site(b).hosts()[0];
        assert_eq!(grid.disk(grid.host(hb).disks()[0]).free_bytes, 40_000);

        // the link is bidirectional in lookup
        assert!(grid.link_between(b, a).is_some());

        // resident files landed in the registry
        assert!(registry.exists_at("data.root", "SITE-A"));
        assert_eq!(registry.remaining_on("SITE-A").unwrap(), 99_000);
    }

    #[test]
    fn test_site_filter() {
        let sites_path = write_temp("sites.json", SITES);
        let conns_path = write_temp("conns.json", CONNS);
        let filter = vec!["SITE-A".to_string()];

        let sites = load_sites(&sites_path, &filter).unwrap();
        assert_eq!(sites.len(), 1);
        assert!(sites.contains_key("SITE-A"));

        // the cross-site link drops with one endpoint filtered away
        let conns = load_connections(&conns_path, &filter).unwrap();
        assert!(conns.is_empty());

        std::fs::remove_file(sites_path).ok();
        std::fs::remove_file(conns_path).ok();
    }

    #[test]
    fn test_connection_to_unknown_site_is_config_error() {
        let sites: SitesDoc = serde_json::from_str(SITES).unwrap();
        let conns: ConnectionsDoc =
            serde_json::from_str(r#"{"SITE-A:GHOST": {"bandwidth": 1.0, "latency": 0.0}}"#)
                .unwrap();
        let mut registry = FileRegistry::new();
        assert!(matches!(
            build_grid("g", &sites, &conns, &mut registry),
            Err(Error::Config(_))
        ));
    }
}
