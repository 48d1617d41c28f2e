use crate::error::Error;

fn default_policy_server() -> String {
    "127.0.0.1:5555".to_string()
}

fn default_protocol_error_limit() -> u32 {
    32
}

/// Run configuration, a JSON document with the historical key names.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(rename = "Grid_Name")]
    pub grid_name: String,
    #[serde(rename = "Sites_Information")]
    pub sites_information: std::path::PathBuf,
    #[serde(rename = "Sites_Connection_Information")]
    pub sites_connection_information: std::path::PathBuf,
    /// Dispatch policy name; legacy plugin paths are accepted and reduced
    /// to their basename.
    #[serde(rename = "Dispatcher_Plugin")]
    pub dispatcher_plugin: String,
    #[serde(rename = "Output_DB")]
    pub output_db: std::path::PathBuf,
    /// Number of jobs to ingest; negative means the whole workload.
    #[serde(rename = "Num_of_Jobs")]
    pub num_of_jobs: i64,
    /// Optional site filter; empty keeps every site.
    #[serde(rename = "Sites", default)]
    pub sites: Vec<String>,
    #[serde(rename = "Input_Job_CSV", default)]
    pub input_job_csv: Option<std::path::PathBuf>,
    /// Seed for a generated workload, used when no CSV is configured.
    #[serde(rename = "Synthetic_Seed", default)]
    pub synthetic_seed: Option<u64>,
    #[serde(rename = "Policy_Server", default = "default_policy_server")]
    pub policy_server: String,
    /// Seed for the policy-local random choices (host pick).
    #[serde(rename = "Policy_Seed", default)]
    pub policy_seed: u64,
    /// Protocol errors tolerated before the run aborts.
    #[serde(
        rename = "Protocol_Error_Limit",
        default = "default_protocol_error_limit"
    )]
    pub protocol_error_limit: u32,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Policy lookup key: basename of the configured plugin, with any
    /// `lib` prefix and extension stripped, so configs written for the
    /// shared-object loader keep working against the registry.
    pub fn policy_name(&self) -> String {
        let base = self
            .dispatcher_plugin
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.dispatcher_plugin);
        let base = base.strip_prefix("lib").unwrap_or(base);
        let base = base
            .split_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(base);
        base.to_string()
    }
}
