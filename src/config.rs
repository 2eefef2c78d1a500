use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::fsm::generic::StateFields;
use crate::fsm::parse_end_date;
use crate::query::SourceQuery;

/// Top-level configuration for the statespan pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Warehouse connection configuration.
    #[serde(default)]
    pub warehouse: WarehouseConfig,

    /// Default end date for intervals left open at the end of the stream,
    /// `YYYY-MM-DD` (exclusive) or `YYYY-MM-DD HH:MM:SS`. Stages may
    /// override it; absent everywhere, each stage kind applies its own
    /// fallback.
    #[serde(default)]
    pub end_date: Option<String>,

    /// Interval sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Reconstruction stages, run sequentially in declaration order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Warehouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Connection timeout. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Interval sink configuration.
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    /// Number of interval records per batch insert. Default: 5000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Enable the metrics server. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Which reconstruction machine a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    VmLifecycle,
    ResourceSpecs,
    InstanceType,
    StateReconstruction,
}

impl StageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VmLifecycle => "vm_lifecycle",
            Self::ResourceSpecs => "resource_specs",
            Self::InstanceType => "instance_type",
            Self::StateReconstruction => "state_reconstruction",
        }
    }
}

/// One reconstruction stage: a source query, a machine, a destination.
#[derive(Debug, Deserialize)]
pub struct StageConfig {
    /// Stage name used in logs and metrics.
    pub name: String,

    /// Which reconstruction machine to run.
    pub kind: StageKind,

    /// Destination table for emitted interval records.
    pub destination: String,

    /// Base query, declared columns and ordering.
    pub source: SourceQuery,

    /// Per-stage end date override; falls back to the top-level one.
    #[serde(default)]
    pub end_date: Option<String>,

    /// Field lists for the state_reconstruction kind. Rejected on any
    /// other kind.
    #[serde(default)]
    pub fields: Option<StateFields>,
}

impl StageConfig {
    /// Resolves the effective end override for this stage: per-stage date,
    /// else the top-level default, else None (kind-specific fallback).
    pub fn resolved_end(&self, global: Option<&str>) -> Option<i64> {
        self.end_date
            .as_deref()
            .or(global)
            .and_then(parse_end_date)
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_batch_size() -> usize {
    5000
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            warehouse: WarehouseConfig::default(),
            end_date: None,
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
            stages: Vec::new(),
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            connect_timeout: default_connect_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    /// Everything a stage needs is checked here, before any query runs.
    pub fn validate(&self) -> Result<()> {
        if self.warehouse.endpoint.is_empty() {
            bail!("warehouse.endpoint is required");
        }

        if self.sink.batch_size == 0 {
            bail!("sink.batch_size must be positive");
        }

        if self.stages.is_empty() {
            bail!("at least one stage is required");
        }

        if let Some(date) = &self.end_date {
            if parse_end_date(date).is_none() {
                bail!("end_date {date:?} is not YYYY-MM-DD or YYYY-MM-DD HH:MM:SS");
            }
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                bail!("stage name is required");
            }
            if !names.insert(stage.name.as_str()) {
                bail!("duplicate stage name: {}", stage.name);
            }
            stage
                .validate()
                .with_context(|| format!("stage {}", stage.name))?;
        }

        Ok(())
    }
}

impl StageConfig {
    fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            bail!("destination table is required");
        }

        // Exercises column/ordering checks; the SQL itself is rebuilt at
        // run time.
        self.source
            .augmented_sql()
            .context("invalid source query")?;

        if let Some(date) = &self.end_date {
            if parse_end_date(date).is_none() {
                bail!("end_date {date:?} is not YYYY-MM-DD or YYYY-MM-DD HH:MM:SS");
            }
        }

        match (self.kind, &self.fields) {
            (StageKind::StateReconstruction, Some(fields)) => {
                fields.validate(&self.source.columns)?;
            }
            (StageKind::StateReconstruction, None) => {
                bail!("state_reconstruction stages require a fields block");
            }
            (_, Some(_)) => {
                bail!(
                    "fields only apply to state_reconstruction stages, not {}",
                    self.kind.as_str()
                );
            }
            (_, None) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{OrderBy, SortDir};

    fn vm_stage() -> StageConfig {
        StageConfig {
            name: "vm_runs".to_string(),
            kind: StageKind::VmLifecycle,
            destination: "cloud_instance_runs".to_string(),
            source: SourceQuery {
                columns: vec![
                    "resource_id".into(),
                    "instance_id".into(),
                    "event_time_ts".into(),
                    "event_type_id".into(),
                ],
                base_sql: "SELECT resource_id, instance_id, event_time_ts, event_type_id \
                           FROM cloud_events"
                    .into(),
                order_by: vec![
                    OrderBy {
                        column: "instance_id".into(),
                        dir: SortDir::Desc,
                    },
                    OrderBy {
                        column: "event_time_ts".into(),
                        dir: SortDir::Asc,
                    },
                ],
            },
            end_date: None,
            fields: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            warehouse: WarehouseConfig {
                endpoint: "localhost:9000".to_string(),
                ..Default::default()
            },
            stages: vec![vm_stage()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.warehouse.database, "default");
        assert_eq!(cfg.warehouse.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.sink.batch_size, 5000);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(!cfg.health.enabled);
    }

    #[test]
    fn test_validation_missing_endpoint() {
        let mut cfg = valid_config();
        cfg.warehouse.endpoint.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("warehouse.endpoint"));
    }

    #[test]
    fn test_validation_requires_stages() {
        let mut cfg = valid_config();
        cfg.stages.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one stage"));
    }

    #[test]
    fn test_validation_rejects_duplicate_stage_names() {
        let mut cfg = valid_config();
        cfg.stages.push(vm_stage());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn test_validation_rejects_bad_end_date() {
        let mut cfg = valid_config();
        cfg.end_date = Some("last tuesday".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("end_date"));

        let mut cfg = valid_config();
        cfg.end_date = Some("2019-04-01".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_unknown_order_column() {
        let mut cfg = valid_config();
        cfg.stages[0].source.order_by[0].column = "node_id".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("node_id"));
    }

    #[test]
    fn test_state_reconstruction_requires_fields() {
        let mut cfg = valid_config();
        cfg.stages[0].kind = StageKind::StateReconstruction;
        let err = cfg.validate().unwrap_err();
        // The stage name wraps the real cause; render the full chain.
        assert!(format!("{err:#}").contains("fields block"));
    }

    #[test]
    fn test_fields_rejected_on_builtin_kinds() {
        let mut cfg = valid_config();
        cfg.stages[0].fields = Some(StateFields {
            end_time: "event_time_ts".into(),
            new_row: vec!["instance_id".into()],
            update_row: vec!["instance_id".into()],
            reset_row: Vec::new(),
        });
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("state_reconstruction"));
    }

    #[test]
    fn test_warehouse_config_clones_for_the_writer() {
        // The writer and the migrator each take an owned copy.
        let cfg = valid_config();
        let copy = cfg.warehouse.clone();
        assert_eq!(copy.endpoint, cfg.warehouse.endpoint);
        assert_eq!(copy.migrations.enabled, cfg.warehouse.migrations.enabled);
    }

    #[test]
    fn test_resolved_end_prefers_stage_override() {
        let mut stage = vm_stage();
        stage.end_date = Some("2019-04-01".to_string());
        assert_eq!(
            stage.resolved_end(Some("2020-01-01")),
            Some(1_554_076_799)
        );

        let stage = vm_stage();
        assert_eq!(stage.resolved_end(Some("2019-04-01")), Some(1_554_076_799));
        assert_eq!(stage.resolved_end(None), None);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
log_level: debug
warehouse:
  endpoint: localhost:9000
  database: modw_cloud
end_date: "2019-04-01"
stages:
  - name: account_states
    kind: state_reconstruction
    destination: account_state
    source:
      columns: [account_id, principal, start_time, end_time]
      base_sql: SELECT account_id, principal, start_time, end_time FROM raw_account_facts
      order_by:
        - { column: account_id, dir: desc }
        - { column: start_time, dir: asc }
    fields:
      end_time: end_time
      new_row: [account_id]
      update_row: [account_id, principal]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.stages[0].kind, StageKind::StateReconstruction);
        assert_eq!(
            cfg.stages[0].fields.as_ref().unwrap().reset_row,
            Vec::<String>::new()
        );
    }
}
