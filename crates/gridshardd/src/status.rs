//! Status mode: print the partition table stored in a directory file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use gridshard_core::{ControllerKey, key_for};
use gridshard_directory::{InstanceRecord, RedbDirectory};
use gridshard_partition::PartitionView;

#[derive(Debug, Serialize)]
pub struct TypeStatus {
    pub controller_type: String,
    /// "ok", or why the records do not cover the keyspace exactly.
    pub coverage: String,
    pub instances: Vec<InstanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_owner: Option<ItemOwner>,
}

/// Which instance's range a workload item hashes into.
#[derive(Debug, Serialize)]
pub struct ItemOwner {
    pub item: String,
    pub key: ControllerKey,
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub range: String,
    pub lowerbound: ControllerKey,
    pub upperbound: ControllerKey,
    pub controller_key: ControllerKey,
    pub workload_num: u32,
    pub is_locked: bool,
    pub version: u64,
    pub last_heartbeat: u64,
}

/// Read the directory file and summarize one or all controller types.
/// With `item`, also report which instance owns that workload item.
///
/// redb allows one process per file, so this fails while a daemon holds it.
pub fn collect(
    path: &Path,
    controller_type: Option<&str>,
    item: Option<&str>,
) -> anyhow::Result<Vec<TypeStatus>> {
    anyhow::ensure!(path.exists(), "no directory at {}", path.display());
    let directory = RedbDirectory::open(path)
        .with_context(|| format!("open {} (is a daemon running?)", path.display()))?;
    let records = directory
        .list_all()?
        .into_iter()
        .filter(|r| controller_type.is_none_or(|t| r.controller_type == t))
        .collect();
    Ok(summarize(records, item))
}

/// Group records by type and derive each type's partition table.
pub fn summarize(records: Vec<InstanceRecord>, item: Option<&str>) -> Vec<TypeStatus> {
    let mut by_type: BTreeMap<String, Vec<InstanceRecord>> = BTreeMap::new();
    for record in records {
        by_type
            .entry(record.controller_type.clone())
            .or_default()
            .push(record);
    }

    by_type
        .into_iter()
        .map(|(controller_type, records)| {
            let view = PartitionView::from_records(&records);
            let coverage = match view.validate_coverage() {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            };
            let instances = view
                .entries()
                .iter()
                .filter_map(|entry| {
                    let record = records.iter().find(|r| r.name == entry.instance_name)?;
                    Some(InstanceStatus {
                        name: entry.instance_name.clone(),
                        range: entry.range().to_string(),
                        lowerbound: entry.lowerbound_key,
                        upperbound: entry.controller_key,
                        controller_key: record.controller_key,
                        workload_num: entry.workload_num,
                        is_locked: entry.is_locked,
                        version: record.version,
                        last_heartbeat: record.last_heartbeat,
                    })
                })
                .collect();
            let item_owner = item.map(|item| {
                let key = key_for(item);
                ItemOwner {
                    item: item.to_string(),
                    key,
                    instance: view.owner_of(key).map(|e| e.instance_name.clone()),
                }
            });
            TypeStatus {
                controller_type,
                coverage,
                instances,
                item_owner,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridshard_core::MAX_KEY;
    use gridshard_directory::Directory;

    fn record(name: &str, controller_type: &str, key: i64) -> InstanceRecord {
        InstanceRecord::new(name, controller_type, key, false)
    }

    #[test]
    fn summarize_groups_by_type() {
        let report = summarize(
            vec![
                record("c1", "cluster", MAX_KEY),
                record("c0", "cluster", 100),
                record("s0", "site", MAX_KEY),
            ],
            None,
        );
        assert_eq!(report.len(), 2);

        let cluster = &report[0];
        assert_eq!(cluster.controller_type, "cluster");
        assert_eq!(cluster.coverage, "ok");
        assert_eq!(cluster.instances[0].name, "c0");
        assert_eq!(cluster.instances[0].range, "[0, 100]");
        assert_eq!(cluster.instances[1].lowerbound, 100);
        assert_eq!(report[1].instances.len(), 1);
    }

    #[test]
    fn unextended_rightmost_shows_claimed_key() {
        let report = summarize(vec![record("c0", "cluster", 100), record("c1", "cluster", 500)], None);
        let last = &report[0].instances[1];
        assert_eq!(last.upperbound, MAX_KEY);
        assert_eq!(last.controller_key, 500);
    }

    #[test]
    fn duplicate_keys_reported_in_coverage() {
        let report = summarize(
            vec![
                record("c0", "cluster", 100),
                record("c1", "cluster", 100),
                record("c2", "cluster", MAX_KEY),
            ],
            None,
        );
        assert!(report[0].coverage.contains("malformed"));
    }

    #[test]
    fn item_owner_follows_item_key() {
        let item = "us-east-1";
        let key = key_for(item);
        let records = vec![record("low", "cluster", key), record("high", "cluster", MAX_KEY)];
        let report = summarize(records, Some(item));
        let owner = report[0].item_owner.as_ref().unwrap();
        assert_eq!(owner.key, key);
        assert_eq!(owner.instance.as_deref(), Some("low"));

        let report = summarize(vec![record("only", "cluster", MAX_KEY)], None);
        assert!(report[0].item_owner.is_none());
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("item_owner"));
    }

    #[test]
    fn collect_reads_directory_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridshard.redb");
        {
            let directory = RedbDirectory::open(&path).unwrap();
            directory.create(&record("c0", "cluster", MAX_KEY)).unwrap();
            directory.create(&record("s0", "site", MAX_KEY)).unwrap();
        }

        let report = collect(&path, Some("site"), None).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].instances[0].name, "s0");

        let json = serde_json::to_string(&collect(&path, None, None).unwrap()).unwrap();
        assert!(json.contains("\"coverage\":\"ok\""));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect(&dir.path().join("absent.redb"), None, None).is_err());
    }
}
