//! Read-only mount-table queries backed by the `findmnt` host executable.
//!
//! Ground: this is the teacher's own `findmnt.rs` almost unchanged — same
//! recursive JSON-tree filter, same udev-style source normalisation — with
//! one additional requested column (`PROPAGATION`) needed by the mount
//! manager's shared-propagation check (§4.2/§9 "Mount propagation").

use crate::error::EngineError;
use lazy_static::lazy_static;
use serde_json::Value;
use std::{collections::HashMap, process::Command};

const TARGET_KEY: &str = "target";
const SOURCE_KEY: &str = "source";
const FSTYPE_KEY: &str = "fstype";
const PROPAGATION_KEY: &str = "propagation";

const KEYS: &[&str] = &[TARGET_KEY, SOURCE_KEY, FSTYPE_KEY, PROPAGATION_KEY];

#[derive(Debug)]
pub struct MountEntry {
    pub target: String,
    pub source: String,
    pub fstype: String,
    pub propagation: String,
}

#[derive(Debug)]
struct Filter<'a> {
    key: &'a str,
    value: &'a str,
}

/// Convert a json value of a key-value pair to a string, adjusted if
/// required on the key.
///
/// The source field returned from findmnt can be different for the same
/// source on different systems, for example
///   dev[/nvme0n1], udev[/nvme0n1], tmpfs[/nvme0n1], devtmpfs[/nvme0n1]
/// this function converts those values to the expected /dev/nvme0n1.
fn key_adjusted_value(key: &str, value: &Value) -> String {
    lazy_static! {
        static ref RE_UDEVPATH: regex::Regex =
            regex::Regex::new(r"(?x).*\[(?P<device>/.*)\]\s*").unwrap();
    }

    let strvalue: String = match value {
        Value::String(str) => str.to_string(),
        _ => value.to_string(),
    };
    if key == SOURCE_KEY {
        if let Some(caps) = RE_UDEVPATH.captures(&strvalue) {
            return format!("/dev{}", &caps["device"]);
        };
    }
    strvalue
}

fn jsonmap_to_hashmap(json_map: &serde_json::Map<String, Value>) -> HashMap<String, String> {
    let mut hmap: HashMap<String, String> = HashMap::new();
    for (key, value) in json_map {
        if KEYS.contains(&key.as_str()) {
            hmap.insert(key.clone(), key_adjusted_value(key, value));
        }
    }
    hmap
}

/// Recurse over the de-serialised JSON returned by findmnt, finding entries
/// which have a key-value pair matching the filter, and collect those
/// entries as hashmaps of strings. The search is deliberately generic to be
/// robust against future findmnt output changes.
fn filter_findmnt(json_val: &Value, filter: &Filter, results: &mut Vec<HashMap<String, String>>) {
    match json_val {
        Value::Array(json_array) => {
            for jsonvalue in json_array {
                filter_findmnt(jsonvalue, filter, results);
            }
        }
        Value::Object(json_map) => {
            if let Some(value) = json_map.get(filter.key) {
                if filter.value == value || filter.value == key_adjusted_value(filter.key, value) {
                    results.push(jsonmap_to_hashmap(json_map));
                }
            }
            for jsonvalue in json_map.values() {
                if jsonvalue.is_array() {
                    filter_findmnt(jsonvalue, filter, results);
                }
            }
        }
        jvalue => {
            tracing::warn!("unexpected json type in findmnt output: {}", jvalue);
        }
    };
}

const FIND_MNT: &str = "findmnt";
const FIND_MNT_ARGS: [&str; 3] = ["-J", "-o", "SOURCE,TARGET,FSTYPE,PROPAGATION"];

/// Apply `filter` against findmnt's JSON output, already read as a string.
/// Split out from `findmnt()` so the filtering logic is testable against
/// canned fixtures without spawning the real executable.
fn parse_and_filter(json_str: &str, filter: &Filter) -> Result<Vec<HashMap<String, String>>, EngineError> {
    let json: Value = serde_json::from_str(json_str)?;
    let mut results = Vec::new();
    filter_findmnt(&json, filter, &mut results);
    Ok(results)
}

/// Execute findmnt, collect the json output, apply the filter and return
/// the matching entries. Returns an empty vector (not an error) when
/// findmnt exits non-zero with no matching mounts — its documented way of
/// saying "nothing found".
fn findmnt(params: Filter) -> Result<Vec<HashMap<String, String>>, EngineError> {
    let output = Command::new(FIND_MNT)
        .args(&FIND_MNT_ARGS)
        .output()
        .map_err(|_| EngineError::missing_tool("findmnt", FIND_MNT))?;

    if output.status.success() {
        let json_str = String::from_utf8(output.stdout)?;
        parse_and_filter(&json_str, &params)
    } else if output.stdout.is_empty() {
        Ok(Vec::new())
    } else {
        Err(EngineError::new(
            "findmnt",
            String::from_utf8(output.stderr)?,
        ))
    }
}

fn entries_from_maps(maps: Vec<HashMap<String, String>>) -> Result<Vec<MountEntry>, EngineError> {
    maps.into_iter()
        .map(|entry| {
            Ok(MountEntry {
                target: entry
                    .get(TARGET_KEY)
                    .cloned()
                    .ok_or_else(|| EngineError::new("findmnt", "missing target field"))?,
                source: entry
                    .get(SOURCE_KEY)
                    .cloned()
                    .ok_or_else(|| EngineError::new("findmnt", "missing source field"))?,
                fstype: entry.get(FSTYPE_KEY).cloned().unwrap_or_default(),
                propagation: entry.get(PROPAGATION_KEY).cloned().unwrap_or_default(),
            })
        })
        .collect()
}

/// Look up every mount-table entry whose `target` equals `target_path`.
pub fn entries_for_target(target_path: &str) -> Result<Vec<MountEntry>, EngineError> {
    let filtered = findmnt(Filter {
        key: TARGET_KEY,
        value: target_path,
    })?;
    entries_from_maps(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "filesystems": [
            {
                "source": "/dev/loop3",
                "target": "/var/lib/kubelet/plugins/local-sparse/vol-a",
                "fstype": "ext4",
                "propagation": "shared"
            },
            {
                "source": "udev[/nvme0n1]",
                "target": "/dev",
                "fstype": "devtmpfs",
                "propagation": "private"
            }
        ]
    }"#;

    #[test]
    fn filters_by_target() {
        let filter = Filter {
            key: TARGET_KEY,
            value: "/var/lib/kubelet/plugins/local-sparse/vol-a",
        };
        let maps = parse_and_filter(FIXTURE, &filter).unwrap();
        assert_eq!(maps.len(), 1);
        let entries = entries_from_maps(maps).unwrap();
        assert_eq!(entries[0].source, "/dev/loop3");
        assert_eq!(entries[0].propagation, "shared");
    }

    #[test]
    fn no_match_returns_empty() {
        let filter = Filter {
            key: TARGET_KEY,
            value: "/not/mounted",
        };
        let maps = parse_and_filter(FIXTURE, &filter).unwrap();
        assert!(maps.is_empty());
    }

    #[test]
    fn normalizes_udev_source() {
        let filter = Filter {
            key: TARGET_KEY,
            value: "/dev",
        };
        let maps = parse_and_filter(FIXTURE, &filter).unwrap();
        let entries = entries_from_maps(maps).unwrap();
        assert_eq!(entries[0].source, "/dev/nvme0n1");
    }

    #[test]
    fn detects_non_shared_propagation() {
        let filter = Filter {
            key: TARGET_KEY,
            value: "/dev",
        };
        let maps = parse_and_filter(FIXTURE, &filter).unwrap();
        let entries = entries_from_maps(maps).unwrap();
        assert_ne!(entries[0].propagation, "shared");
    }
}
