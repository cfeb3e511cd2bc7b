//! CSV artifacts written at the end of a run.
//!
//! One directory per simulation, one file per series. Per-node files are
//! prefixed with the node name; resource columns are the union of the
//! resources seen in that series, sorted, with `0` for samples that lack a
//! resource.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::fs::File;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::api::{Node, ObjectKey, ResourceList, RESOURCE_CPU, RESOURCE_MEMORY};
use crate::observer::{Record, Stats};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Writes every stats series under `dir`, creating it if needed.
pub fn export_stats(dir: &Path, stats: &Stats) -> Result<(), ExportError> {
    fs::create_dir_all(dir)?;

    write_durations(
        &dir.join("pod_pending_durations.csv"),
        "pending_time_milliseconds",
        &stats.pending_durations,
    )?;
    write_durations(
        &dir.join("pod_running_durations.csv"),
        "running_time_milliseconds",
        &stats.running_durations,
    )?;
    write_queue_length(&dir.join("pod_queue_length.csv"), &stats.pending_q_history)?;

    for (node, history) in &stats.allocation_history {
        write_resource_history(
            &dir.join(format!("{}_allocation_history.csv", node.name)),
            history,
        )?;
    }
    for (node, history) in &stats.allocation_ratio_history {
        write_ratio_history(
            &dir.join(format!("{}_allocation_ratio_history.csv", node.name)),
            history,
        )?;
    }
    for (node, history) in &stats.free_history {
        write_resource_history(
            &dir.join(format!("{}_free_resource_history.csv", node.name)),
            history,
        )?;
    }

    write_event_history(&dir.join("event_history.csv"), stats)?;
    Ok(())
}

fn write_durations(
    path: &Path,
    column: &str,
    durations: &HashMap<ObjectKey, Duration>,
) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["pod_uid", "pod_name", column])?;

    let mut rows: Vec<(&ObjectKey, &Duration)> = durations.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    for (key, duration) in rows {
        writer.write_record([
            key.uid.as_str(),
            key.name.as_str(),
            &duration.as_millis().to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_queue_length(path: &Path, history: &[Record<usize>]) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["timestamp", "length"])?;

    let mut rows: Vec<&Record<usize>> = history.iter().collect();
    rows.sort_by_key(|record| record.at);
    for record in rows {
        writer.write_record([format_ts(record.at), record.value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_resource_history(
    path: &Path,
    history: &[Record<ResourceList>],
) -> Result<(), ExportError> {
    let resources: BTreeSet<&String> = history
        .iter()
        .flat_map(|record| record.value.keys())
        .collect();

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["timestamp".to_string()];
    header.extend(resources.iter().map(|r| r.to_string()));
    writer.write_record(&header)?;

    for record in history {
        let mut row = vec![format_ts(record.at)];
        for resource in &resources {
            row.push(
                record
                    .value
                    .get(*resource)
                    .map(|q| q.milli_value().to_string())
                    .unwrap_or_else(|| "0".to_string()),
            );
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_ratio_history(
    path: &Path,
    history: &[Record<BTreeMap<String, f64>>],
) -> Result<(), ExportError> {
    let resources: BTreeSet<&String> = history
        .iter()
        .flat_map(|record| record.value.keys())
        .collect();

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["timestamp".to_string()];
    header.extend(resources.iter().map(|r| r.to_string()));
    writer.write_record(&header)?;

    for record in history {
        let mut row = vec![format_ts(record.at)];
        for resource in &resources {
            row.push(
                record
                    .value
                    .get(*resource)
                    .map(|ratio| format!("{ratio:.2}"))
                    .unwrap_or_else(|| "0".to_string()),
            );
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_event_history(path: &Path, stats: &Stats) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "timestamp",
        "pod_name",
        "node_name",
        "phase",
        "event_type",
        "cpu_req",
        "mem_req",
    ])?;

    for record in &stats.pod_event_history {
        let event = &record.value;
        writer.write_record([
            format_ts(record.at).as_str(),
            &event.pod_name,
            &event.node_name,
            event.phase,
            event.event_type,
            &event.cpu_req,
            &event.mem_req,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Plain-text run summary next to the CSVs.
pub fn write_run_info(
    dir: &Path,
    simulation_id: &str,
    scenario_name: &str,
    started_at: DateTime<Utc>,
    nodes: &[Node],
) -> Result<(), ExportError> {
    fs::create_dir_all(dir)?;
    let mut file = File::create(dir.join("simulation_info.txt"))?;

    writeln!(file, "simulation: {simulation_id}")?;
    writeln!(file, "scenario:   {scenario_name}")?;
    writeln!(file, "started:    {}", started_at.to_rfc3339())?;
    writeln!(file, "nodes:")?;
    for node in nodes {
        let cpu = node
            .status
            .capacity
            .get(RESOURCE_CPU)
            .map(|q| q.to_string())
            .unwrap_or_else(|| "-".to_string());
        let memory = node
            .status
            .capacity
            .get(RESOURCE_MEMORY)
            .map(|q| q.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(file, "  {} cpu={} memory={}", node.name(), cpu, memory)?;
    }
    Ok(())
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}
