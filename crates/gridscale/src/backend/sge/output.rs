//! Parsers of Grid Engine command outputs.
use std::time::SystemTime;

use anyhow::Context;
use chrono::TimeZone;
use gridcore::ScaleResult;
use gridcore::common::Map;
use gridcore::job::{AllocationRule, Job, JobState};
use gridcore::resource::{Cpu, CustomResource, Memory};

/// Format of job submission and start times in `qstat` output.
const QSTAT_DATETIME_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Queue instance (`queue@host`) line of `qstat -f`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInstance {
    pub queue: String,
    pub host: String,
    pub reserved: Cpu,
    pub used: Cpu,
    pub total: Cpu,
    pub states: String,
}

impl QueueInstance {
    pub fn free_slots(&self) -> Cpu {
        self.total
            .saturating_sub(self.used.saturating_add(self.reserved))
    }

    /// Disabled (`d`) or suspended (`s`, `S`) instances do not accept jobs.
    pub fn is_disabled(&self) -> bool {
        self.states.contains(['d', 's', 'S'])
    }

    /// Unknown (`u`), error (`E`) and orphaned (`o`) instances are broken.
    pub fn is_broken(&self) -> bool {
        self.states.contains(['u', 'E', 'o'])
    }
}

#[derive(Debug, Default)]
pub struct QstatReport {
    pub jobs: Vec<Job>,
    pub instances: Vec<QueueInstance>,
}

#[derive(Debug)]
struct QstatJob {
    id: String,
    root_id: String,
    name: String,
    user: String,
    state: JobState,
    submit_time: SystemTime,
    slots: Cpu,
    pe: Option<(String, Cpu)>,
    resources: Vec<(String, String)>,
    hard_queues: Vec<String>,
    hosts: Vec<String>,
}

impl QstatJob {
    fn into_job(self) -> Job {
        let mut requests: Map<String, String> = Map::default();
        let mut gpu = 0;
        let mut mem = 0;
        for (name, value) in self.resources {
            match name.as_str() {
                "gpus" => gpu = parse_amount(&value).map(|v| v.ceil() as u32).unwrap_or(0),
                "mem" | "h_vmem" | "mem_free" => {
                    mem = parse_memory_gib(&value).map(|v| v.ceil() as Memory).unwrap_or(0)
                }
                _ => {}
            }
            requests.insert(name, value);
        }
        let (pe, cpu) = match self.pe {
            Some((pe, slots)) => (Some(pe), slots),
            None => (None, self.slots),
        };
        Job {
            id: self.id,
            root_id: self.root_id,
            name: self.name,
            user: self.user,
            state: self.state,
            submit_time: self.submit_time,
            pe,
            cpu,
            gpu,
            mem,
            hosts: self.hosts,
            requests,
        }
    }
}

/// Parses the output of `qstat -u "*" -r -f`.
///
/// Jobs that explicitly request other queues than `queue` are skipped. A job running on
/// several hosts is listed under each of its queue instances, its hosts are merged.
pub fn parse_qstat(output: &str, queue: &str) -> ScaleResult<QstatReport> {
    let mut instances = Vec::new();
    let mut jobs: Vec<QstatJob> = Vec::new();
    let mut job_index: Map<String, usize> = Map::default();
    let mut current_host: Option<String> = None;
    let mut current_jobs: Vec<usize> = Vec::new();
    let mut current_label: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty()
            || trimmed.starts_with("queuename")
            || trimmed.starts_with('-')
            || trimmed.starts_with('#')
        {
            if trimmed.contains("PENDING JOBS") {
                current_host = None;
            }
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            let instance = parse_queue_instance(trimmed)
                .with_context(|| format!("Cannot parse qstat queue line `{trimmed}`"))?;
            current_host = Some(instance.host.clone());
            current_jobs.clear();
            instances.push(instance);
            continue;
        }

        let first = trimmed.split_whitespace().next().unwrap_or_default();
        if first.chars().all(|c| c.is_ascii_digit()) {
            let parsed = parse_job_line(trimmed)
                .with_context(|| format!("Cannot parse qstat job line `{trimmed}`"))?;
            current_jobs.clear();
            current_label = None;
            for job in parsed {
                let index = match job_index.get(&job.id) {
                    Some(index) => *index,
                    None => {
                        job_index.insert(job.id.clone(), jobs.len());
                        jobs.push(job);
                        jobs.len() - 1
                    }
                };
                if let Some(host) = &current_host {
                    if !jobs[index].hosts.contains(host) {
                        jobs[index].hosts.push(host.clone());
                    }
                }
                current_jobs.push(index);
            }
            continue;
        }

        if current_jobs.is_empty() {
            continue;
        }
        let (label, value) = match split_label(trimmed) {
            Some((label, value)) => {
                current_label = Some(label.to_string());
                (label.to_string(), value)
            }
            None => match &current_label {
                Some(label) => (label.clone(), trimmed),
                None => continue,
            },
        };
        for index in &current_jobs {
            apply_job_detail(&mut jobs[*index], &label, value)?;
        }
    }

    let jobs = jobs
        .into_iter()
        .filter(|job| job.hard_queues.is_empty() || job.hard_queues.iter().any(|q| q == queue))
        .map(|job| job.into_job())
        .collect();
    Ok(QstatReport { jobs, instances })
}

fn parse_queue_instance(line: &str) -> ScaleResult<QueueInstance> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 3 {
        anyhow::bail!("Expected at least 3 columns, found {}", columns.len());
    }
    let (queue, host) = columns[0]
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("Missing host in queue instance {}", columns[0]))?;
    let slots: Vec<Cpu> = columns[2]
        .split('/')
        .map(|value| value.parse::<Cpu>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("Invalid slot counts {}", columns[2]))?;
    let (reserved, used, total) = match slots.as_slice() {
        [reserved, used, total] => (*reserved, *used, *total),
        [used, total] => (0, *used, *total),
        _ => anyhow::bail!("Invalid slot counts {}", columns[2]),
    };
    // Columns: queuename qtype resv/used/tot load_avg arch [states]
    let states = columns.get(5).copied().unwrap_or_default().to_string();
    Ok(QueueInstance {
        queue: queue.to_string(),
        host: host.to_string(),
        reserved,
        used,
        total,
        states,
    })
}

/// Parses a job line, pending array jobs produce one job per task.
fn parse_job_line(line: &str) -> ScaleResult<Vec<QstatJob>> {
    // Columns: job-ID prior name user state submit/start-at(date time) [queue] slots [ja-task-ID]
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 8 {
        anyhow::bail!("Expected at least 8 columns, found {}", columns.len());
    }
    let id = columns[0];
    let submit_time = parse_qstat_datetime(&format!("{} {}", columns[5], columns[6]))?;
    let rest = &columns[7..];
    let (slots, tasks) = match rest {
        [slots] => (*slots, None),
        [first, second] if first.contains('@') => (*second, None),
        [slots, tasks] => (*slots, Some(*tasks)),
        [_queue, slots, tasks, ..] => (*slots, Some(*tasks)),
        [] => anyhow::bail!("Missing slot count"),
    };
    let slots: Cpu = slots
        .parse()
        .with_context(|| format!("Invalid slot count {slots}"))?;

    let template = QstatJob {
        id: id.to_string(),
        root_id: id.to_string(),
        name: columns[2].to_string(),
        user: columns[3].to_string(),
        state: parse_job_state(columns[4]),
        submit_time,
        slots,
        pe: None,
        resources: vec![],
        hard_queues: vec![],
        hosts: vec![],
    };
    let Some(tasks) = tasks else {
        return Ok(vec![template]);
    };
    Ok(parse_task_ids(tasks)?
        .into_iter()
        .map(|task| QstatJob {
            id: format!("{id}.{task}"),
            root_id: template.root_id.clone(),
            name: template.name.clone(),
            user: template.user.clone(),
            state: template.state,
            submit_time: template.submit_time,
            slots: template.slots,
            pe: None,
            resources: vec![],
            hard_queues: vec![],
            hosts: vec![],
        })
        .collect())
}

/// Upper bound of pending tasks taken from a single array job line.
///
/// The remaining tasks stay in the pending range and are listed again by later qstat calls.
const MAX_ARRAY_TASKS: usize = 1000;

/// Task ids in the form `3`, `1-10:2` or `1,4,7`, at most [`MAX_ARRAY_TASKS`] of them.
fn parse_task_ids(tasks: &str) -> ScaleResult<Vec<u64>> {
    let mut ids = Vec::new();
    for part in tasks.split(',') {
        let (range, step) = match part.split_once(':') {
            Some((range, step)) => (range, step.parse::<u64>()?),
            None => (part, 1),
        };
        let left = MAX_ARRAY_TASKS - ids.len();
        match range.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (start.parse::<u64>()?, end.parse::<u64>()?);
                ids.extend((start..=end).step_by(step.max(1) as usize).take(left));
            }
            None => ids.push(range.parse::<u64>()?),
        }
        if ids.len() >= MAX_ARRAY_TASKS {
            log::debug!("Array tasks {tasks} were truncated to the first {MAX_ARRAY_TASKS}");
            break;
        }
    }
    Ok(ids)
}

fn parse_job_state(state: &str) -> JobState {
    if state.contains('E') {
        JobState::Error
    } else if state.contains('d') {
        JobState::Deleted
    } else if state.contains(['s', 'S', 'T']) {
        JobState::Suspended
    } else if state.contains(['r', 't']) {
        JobState::Running
    } else if state.contains(['q', 'w']) {
        JobState::Pending
    } else {
        JobState::Unknown
    }
}

fn parse_qstat_datetime(value: &str) -> ScaleResult<SystemTime> {
    let datetime = chrono::NaiveDateTime::parse_from_str(value, QSTAT_DATETIME_FORMAT)
        .with_context(|| format!("Invalid date {value}"))?;
    let local = chrono::Local
        .from_local_datetime(&datetime)
        .earliest()
        .ok_or_else(|| anyhow::anyhow!("Date {value} does not exist in the local timezone"))?;
    Ok(local.into())
}

/// Splits `Label:   value` detail lines. Resource continuation lines (`h_rt=1:00:00`) are not
/// labels.
fn split_label(line: &str) -> Option<(&str, &str)> {
    let (label, value) = line.split_once(':')?;
    if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
        return None;
    }
    Some((label.trim(), value.trim()))
}

fn apply_job_detail(job: &mut QstatJob, label: &str, value: &str) -> ScaleResult<()> {
    match label {
        "Full jobname" => job.name = value.to_string(),
        "Requested PE" => {
            let (name, slots) = value
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow::anyhow!("Invalid requested PE {value}"))?;
            // Slot ranges (`2-8`) are satisfied by their lower bound
            let slots = slots.trim();
            let lower = slots.split('-').next().unwrap_or(slots);
            let slots: Cpu = lower
                .parse()
                .with_context(|| format!("Invalid PE slot count {slots}"))?;
            job.pe = Some((name.to_string(), slots));
        }
        "Hard Resources" => {
            // `name=value (urgency)`
            let request = value.split_whitespace().next().unwrap_or_default();
            if let Some((name, amount)) = request.split_once('=') {
                job.resources.push((name.to_string(), amount.to_string()));
            }
        }
        "Hard requested queues" => {
            job.hard_queues
                .extend(value.split(',').map(|q| q.trim().to_string()).filter(|q| !q.is_empty()));
        }
        _ => {}
    }
    Ok(())
}

/// Numeric amount, memory suffixes are accepted and ignored.
fn parse_amount(value: &str) -> Option<f64> {
    value
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .parse()
        .ok()
}

/// Memory amount (`512M`, `7.5G`, `1T`, bytes without a suffix) in GiB.
pub fn parse_memory_gib(value: &str) -> Option<f64> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(index) => value.split_at(index),
        None => (value, ""),
    };
    let number: f64 = number.parse().ok()?;
    let divisor = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1024.0 * 1024.0 * 1024.0,
        "K" | "KB" => 1024.0 * 1024.0,
        "M" | "MB" => 1024.0,
        "G" | "GB" => 1.0,
        "T" | "TB" => 1.0 / 1024.0,
        _ => return None,
    };
    Some(number / divisor)
}

/// Host line of `qhost -F`.
#[derive(Debug, Clone, PartialEq)]
pub struct QhostEntry {
    pub host: String,
    pub cpu: Cpu,
    /// Total memory in GiB.
    pub mem_total: f64,
    /// Resource values reported by `-F` (`hc:gpus=1.000000`), keyed by resource name.
    pub values: Map<String, f64>,
}

impl QhostEntry {
    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// Parses the output of `qhost -F <resources>`. The `global` pseudo host is skipped.
pub fn parse_qhost(output: &str) -> ScaleResult<Vec<QhostEntry>> {
    let mut lines = output.lines();
    let header = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty qhost output"))?;
    let columns: Vec<&str> = header.split_whitespace().collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow::anyhow!("Missing column {name} in qhost output"))
    };
    let cpu_column = column("NCPU")?;
    let mem_column = column("MEMTOT")?;

    let mut hosts: Vec<QhostEntry> = Vec::new();
    let mut skip_values = false;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('-') {
            continue;
        }
        if line.starts_with(char::is_whitespace) {
            if skip_values {
                continue;
            }
            let Some(host) = hosts.last_mut() else {
                continue;
            };
            // `hc:gpus=1.000000`
            let Some((_, resource)) = trimmed.split_once(':') else {
                continue;
            };
            if let Some((name, value)) = resource.split_once('=') {
                if let Some(amount) = parse_memory_gib(value)
                    .filter(|_| value.ends_with(|c: char| c.is_ascii_alphabetic()))
                    .or_else(|| value.parse().ok())
                {
                    host.values.insert(name.to_string(), amount);
                }
            }
            continue;
        }
        let values: Vec<&str> = trimmed.split_whitespace().collect();
        if values[0] == "global" {
            skip_values = true;
            continue;
        }
        skip_values = false;
        let cpu = values
            .get(cpu_column)
            .and_then(|v| v.parse::<Cpu>().ok())
            .unwrap_or(0);
        let mem_total = values
            .get(mem_column)
            .and_then(|v| parse_memory_gib(v))
            .unwrap_or(0.0);
        hosts.push(QhostEntry {
            host: values[0].to_string(),
            cpu,
            mem_total,
            values: Map::default(),
        });
    }
    Ok(hosts)
}

/// Value of a `key value` attribute in `qconf -s*` outputs. Lines continued by `\` are joined.
pub fn qconf_attribute(output: &str, key: &str) -> Option<String> {
    let mut joined = String::new();
    let mut result = None;
    for line in output.lines() {
        joined.push_str(line.trim_end().trim_end_matches('\\'));
        if line.trim_end().ends_with('\\') {
            continue;
        }
        let entry = std::mem::take(&mut joined);
        let mut parts = entry.trim().splitn(2, char::is_whitespace);
        if parts.next() == Some(key) {
            result = Some(parts.next().unwrap_or_default().trim().to_string());
        }
    }
    result
}

/// Parses `allocation_rule` of `qconf -sp <pe>`.
///
/// A fixed number of slots per host spreads the job across hosts, as `$fill_up` does.
pub fn parse_allocation_rule(output: &str) -> ScaleResult<AllocationRule> {
    let rule = qconf_attribute(output, "allocation_rule")
        .ok_or_else(|| anyhow::anyhow!("Missing allocation_rule in PE configuration"))?;
    match rule.as_str() {
        "$pe_slots" => Ok(AllocationRule::PeSlots),
        "$round_robin" => Ok(AllocationRule::RoundRobin),
        "$fill_up" => Ok(AllocationRule::FillUp),
        fixed if fixed.parse::<u32>().is_ok() => Ok(AllocationRule::FillUp),
        other => anyhow::bail!("Unknown allocation rule {other}"),
    }
}

/// Parses `complex_values` of `qconf -se global`, e.g. `license=10,gpus_global=4`.
pub fn parse_complex_values(output: &str) -> CustomResource {
    let Some(values) = qconf_attribute(output, "complex_values") else {
        return CustomResource::default();
    };
    if values == "NONE" {
        return CustomResource::default();
    }
    CustomResource::new(values.split(',').filter_map(|entry| {
        let (name, value) = entry.trim().split_once('=')?;
        match parse_amount(value) {
            Some(amount) => Some((name.to_string(), amount.floor() as u64)),
            None => {
                log::warn!("Ignoring non-numeric global resource {name}={value}");
                None
            }
        }
    }))
}
