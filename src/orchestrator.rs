//! Runs the probe suite
//!
//! Three phases:
//!
//! 1. **Dispatch**: every concurrent probe is spawned on one [`JoinSet`].
//! 2. **Await**: results are collected as they finish. The first error or
//!    panic aborts every remaining task and ends the run.
//! 3. **Finalize**: the connection ceiling probe runs alone, after all
//!    others have finished, because it saturates the broker.

use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::probes::{self, CheckResult, Probe};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinSet};

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// One result per executed probe, in dispatch order, ceiling probe last
    pub results: Vec<CheckResult>,
}

fn serialize_secs<S: serde::Serializer>(
    elapsed: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

impl AuditReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.pass).count()
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.pass)
    }

    pub fn get(&self, name: &str) -> Option<&CheckResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Probe scheduler for one broker
pub struct Orchestrator {
    config: Arc<AuditConfig>,
    probes: Vec<Arc<dyn Probe>>,
    finale: Option<Arc<dyn Probe>>,
}

impl Orchestrator {
    /// The full suite for a validated configuration
    pub fn new(config: AuditConfig) -> crate::Result<Self> {
        config.validate()?;
        let probes = probes::default_suite(&config);
        Ok(Self::with_probes(config, probes, Some(probes::ceiling_probe())))
    }

    /// A custom set of probes; `finale` runs alone after the others
    pub fn with_probes(
        config: AuditConfig,
        probes: Vec<Arc<dyn Probe>>,
        finale: Option<Arc<dyn Probe>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            probes,
            finale,
        }
    }

    pub async fn run(&self) -> crate::Result<AuditReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        log::info!("Dispatch: starting {} probes", self.probes.len());
        let mut tasks = JoinSet::new();
        let mut names = HashMap::with_capacity(self.probes.len());
        for (index, probe) in self.probes.iter().enumerate() {
            let probe = probe.clone();
            let config = self.config.clone();
            let name = probe.name();
            let handle =
                tasks.spawn(async move { (index, run_probe(probe.as_ref(), &config).await) });
            names.insert(handle.id(), name);
        }

        log::info!("Await: collecting results");
        let mut results = collect_results(tasks, &names).await?;

        if let Some(finale) = &self.finale {
            log::info!("Finalize: running [{}] alone", finale.name());
            match run_probe(finale.as_ref(), &self.config).await {
                Ok(check) => results.push(check),
                Err(e) => {
                    log::error!("Failed to execute probe [{}]: {}", finale.name(), e);
                    return Err(e);
                }
            }
        }

        let elapsed = start.elapsed();
        log::info!("Audit finished in {:.2}s, {} probes", elapsed.as_secs_f64(), results.len());

        Ok(AuditReport {
            started_at,
            elapsed,
            results,
        })
    }
}

type ProbeTask = (usize, crate::Result<CheckResult>);

/// Await every task in dispatch order; the first failure aborts the rest
///
/// `names` maps task ids to probe names so a task that never returned is
/// still attributed.
async fn collect_results(
    mut tasks: JoinSet<ProbeTask>,
    names: &HashMap<task::Id, &'static str>,
) -> crate::Result<Vec<CheckResult>> {
    let mut collected = Vec::with_capacity(names.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, (index, result)) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                tasks.abort_all();
                let probe = names.get(&e.id()).copied().unwrap_or("unknown");
                log::error!("Probe task [{}] did not complete: {}", probe, e);
                return Err(AuditError::TaskFailed {
                    probe: probe.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        match result {
            Ok(check) => collected.push((index, check)),
            Err(e) => {
                let probe = names.get(&id).copied().unwrap_or("unknown");
                log::error!("Failed to execute probe [{}]: {}", probe, e);
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    collected.sort_by_key(|(index, _)| *index);
    Ok(collected.into_iter().map(|(_, check)| check).collect())
}

/// Run one probe, attributing both errors and panics to it
async fn run_probe(probe: &dyn Probe, config: &AuditConfig) -> crate::Result<CheckResult> {
    let name = probe.name();
    log::info!("Start running probe [{}]", name);

    let result = match AssertUnwindSafe(probe.run(config)).catch_unwind().await {
        Ok(result) => result.map_err(|e| e.in_probe(name)),
        Err(panic) => Err(AuditError::TaskFailed {
            probe: name.to_string(),
            reason: panic_message(panic.as_ref()),
        }),
    };

    if let Ok(check) = &result {
        log::info!(
            "Finish running probe [{}]: {}",
            name,
            if check.pass { "pass" } else { "do not pass" }
        );
    }
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "probe panicked".to_string()
    }
}
