use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::journal::RunJournal;
use crate::pacing::Pacer;
use crate::processor::{PlaceProcessor, ProcessReport};
use crate::store::{PlaceRecord, PlaceStatus};

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Simultaneous `process_place` calls, each on a distinct id.
    pub concurrency: usize,
    /// Maximum number of places to run; skipped ids do not count.
    pub limit: Option<usize>,
    /// Fetch details and create the record for ids the store has never seen.
    pub register_unknown: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            limit: None,
            register_unknown: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyDone,
    Parked { status: PlaceStatus },
    NotDue { next_run_at: DateTime<Utc> },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlaceOutcome {
    Completed(ProcessReport),
    Skipped {
        place_id: String,
        #[serde(flatten)]
        reason: SkipReason,
    },
    Failed {
        place_id: String,
        error: String,
    },
}

impl PlaceOutcome {
    pub fn place_id(&self) -> &str {
        match self {
            PlaceOutcome::Completed(report) => &report.place_id,
            PlaceOutcome::Skipped { place_id, .. } | PlaceOutcome::Failed { place_id, .. } => {
                place_id
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Runnable ids left untouched because the limit was reached.
    pub deferred: usize,
    pub outcomes: Vec<PlaceOutcome>,
}

enum Plan {
    Run { register: bool },
    Skip(SkipReason),
}

/// Fans a worklist out over the processor. One failing id never stops the
/// others; its outcome is reported and the run goes on.
pub struct BatchDriver {
    processor: PlaceProcessor,
    journal: RunJournal,
    pacer: Pacer,
}

impl BatchDriver {
    pub fn new(processor: PlaceProcessor, journal: RunJournal, pacer: Pacer) -> Self {
        Self {
            processor,
            journal,
            pacer,
        }
    }

    pub fn processor(&self) -> &PlaceProcessor {
        &self.processor
    }

    pub async fn run(&self, ids: &[String], options: BatchOptions) -> BatchReport {
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut report = BatchReport::default();
        let mut slots: Vec<Option<PlaceOutcome>> = Vec::new();
        let mut runnable: Vec<(usize, String, bool)> = Vec::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.plan(id, now, options.register_unknown) {
                Ok(Plan::Run { register }) => {
                    if options.limit.is_some_and(|limit| runnable.len() >= limit) {
                        report.deferred += 1;
                        continue;
                    }
                    runnable.push((slots.len(), id.clone(), register));
                    slots.push(None);
                }
                Ok(Plan::Skip(reason)) => slots.push(Some(PlaceOutcome::Skipped {
                    place_id: id.clone(),
                    reason,
                })),
                Err(err) => slots.push(Some(PlaceOutcome::Failed {
                    place_id: id.clone(),
                    error: err.to_string(),
                })),
            }
        }

        info!(
            target: "batch_driver",
            requested = ids.len(),
            runnable = runnable.len(),
            deferred = report.deferred,
            concurrency = options.concurrency,
            "batch starting"
        );
        self.journal_event(
            "run_started",
            None,
            json!({ "requested": ids.len(), "runnable": runnable.len() }),
        );

        let finished: Vec<(usize, PlaceOutcome)> =
            stream::iter(runnable.into_iter().map(|(slot, id, register)| async move {
                (slot, self.run_one(id, register).await)
            }))
            .buffer_unordered(options.concurrency.max(1))
            .collect()
            .await;
        for (slot, outcome) in finished {
            slots[slot] = Some(outcome);
        }

        for outcome in slots.into_iter().flatten() {
            match &outcome {
                PlaceOutcome::Completed(done) => {
                    report.completed += 1;
                    self.journal_event(
                        "place_completed",
                        Some(done.place_id.as_str()),
                        json!({
                            "stages": done.stages,
                            "listing_url": done.listing_url,
                            "reviews_inserted": done.reviews_inserted,
                        }),
                    );
                }
                PlaceOutcome::Skipped { place_id, reason } => {
                    report.skipped += 1;
                    self.journal_event("place_skipped", Some(place_id.as_str()), json!(reason));
                }
                PlaceOutcome::Failed { place_id, error } => {
                    report.failed += 1;
                    self.journal_event(
                        "place_failed",
                        Some(place_id.as_str()),
                        json!({ "error": error }),
                    );
                }
            }
            report.outcomes.push(outcome);
        }

        info!(
            target: "batch_driver",
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            deferred = report.deferred,
            "batch finished"
        );
        self.journal_event(
            "run_finished",
            None,
            json!({
                "completed": report.completed,
                "skipped": report.skipped,
                "failed": report.failed,
                "deferred": report.deferred,
            }),
        );
        if let Err(err) = self.journal.flush() {
            warn!(target: "batch_driver", ?err, "failed to flush run journal");
        }
        report
    }

    fn plan(&self, place_id: &str, now: DateTime<Utc>, register_unknown: bool) -> AppResult<Plan> {
        let Some(record) = self.processor.store().get_place(place_id)? else {
            return Ok(if register_unknown {
                Plan::Run { register: true }
            } else {
                Plan::Skip(SkipReason::Unknown)
            });
        };
        Ok(skip_reason(&record, now)
            .map(Plan::Skip)
            .unwrap_or(Plan::Run { register: false }))
    }

    async fn run_one(&self, place_id: String, register: bool) -> PlaceOutcome {
        match self.register_and_process(&place_id, register).await {
            Ok(report) => PlaceOutcome::Completed(report),
            Err(err) => {
                warn!(target: "batch_driver", place_id = %place_id, error = %err, "place failed");
                PlaceOutcome::Failed {
                    place_id,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn register_and_process(
        &self,
        place_id: &str,
        register: bool,
    ) -> AppResult<ProcessReport> {
        if register {
            self.register(place_id).await?;
        }
        self.processor.process_place(place_id).await
    }

    /// The record only comes into being once provider A knows the id.
    async fn register(&self, place_id: &str) -> AppResult<()> {
        let fetched = self
            .processor
            .details_provider()
            .fetch_details(place_id)
            .await;
        self.pacer.pause().await;
        let details = fetched?.ok_or_else(|| AppError::PlaceUnavailable(place_id.to_string()))?;
        self.processor.store().insert_place(place_id, &details)?;
        info!(target: "batch_driver", place_id, name = %details.name, "registered new place");
        Ok(())
    }

    fn journal_event(&self, event: &str, place_id: Option<&str>, detail: serde_json::Value) {
        if let Err(err) = self.journal.record(event, place_id, detail) {
            warn!(target: "batch_driver", ?err, event, "failed to record journal event");
        }
    }
}

/// Why the driver leaves a stored record alone, if it does.
pub fn skip_reason(record: &PlaceRecord, now: DateTime<Utc>) -> Option<SkipReason> {
    if record.status == PlaceStatus::Done {
        return Some(SkipReason::AlreadyDone);
    }
    if record.status.is_terminal() {
        return Some(SkipReason::Parked {
            status: record.status,
        });
    }
    match record.next_run_at {
        Some(next_run_at) if next_run_at > now => Some(SkipReason::NotDue { next_run_at }),
        _ => None,
    }
}
