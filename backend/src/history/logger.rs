use chrono::{DateTime, Local, NaiveDate};
use shared::{HistoryResponse, LogEntry, NO_DATA, Prediction, RequestType, Statistics};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use super::store::{LogStore, StorageError};

/// Predictions stored with each entry, top one included.
const STORED_PREDICTIONS: usize = 3;

struct LogState {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    store: Box<dyn LogStore>,
    appended_since_compaction: usize,
}

/// Append-only record of successful classifications, plus statistics derived
/// from it on every read.
///
/// Id assignment, the store write and the in-memory append happen under one
/// write lock, so readers only ever see whole entries and a clear is never
/// interleaved with a record.
pub struct PredictionLogger {
    state: RwLock<LogState>,
    max_entries: usize,
    default_limit: usize,
}

impl PredictionLogger {
    pub fn open(
        mut store: Box<dyn LogStore>,
        max_entries: usize,
        default_limit: usize,
    ) -> Result<Self, StorageError> {
        let replay = store.load()?;
        let skip = replay.entries.len().saturating_sub(max_entries);
        let entries: VecDeque<LogEntry> = replay.entries.into_iter().skip(skip).collect();
        log::info!(
            "Prediction log ({}) opened with {} entries, next id {}",
            store.describe(),
            entries.len(),
            replay.next_id
        );

        Ok(Self {
            state: RwLock::new(LogState {
                entries,
                next_id: replay.next_id,
                store,
                appended_since_compaction: 0,
            }),
            max_entries,
            default_limit,
        })
    }

    pub fn record(
        &self,
        filename: &str,
        request_type: RequestType,
        predictions: &[Prediction],
        processing_time: f64,
        user_ip: Option<&str>,
    ) -> Result<LogEntry, StorageError> {
        let top_prediction = predictions
            .first()
            .cloned()
            .ok_or_else(|| StorageError::InvalidEntry("no predictions to record".into()))?;

        let mut state = self.state.write().map_err(|_| StorageError::Poisoned)?;
        let entry = LogEntry {
            id: state.next_id,
            timestamp: Local::now(),
            filename: filename.to_string(),
            request_type,
            top_prediction,
            total_predictions: predictions.len(),
            all_predictions: predictions.iter().take(STORED_PREDICTIONS).cloned().collect(),
            processing_time,
            user_ip: user_ip.map(str::to_string),
        };

        state.store.append(&entry)?;
        state.next_id += 1;
        state.entries.push_back(entry.clone());

        while state.entries.len() > self.max_entries {
            state.entries.pop_front();
        }
        state.appended_since_compaction += 1;
        if state.appended_since_compaction >= self.max_entries {
            let LogState {
                entries,
                next_id,
                store,
                appended_since_compaction,
            } = &mut *state;
            let retained: Vec<LogEntry> = entries.iter().cloned().collect();
            match store.reset(*next_id, &retained) {
                Ok(()) => *appended_since_compaction = 0,
                Err(e) => log::error!("Prediction log compaction failed: {}", e),
            }
        }

        log::debug!("Recorded {} prediction log entry {}", entry.request_type, entry.id);
        Ok(entry)
    }

    /// Newest-first page of at most `limit` entries with statistics over the
    /// whole retained log.
    pub fn query(&self, limit: Option<usize>) -> Result<HistoryResponse, StorageError> {
        self.query_filtered(limit, |_| true)
    }

    /// Like [`query`](Self::query), restricted to entries logged on `date`
    /// (server-local calendar day).
    pub fn query_date(&self, date: NaiveDate, limit: Option<usize>) -> Result<HistoryResponse, StorageError> {
        self.query_filtered(limit, |entry| entry.timestamp.date_naive() == date)
    }

    fn query_filtered<F>(&self, limit: Option<usize>, keep: F) -> Result<HistoryResponse, StorageError>
    where
        F: Fn(&LogEntry) -> bool,
    {
        let limit = limit.unwrap_or(self.default_limit);
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        let logs = state
            .entries
            .iter()
            .rev()
            .filter(|entry| keep(entry))
            .take(limit)
            .cloned()
            .collect();
        let statistics = compute_statistics(state.entries.iter(), Local::now().date_naive());
        Ok(HistoryResponse { logs, statistics })
    }

    pub fn statistics(&self) -> Result<Statistics, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        Ok(compute_statistics(state.entries.iter(), Local::now().date_naive()))
    }

    /// Empties the log. On a store failure the log is left untouched.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| StorageError::Poisoned)?;
        let next_id = state.next_id;
        state.store.reset(next_id, &[])?;
        let removed = state.entries.len();
        state.entries.clear();
        state.appended_since_compaction = 0;
        log::info!("Cleared {} prediction log entries", removed);
        Ok(())
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        Ok(state.entries.len())
    }
}

/// Aggregates over `entries`, which must be in ascending id order.
pub fn compute_statistics<'a>(entries: impl Iterator<Item = &'a LogEntry>, today: NaiveDate) -> Statistics {
    let mut total = 0usize;
    let mut today_count = 0usize;
    let mut single = 0usize;
    let mut batch = 0usize;
    let mut confidence_sum = 0.0f64;
    let mut class_counts: HashMap<&str, usize> = HashMap::new();
    let mut first_seen: Vec<&str> = Vec::new();

    for entry in entries {
        total += 1;
        if is_on_day(&entry.timestamp, today) {
            today_count += 1;
        }
        match entry.request_type {
            RequestType::Single => single += 1,
            RequestType::Batch => batch += 1,
        }
        confidence_sum += entry.top_prediction.confidence as f64;

        let name = entry.top_prediction.class_name.as_str();
        let count = class_counts.entry(name).or_insert(0);
        if *count == 0 {
            first_seen.push(name);
        }
        *count += 1;
    }

    if total == 0 {
        return Statistics::default();
    }

    // Strictly greater, so the earliest class wins a tie.
    let mut most_common = NO_DATA;
    let mut best = 0;
    for name in first_seen {
        let count = class_counts[name];
        if count > best {
            best = count;
            most_common = name;
        }
    }

    let average = confidence_sum / total as f64 * 100.0;
    Statistics {
        total_predictions: total,
        today_predictions: today_count,
        single_requests: single,
        batch_requests: batch,
        average_confidence: (average * 100.0).round() / 100.0,
        most_common_class: most_common.to_string(),
    }
}

fn is_on_day(timestamp: &DateTime<Local>, day: NaiveDate) -> bool {
    timestamp.date_naive() == day
}
