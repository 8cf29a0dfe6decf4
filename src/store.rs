//! In-memory job matches and message threads, mirrored to the database on
//! every mutation and broadcast to subscribers afterwards.
//!
//! Mutations never fail. A failed write is logged and the in-memory state
//! stays authoritative until the next successful write.

use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Subscription};
use crate::db::Database;
use crate::models::{
    Candidate, DashboardStats, JobMatch, JobMatchPayload, ThreadMap, ThreadMessage, STATUS_PENDING,
};

pub struct Store {
    db: Database,
    jobs: Vec<JobMatch>,
    threads: ThreadMap,
    job_bus: Bus<Vec<JobMatch>>,
    thread_bus: Bus<ThreadMap>,
}

impl Store {
    /// Loads persisted state from `db` and takes ownership of it.
    pub fn init(db: Database) -> Self {
        let jobs = db.load_jobs();
        let threads = db.load_threads();
        info!(
            path = %db.path().display(),
            jobs = jobs.len(),
            threads = threads.len(),
            "Loaded local state"
        );
        Self {
            db,
            jobs,
            threads,
            job_bus: Bus::new(),
            thread_bus: Bus::new(),
        }
    }

    /// Discards in-memory state in favour of what was last persisted.
    pub fn reset(&mut self) {
        self.jobs = self.db.load_jobs();
        self.threads = self.db.load_threads();
        self.notify_all();
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // --- Reads ---

    pub fn jobs(&self) -> &[JobMatch] {
        &self.jobs
    }

    pub fn job(&self, job_id: &str) -> Option<&JobMatch> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn threads(&self) -> &ThreadMap {
        &self.threads
    }

    pub fn threads_for(&self, job_id: &str) -> &[ThreadMessage] {
        self.threads.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn approved_candidates(&self, job_id: &str) -> Vec<Candidate> {
        self.job(job_id)
            .map(|job| job.approved_candidates().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> DashboardStats {
        DashboardStats::from_jobs(&self.jobs)
    }

    // --- Subscriptions ---

    pub fn subscribe_jobs<F>(&self, observer: F) -> Subscription
    where
        F: FnMut(Vec<JobMatch>) + 'static,
    {
        let subscription = self.job_bus.subscribe(observer);
        debug!(observers = self.job_bus.len(), "Job observer registered");
        subscription
    }

    pub fn subscribe_threads<F>(&self, observer: F) -> Subscription
    where
        F: FnMut(ThreadMap) + 'static,
    {
        let subscription = self.thread_bus.subscribe(observer);
        debug!(observers = self.thread_bus.len(), "Thread observer registered");
        subscription
    }

    // --- Job matches ---

    /// Inserts a first-seen job at the front with every candidate pending, or
    /// merges a re-delivery over the existing record. On re-delivery the
    /// candidate list is replaced by the incoming one, and candidates seen
    /// before keep the status a human gave them.
    pub fn upsert_job_match(&mut self, mut payload: JobMatchPayload) {
        let Some(incoming) = payload.candidates.take() else {
            warn!(job_id = %payload.job_id, "Ignoring job match without candidates");
            return;
        };
        let incoming = dedupe_candidates(incoming);

        match self.jobs.iter().position(|j| j.job_id == payload.job_id) {
            Some(idx) => {
                let existing = &mut self.jobs[idx];
                let candidates: Vec<Candidate> = incoming
                    .into_iter()
                    .map(|mut candidate| {
                        candidate.status = existing
                            .candidates
                            .iter()
                            .find(|c| c.candidate_id == candidate.candidate_id)
                            .map(|c| c.status.clone())
                            .filter(|s| !s.is_empty())
                            .unwrap_or_else(|| STATUS_PENDING.to_string());
                        candidate
                    })
                    .collect();
                existing.apply(payload);
                existing.candidates = candidates;
                debug!(job_id = %existing.job_id, "Merged job match re-delivery");
            }
            None => {
                let mut job = JobMatch::new(payload.job_id.clone());
                job.apply(payload);
                job.candidates = incoming
                    .into_iter()
                    .map(|mut candidate| {
                        candidate.status = STATUS_PENDING.to_string();
                        candidate
                    })
                    .collect();
                job.created_at = Some(now());
                // Messages may have arrived before the job itself.
                if let Some(thread) = self.threads.get(&job.job_id) {
                    (job.unread_count, job.thread_count) = thread_counts(thread);
                }
                info!(job_id = %job.job_id, candidates = job.candidates.len(), "New job match");
                self.jobs.insert(0, job);
            }
        }

        self.persist_jobs();
        self.job_bus.notify(&self.jobs);
    }

    /// Sets a candidate's status verbatim. Returns `false`, without touching
    /// anything, when the job or the candidate is unknown.
    pub fn update_candidate_status(&mut self, job_id: &str, candidate_id: &str, status: &str) -> bool {
        let Some(candidate) = self
            .jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .and_then(|j| j.candidates.iter_mut().find(|c| c.candidate_id == candidate_id))
        else {
            debug!(job_id, candidate_id, "Status update for unknown candidate ignored");
            return false;
        };
        candidate.status = status.to_string();

        self.persist_jobs();
        self.job_bus.notify(&self.jobs);
        true
    }

    pub fn set_job_status(&mut self, job_id: &str, status: &str) -> bool {
        let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == job_id) else {
            return false;
        };
        job.status = Some(status.to_string());

        self.persist_jobs();
        self.job_bus.notify(&self.jobs);
        true
    }

    pub fn clear_all(&mut self) {
        self.jobs.clear();
        self.threads.clear();
        self.persist_all();
        self.notify_all();
    }

    /// Drops the job and its thread. Returns whether the job existed; state
    /// is written and broadcast either way.
    pub fn remove_job(&mut self, job_id: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.job_id != job_id);
        self.threads.remove(job_id);
        self.persist_all();
        self.notify_all();
        self.jobs.len() != before
    }

    // --- Threads ---

    /// Appends `message` unless a message with the same id is already in the
    /// job's thread. Returns whether the message was added.
    pub fn append_thread_message(&mut self, job_id: &str, message: ThreadMessage) -> bool {
        let thread = self.threads.entry(job_id.to_string()).or_default();
        if thread.iter().any(|m| m.id == message.id) {
            debug!(job_id, message_id = %message.id, "Duplicate thread message ignored");
            return false;
        }
        let unread = message.is_unread_inbound();
        thread.push(message);
        let thread_len = thread.len();

        if let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == job_id) {
            if unread {
                job.unread_count += 1;
            }
            job.thread_count = thread_len;
        }

        self.persist_all();
        self.notify_all();
        true
    }

    /// Replaces the job's thread wholesale and recomputes its counters.
    pub fn replace_threads(&mut self, job_id: &str, messages: Vec<ThreadMessage>) {
        let counts = thread_counts(&messages);
        self.threads.insert(job_id.to_string(), messages);

        if let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == job_id) {
            (job.unread_count, job.thread_count) = counts;
        }

        self.persist_all();
        self.notify_all();
    }

    /// Marks every message in the job's thread as read. Returns `false` when
    /// the job has no thread.
    pub fn mark_threads_read(&mut self, job_id: &str) -> bool {
        let Some(thread) = self.threads.get(job_id) else {
            return false;
        };
        let read: Vec<ThreadMessage> = thread
            .iter()
            .cloned()
            .map(|mut m| {
                m.is_read = true;
                m
            })
            .collect();
        self.threads.insert(job_id.to_string(), read);

        if let Some(job) = self.jobs.iter_mut().find(|j| j.job_id == job_id) {
            job.unread_count = 0;
        }

        self.persist_all();
        self.notify_all();
        true
    }

    // --- Persistence and fan-out ---

    fn persist_jobs(&self) {
        if let Err(e) = self.db.save_jobs(&self.jobs) {
            warn!(error = %format!("{:#}", e), "Failed to save job matches");
        }
    }

    fn persist_threads(&self) {
        if let Err(e) = self.db.save_threads(&self.threads) {
            warn!(error = %format!("{:#}", e), "Failed to save threads");
        }
    }

    fn persist_all(&self) {
        self.persist_jobs();
        self.persist_threads();
    }

    fn notify_all(&self) {
        self.job_bus.notify(&self.jobs);
        self.thread_bus.notify(&self.threads);
    }
}

/// `(unread inbound, total)` for a thread.
fn thread_counts(thread: &[ThreadMessage]) -> (usize, usize) {
    let unread = thread.iter().filter(|m| m.is_unread_inbound()).count();
    (unread, thread.len())
}

fn dedupe_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.candidate_id.clone()))
        .collect()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{STATUS_APPROVED, STATUS_REJECTED};
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn store() -> Store {
        Store::init(Database::open_in_memory().unwrap())
    }

    fn payload(value: Value) -> JobMatchPayload {
        serde_json::from_value(value).unwrap()
    }

    fn message(value: Value) -> ThreadMessage {
        serde_json::from_value(value).unwrap()
    }

    fn candidate<'a>(store: &'a Store, job_id: &str, candidate_id: &str) -> &'a Candidate {
        store
            .job(job_id)
            .unwrap()
            .candidates
            .iter()
            .find(|c| c.candidate_id == candidate_id)
            .unwrap()
    }

    #[test]
    fn test_new_job_forces_pending_and_is_prepended() {
        let mut store = store();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [{ "candidate_id": "C1", "status": "approved" }]
        })));
        store.upsert_job_match(payload(json!({ "job_id": "J2", "candidates": [] })));

        let ids: Vec<&str> = store.jobs().iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["J2", "J1"]);
        assert_eq!(candidate(&store, "J1", "C1").status, STATUS_PENDING);
        assert!(store.job("J1").unwrap().created_at.is_some());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut store = store();
        let job = json!({
            "job_id": "J1",
            "job_title": "Senior Java Developer",
            "required_skills": ["Java", "Kafka"],
            "candidates": [
                { "candidate_id": "C1", "match_score": 92 },
                { "candidate_id": "C2", "candidate_skills": "Java, AWS" }
            ]
        });
        store.upsert_job_match(payload(job.clone()));
        let once = store.jobs().to_vec();
        store.upsert_job_match(payload(job));

        assert_eq!(store.jobs(), once.as_slice());
    }

    #[test]
    fn test_redelivery_preserves_status_and_drops_absent_candidates() {
        let mut store = store();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [{ "candidate_id": "C1" }, { "candidate_id": "C3" }]
        })));
        assert!(store.update_candidate_status("J1", "C1", STATUS_APPROVED));
        assert_eq!(candidate(&store, "J1", "C1").status, STATUS_APPROVED);

        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "job_title": "Renamed",
            "candidates": [
                { "candidate_id": "C1", "match_score": 50, "status": "pending" },
                { "candidate_id": "C2" }
            ]
        })));

        let job = store.job("J1").unwrap();
        assert_eq!(job.job_title.as_deref(), Some("Renamed"));
        assert_eq!(job.candidates.len(), 2);
        assert_eq!(candidate(&store, "J1", "C1").status, STATUS_APPROVED);
        assert_eq!(candidate(&store, "J1", "C1").match_score, Some(50.0));
        assert_eq!(candidate(&store, "J1", "C2").status, STATUS_PENDING);
        assert_eq!(store.jobs().len(), 1);
    }

    #[test]
    fn test_redelivery_keeps_created_at_and_position() {
        let mut store = store();
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        let created = store.job("J1").unwrap().created_at.clone();
        store.upsert_job_match(payload(json!({ "job_id": "J2", "candidates": [] })));
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));

        assert_eq!(store.job("J1").unwrap().created_at, created);
        assert_eq!(store.jobs()[1].job_id, "J1");
    }

    #[test]
    fn test_duplicate_candidate_ids_in_payload_keep_first() {
        let mut store = store();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [
                { "candidate_id": "C1", "candidate_name": "John Smith" },
                { "candidate_id": "C1", "candidate_name": "Duplicate" }
            ]
        })));
        let job = store.job("J1").unwrap();
        assert_eq!(job.candidates.len(), 1);
        assert_eq!(job.candidates[0].candidate_name.as_deref(), Some("John Smith"));
    }

    #[test]
    fn test_upsert_without_candidates_is_ignored() {
        let mut store = store();
        let notified = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&notified);
        let _sub = store.subscribe_jobs(move |_| *counter.borrow_mut() += 1);

        store.upsert_job_match(payload(json!({ "job_id": "J1" })));
        assert!(store.jobs().is_empty());
        assert_eq!(*notified.borrow(), 0);
    }

    #[test]
    fn test_status_update_on_unknown_target_is_noop() {
        let mut store = store();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [{ "candidate_id": "C1" }]
        })));
        assert!(!store.update_candidate_status("J9", "C1", STATUS_APPROVED));
        assert!(!store.update_candidate_status("J1", "C9", STATUS_APPROVED));
        assert_eq!(candidate(&store, "J1", "C1").status, STATUS_PENDING);

        // Any string is stored verbatim.
        assert!(store.update_candidate_status("J1", "C1", "shortlisted"));
        assert_eq!(candidate(&store, "J1", "C1").status, "shortlisted");
    }

    #[test]
    fn test_approved_candidates_and_job_status() {
        let mut store = store();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [{ "candidate_id": "C1" }, { "candidate_id": "C2" }]
        })));
        store.update_candidate_status("J1", "C1", STATUS_APPROVED);
        store.update_candidate_status("J1", "C2", STATUS_REJECTED);

        let approved = store.approved_candidates("J1");
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].candidate_id, "C1");
        assert!(store.approved_candidates("J9").is_empty());

        assert!(store.set_job_status("J1", "submitted"));
        assert_eq!(store.job("J1").unwrap().status.as_deref(), Some("submitted"));
        assert!(!store.set_job_status("J9", "submitted"));
        assert_eq!(store.stats().pending_approvals, 0);
    }

    #[test]
    fn test_append_dedupes_and_counts_unread() {
        let mut store = store();
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        let m1 = message(json!({ "id": "m1", "direction": "inbound", "is_read": false, "body": "hi" }));

        assert!(store.append_thread_message("J1", m1.clone()));
        let job = store.job("J1").unwrap();
        assert_eq!((job.unread_count, job.thread_count), (1, 1));

        assert!(!store.append_thread_message("J1", m1));
        let job = store.job("J1").unwrap();
        assert_eq!((job.unread_count, job.thread_count), (1, 1));
        assert_eq!(store.threads_for("J1").len(), 1);

        store.append_thread_message(
            "J1",
            message(json!({ "id": "m2", "direction": "outbound", "body": "hello" })),
        );
        let job = store.job("J1").unwrap();
        assert_eq!((job.unread_count, job.thread_count), (1, 2));

        assert!(store.mark_threads_read("J1"));
        assert_eq!(store.job("J1").unwrap().unread_count, 0);
        assert!(store.threads_for("J1").iter().all(|m| m.is_read));
    }

    #[test]
    fn test_append_for_unknown_job_keeps_thread() {
        let mut store = store();
        store.append_thread_message(
            "J9",
            message(json!({ "id": "m1", "direction": "inbound", "body": "early" })),
        );
        assert_eq!(store.threads_for("J9").len(), 1);
        assert!(store.jobs().is_empty());
    }

    #[test]
    fn test_job_inserted_after_its_messages_counts_them() {
        let mut store = store();
        store.append_thread_message(
            "J1",
            message(json!({ "id": "m1", "direction": "inbound", "body": "early" })),
        );
        store.append_thread_message(
            "J1",
            message(json!({ "id": "m2", "direction": "outbound", "body": "reply" })),
        );

        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));

        let job = store.job("J1").unwrap();
        assert_eq!(job.unread_count, 1);
        assert_eq!(job.thread_count, store.threads_for("J1").len());
        assert_eq!(job.thread_count, 2);
    }

    #[test]
    fn test_replace_threads_recomputes_counts() {
        let mut store = store();
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        store.append_thread_message(
            "J1",
            message(json!({ "id": "old", "direction": "inbound", "body": "stale" })),
        );

        store.replace_threads(
            "J1",
            vec![
                message(json!({ "id": "a", "direction": "inbound", "is_read": true, "body": "1" })),
                message(json!({ "id": "b", "direction": "inbound", "body": "2" })),
                message(json!({ "id": "c", "direction": "outbound", "body": "3" })),
                message(json!({ "id": "d", "direction": "inbound", "body": "4" })),
            ],
        );

        let job = store.job("J1").unwrap();
        assert_eq!((job.unread_count, job.thread_count), (2, 4));
        assert!(store.threads_for("J1").iter().all(|m| m.id != "old"));

        store.append_thread_message(
            "J1",
            message(json!({ "id": "e", "direction": "inbound", "body": "5" })),
        );
        let job = store.job("J1").unwrap();
        let expected = store.threads_for("J1").iter().filter(|m| m.is_unread_inbound()).count();
        assert_eq!(job.unread_count, expected);
        assert_eq!(job.thread_count, 5);
    }

    #[test]
    fn test_mark_read_without_thread_is_noop() {
        let mut store = store();
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        assert!(!store.mark_threads_read("J1"));
    }

    #[test]
    fn test_mark_read_does_not_mutate_delivered_snapshots() {
        let mut store = store();
        store.append_thread_message(
            "J1",
            message(json!({ "id": "m1", "direction": "inbound", "body": "hi" })),
        );
        let seen: Rc<RefCell<Vec<ThreadMap>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let _sub = store.subscribe_threads(move |snapshot| sink.borrow_mut().push(snapshot));

        store.mark_threads_read("J1");
        store.append_thread_message(
            "J1",
            message(json!({ "id": "m2", "direction": "inbound", "body": "again" })),
        );

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["J1"].len(), 1);
        assert!(seen[0]["J1"][0].is_read);
        assert_eq!(seen[1]["J1"].len(), 2);
    }

    #[test]
    fn test_each_observer_notified_once_per_mutation() {
        let mut store = store();
        let job_hits = Rc::new(RefCell::new(Vec::new()));
        let thread_hits = Rc::new(RefCell::new(0));

        let subs: Vec<Subscription> = (0..3)
            .map(|n| {
                let hits = Rc::clone(&job_hits);
                store.subscribe_jobs(move |jobs| hits.borrow_mut().push((n, jobs.len())))
            })
            .collect();
        let counter = Rc::clone(&thread_hits);
        let _thread_sub = store.subscribe_threads(move |_| *counter.borrow_mut() += 1);

        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        assert_eq!(*job_hits.borrow(), vec![(0, 1), (1, 1), (2, 1)]);
        assert_eq!(*thread_hits.borrow(), 0);

        store.remove_job("J1");
        assert_eq!(job_hits.borrow().len(), 6);
        assert_eq!(job_hits.borrow()[5], (2, 0));
        assert_eq!(*thread_hits.borrow(), 1);

        subs[1].unsubscribe();
        store.clear_all();
        assert_eq!(job_hits.borrow().len(), 8);
        assert_eq!(*thread_hits.borrow(), 2);
    }

    #[test]
    fn test_remove_job_drops_thread() {
        let mut store = store();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [{ "candidate_id": "C1" }]
        })));
        store.append_thread_message(
            "J1",
            message(json!({ "id": "m1", "direction": "inbound", "is_read": false, "body": "hi" })),
        );

        assert!(store.remove_job("J1"));
        assert!(store.jobs().is_empty());
        assert!(!store.threads().contains_key("J1"));
        assert!(!store.remove_job("J1"));
    }

    #[test]
    fn test_clear_all_persists_empty_state() {
        let mut store = store();
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        store.append_thread_message(
            "J1",
            message(json!({ "id": "m1", "direction": "inbound", "body": "hi" })),
        );
        store.clear_all();

        assert!(store.db().load_jobs().is_empty());
        assert!(store.db().load_threads().is_empty());
    }

    #[test]
    fn test_state_is_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailtrix.db");
        {
            let mut store = Store::init(Database::open_at(&path).unwrap());
            store.upsert_job_match(payload(json!({
                "job_id": "J1",
                "candidates": [{ "candidate_id": "C1" }]
            })));
            store.update_candidate_status("J1", "C1", STATUS_APPROVED);
            store.append_thread_message(
                "J1",
                message(json!({ "id": "m1", "direction": "inbound", "body": "hi" })),
            );
        }

        let store = Store::init(Database::open_at(&path).unwrap());
        assert_eq!(candidate(&store, "J1", "C1").status, STATUS_APPROVED);
        assert_eq!(store.threads_for("J1").len(), 1);
        assert_eq!(store.job("J1").unwrap().unread_count, 1);
    }

    #[test]
    fn test_reset_reloads_persisted_state() {
        let mut store = store();
        store.upsert_job_match(payload(json!({ "job_id": "J1", "candidates": [] })));
        store.jobs.clear();
        store.reset();
        assert_eq!(store.jobs().len(), 1);
    }

    #[test]
    fn test_storage_failure_keeps_memory_state() {
        let mut store = store();
        store.db().break_storage();
        store.upsert_job_match(payload(json!({
            "job_id": "J1",
            "candidates": [{ "candidate_id": "C1" }]
        })));
        assert!(store.update_candidate_status("J1", "C1", STATUS_APPROVED));
        assert_eq!(candidate(&store, "J1", "C1").status, STATUS_APPROVED);
    }
}
