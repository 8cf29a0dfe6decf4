use scraper::{Html, Node};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_REJECTED: &str = "rejected";

/// Message threads keyed by `job_id`.
pub type ThreadMap = BTreeMap<String, Vec<ThreadMessage>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, deserialize_with = "loose_opt_string", skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub candidate_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_email: Option<String>,
    #[serde(default, deserialize_with = "skill_list")]
    pub candidate_skills: Vec<String>,
    #[serde(default, deserialize_with = "loose_number", skip_serializing_if = "Option::is_none")]
    pub candidate_experience: Option<f64>,
    #[serde(default, deserialize_with = "loose_number", skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_reason: Option<String>,
    #[serde(default = "pending", deserialize_with = "status_or_pending")]
    pub status: String, // "pending", "approved", "rejected"
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTier {
    Excellent,
    Good,
    Fair,
}

impl ScoreTier {
    pub fn label(self) -> &'static str {
        match self {
            ScoreTier::Excellent => "excellent",
            ScoreTier::Good => "good",
            ScoreTier::Fair => "fair",
        }
    }
}

impl Candidate {
    pub fn score_tier(&self) -> ScoreTier {
        match self.match_score.unwrap_or(0.0) {
            s if s >= 85.0 => ScoreTier::Excellent,
            s if s >= 70.0 => ScoreTier::Good,
            _ => ScoreTier::Fair,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == STATUS_PENDING
    }

    pub fn is_approved(&self) -> bool {
        self.status == STATUS_APPROVED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMatch {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recruiter_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recruiter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "skill_list")]
    pub required_skills: Vec<String>,
    #[serde(default, deserialize_with = "loose_number", skip_serializing_if = "Option::is_none")]
    pub min_experience: Option<f64>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub unread_count: usize,
    #[serde(default)]
    pub thread_count: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobMatch {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_title: None,
            job_location: None,
            recruiter_email: None,
            recruiter_name: None,
            received_at: None,
            created_at: None,
            required_skills: Vec::new(),
            min_experience: None,
            candidates: Vec::new(),
            status: None,
            unread_count: 0,
            thread_count: 0,
            extra: Map::new(),
        }
    }

    /// Copies every field present in `payload` over this record. Candidates are
    /// left alone; the caller rebuilds them.
    pub fn apply(&mut self, payload: JobMatchPayload) {
        let JobMatchPayload {
            job_id: _,
            job_title,
            job_location,
            recruiter_email,
            recruiter_name,
            received_at,
            created_at,
            required_skills,
            min_experience,
            candidates: _,
            status,
            unread_count,
            thread_count,
            extra,
        } = payload;

        if job_title.is_some() {
            self.job_title = job_title;
        }
        if job_location.is_some() {
            self.job_location = job_location;
        }
        if recruiter_email.is_some() {
            self.recruiter_email = recruiter_email;
        }
        if recruiter_name.is_some() {
            self.recruiter_name = recruiter_name;
        }
        if received_at.is_some() {
            self.received_at = received_at;
        }
        if created_at.is_some() {
            self.created_at = created_at;
        }
        if let Some(skills) = required_skills {
            self.required_skills = skills;
        }
        if min_experience.is_some() {
            self.min_experience = min_experience;
        }
        if status.is_some() {
            self.status = status;
        }
        if let Some(count) = unread_count {
            self.unread_count = count;
        }
        if let Some(count) = thread_count {
            self.thread_count = count;
        }
        self.extra.extend(extra);
    }

    pub fn approved_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.is_approved())
    }

    pub fn pending_count(&self) -> usize {
        self.candidates.iter().filter(|c| c.is_pending()).count()
    }

    pub fn title(&self) -> &str {
        self.job_title.as_deref().unwrap_or("Untitled job")
    }
}

/// An incoming job match as delivered by the automation workflow. Every
/// descriptive field is optional so that a re-delivery only overrides what it
/// actually carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMatchPayload {
    #[serde(deserialize_with = "loose_string")]
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recruiter_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recruiter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "opt_skill_list", skip_serializing_if = "Option::is_none")]
    pub required_skills: Option<Vec<String>>,
    #[serde(default, deserialize_with = "loose_number", skip_serializing_if = "Option::is_none")]
    pub min_experience: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    #[serde(deserialize_with = "loose_string")]
    pub id: String,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_email: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(default, deserialize_with = "truthy")]
    pub is_read: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThreadMessage {
    pub fn is_unread_inbound(&self) -> bool {
        self.direction == Direction::Inbound && !self.is_read
    }

    pub fn display_name(&self) -> &str {
        if let Some(name) = self.from_name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        self.from_email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .unwrap_or("Unknown")
    }

    /// The message body as terminal-friendly text. HTML bodies win over the
    /// plain body, with block elements turned into line breaks.
    pub fn plain_text(&self) -> String {
        match self.body_html.as_deref().filter(|h| !h.trim().is_empty()) {
            Some(html) => html_to_text(html),
            None => self.body.clone(),
        }
    }
}

/// A thread message waiting in the staging area for the poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedThreadMessage {
    #[serde(deserialize_with = "loose_string")]
    pub job_id: String,
    pub message: ThreadMessage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DashboardStats {
    pub total_jobs: usize,
    pub pending_approvals: usize,
}

impl DashboardStats {
    pub fn from_jobs(jobs: &[JobMatch]) -> Self {
        Self {
            total_jobs: jobs.len(),
            pending_approvals: jobs.iter().map(JobMatch::pending_count).sum(),
        }
    }
}

/// Sample job match for trying the dashboard without a live workflow.
pub fn demo_job_match(job_id: impl Into<String>) -> JobMatchPayload {
    let candidate = |match_id: &str,
                     candidate_id: &str,
                     name: &str,
                     email: &str,
                     skills: &[&str],
                     experience: f64,
                     score: f64,
                     reason: &str| Candidate {
        match_id: Some(match_id.to_string()),
        candidate_id: candidate_id.to_string(),
        candidate_name: Some(name.to_string()),
        candidate_email: Some(email.to_string()),
        candidate_skills: skills.iter().map(|s| s.to_string()).collect(),
        candidate_experience: Some(experience),
        match_score: Some(score),
        match_reason: Some(reason.to_string()),
        status: pending(),
        extra: Map::new(),
    };

    JobMatchPayload {
        job_id: job_id.into(),
        job_title: Some("Senior Java Developer".to_string()),
        job_location: Some("San Francisco, CA".to_string()),
        recruiter_email: Some("recruiter@techvendor.com".to_string()),
        recruiter_name: Some("Sarah Johnson".to_string()),
        received_at: None,
        created_at: None,
        required_skills: Some(
            ["Java", "Spring Boot", "Microservices", "AWS", "Kafka"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        ),
        min_experience: Some(5.0),
        candidates: Some(vec![
            candidate(
                "MATCH001",
                "CAND001",
                "John Smith",
                "john.smith@email.com",
                &["Java", "Spring Boot", "AWS", "Docker"],
                7.0,
                92.0,
                "Strong Java/Spring expertise, AWS certified, local",
            ),
            candidate(
                "MATCH002",
                "CAND002",
                "Emily Chen",
                "emily.chen@email.com",
                &["Java", "Microservices", "Kafka", "Kubernetes"],
                5.0,
                87.0,
                "Excellent microservices experience, H1B ready",
            ),
            candidate(
                "MATCH003",
                "CAND003",
                "Michael Rodriguez",
                "michael.r@email.com",
                &["Java", "Spring", "React", "PostgreSQL"],
                6.0,
                74.0,
                "Good Java skills, willing to relocate",
            ),
        ]),
        status: None,
        unread_count: None,
        thread_count: None,
        extra: Map::new(),
    }
}

pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();
    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) if matches!(el.name(), "br" | "p" | "div" | "li") => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Accepts a JSON array or a comma-joined string and yields trimmed, non-empty
/// entries.
pub fn normalize_skills(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// JavaScript-style truthiness, which is what the workflow payloads assume.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn pending() -> String {
    STATUS_PENDING.to_string()
}

fn status_or_pending<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(loose_opt_string(d)?
        .filter(|s| !s.is_empty())
        .unwrap_or_else(pending))
}

fn skill_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(normalize_skills(Value::deserialize(d)?))
}

fn opt_skill_list<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => None,
        other => Some(normalize_skills(other)),
    })
}

fn loose_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn loose_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("expected a string identifier, found {}", other))),
    }
}

fn loose_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn truthy<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(is_truthy(Some(&value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_skills_accept_comma_joined_string() {
        let candidate: Candidate = serde_json::from_value(json!({
            "candidate_id": "C1",
            "candidate_skills": "Java, Spring Boot ,, AWS"
        }))
        .unwrap();
        assert_eq!(candidate.candidate_skills, vec!["Java", "Spring Boot", "AWS"]);
        assert_eq!(candidate.status, STATUS_PENDING);
    }

    #[test]
    fn test_candidate_skills_accept_array_and_null() {
        let candidate: Candidate = serde_json::from_value(json!({
            "candidate_id": "C1",
            "candidate_skills": ["Kafka", " Rust "]
        }))
        .unwrap();
        assert_eq!(candidate.candidate_skills, vec!["Kafka", "Rust"]);

        let candidate: Candidate = serde_json::from_value(json!({
            "candidate_id": "C2",
            "candidate_skills": null
        }))
        .unwrap();
        assert!(candidate.candidate_skills.is_empty());
    }

    #[test]
    fn test_numeric_ids_and_scores_are_tolerated() {
        let candidate: Candidate = serde_json::from_value(json!({
            "match_id": 17,
            "candidate_id": 42,
            "match_score": "88",
            "candidate_experience": 6
        }))
        .unwrap();
        assert_eq!(candidate.candidate_id, "42");
        assert_eq!(candidate.match_id.as_deref(), Some("17"));
        assert_eq!(candidate.match_score, Some(88.0));
        assert_eq!(candidate.score_tier(), ScoreTier::Excellent);
    }

    #[test]
    fn test_score_tiers() {
        let mut candidate: Candidate =
            serde_json::from_value(json!({ "candidate_id": "C1", "match_score": 70 })).unwrap();
        assert_eq!(candidate.score_tier(), ScoreTier::Good);
        candidate.match_score = Some(69.9);
        assert_eq!(candidate.score_tier(), ScoreTier::Fair);
        candidate.match_score = None;
        assert_eq!(candidate.score_tier().label(), "fair");
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let payload: JobMatchPayload = serde_json::from_value(json!({
            "job_id": "J1",
            "candidates": [],
            "workflow_run": "abc"
        }))
        .unwrap();
        assert_eq!(payload.extra.get("workflow_run"), Some(&json!("abc")));

        let mut job = JobMatch::new("J1");
        job.apply(payload);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["workflow_run"], json!("abc"));
    }

    #[test]
    fn test_apply_only_overrides_present_fields() {
        let mut job = JobMatch::new("J1");
        job.job_title = Some("Senior Java Developer".to_string());
        job.job_location = Some("San Francisco, CA".to_string());

        let payload: JobMatchPayload = serde_json::from_value(json!({
            "job_id": "J1",
            "job_location": "Remote",
            "required_skills": "Java, Kafka"
        }))
        .unwrap();
        job.apply(payload);

        assert_eq!(job.job_title.as_deref(), Some("Senior Java Developer"));
        assert_eq!(job.job_location.as_deref(), Some("Remote"));
        assert_eq!(job.required_skills, vec!["Java", "Kafka"]);
    }

    #[test]
    fn test_payload_requires_job_id() {
        let result = serde_json::from_value::<JobMatchPayload>(json!({ "candidates": [] }));
        assert!(result.is_err());
    }

    #[test]
    fn test_thread_message_is_read_truthiness() {
        let message: ThreadMessage = serde_json::from_value(json!({
            "id": "m1",
            "direction": "inbound",
            "body": "hi",
            "is_read": null
        }))
        .unwrap();
        assert!(!message.is_read);
        assert!(message.is_unread_inbound());

        let message: ThreadMessage = serde_json::from_value(json!({
            "id": "m2",
            "direction": "outbound",
            "body": "hello"
        }))
        .unwrap();
        assert!(!message.is_unread_inbound());
    }

    #[test]
    fn test_display_name_falls_back_to_email_local_part() {
        let mut message: ThreadMessage = serde_json::from_value(json!({
            "id": "m1",
            "direction": "inbound",
            "from_email": "sarah.johnson@techvendor.com"
        }))
        .unwrap();
        assert_eq!(message.display_name(), "sarah.johnson");

        message.from_name = Some("Sarah Johnson".to_string());
        assert_eq!(message.display_name(), "Sarah Johnson");

        message.from_name = None;
        message.from_email = None;
        assert_eq!(message.display_name(), "Unknown");
    }

    #[test]
    fn test_plain_text_prefers_html_body() {
        let message: ThreadMessage = serde_json::from_value(json!({
            "id": "m1",
            "direction": "inbound",
            "body": "fallback",
            "body_html": "<p>Thanks for the <strong>profiles</strong>.</p><p>Next week works.<br>Sarah</p>"
        }))
        .unwrap();
        assert_eq!(
            message.plain_text(),
            "Thanks for the profiles.\nNext week works.\nSarah"
        );
    }

    #[test]
    fn test_is_truthy_matches_javascript() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(is_truthy(Some(&json!([]))));
        assert!(is_truthy(Some(&json!("J1"))));
        assert!(is_truthy(Some(&json!(3))));
    }

    #[test]
    fn test_dashboard_stats_count_pending_candidates() {
        let jobs: Vec<JobMatch> = serde_json::from_value(json!([
            { "job_id": "J1", "candidates": [
                { "candidate_id": "C1", "status": "pending" },
                { "candidate_id": "C2", "status": "approved" }
            ]},
            { "job_id": "J2", "candidates": [{ "candidate_id": "C3" }] }
        ]))
        .unwrap();
        let stats = DashboardStats::from_jobs(&jobs);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.pending_approvals, 2);
    }

    #[test]
    fn test_demo_job_match_has_three_pending_candidates() {
        let demo = demo_job_match("JOB1");
        assert_eq!(demo.job_id, "JOB1");
        let candidates = demo.candidates.unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(Candidate::is_pending));
        assert_eq!(candidates[0].score_tier(), ScoreTier::Excellent);
        assert_eq!(candidates[2].score_tier(), ScoreTier::Good);
    }
}
