use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::cell::RefCell;
use std::io::stdout;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::bus::Subscription;
use crate::models::{
    demo_job_match, DashboardStats, Direction as MessageDirection, JobMatch, ScoreTier, ThreadMap,
    ThreadMessage, STATUS_APPROVED, STATUS_PENDING, STATUS_REJECTED,
};
use crate::poller::poll_once;
use crate::store::Store;
use crate::truncate;
use crate::webhook::{ThreadFetch, WebhookClient};

const FLASH_TTL: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(250);

/// Latest snapshots pushed by the store.
#[derive(Default)]
struct Views {
    jobs: Vec<JobMatch>,
    threads: ThreadMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Panel {
    Candidates,
    Conversation,
}

struct AppState {
    views: Rc<RefCell<Views>>,
    subscriptions: Vec<Subscription>,
    selected: usize,
    candidate: usize,
    panel: Panel,
    scroll_offset: u16,
    compose: Option<String>,
    flash: Option<(String, Instant)>,
}

impl AppState {
    fn attach(store: &Store) -> Self {
        let views = Rc::new(RefCell::new(Views {
            jobs: store.jobs().to_vec(),
            threads: store.threads().clone(),
        }));

        let jobs_view = Rc::clone(&views);
        let threads_view = Rc::clone(&views);
        let subscriptions = vec![
            store.subscribe_jobs(move |jobs| jobs_view.borrow_mut().jobs = jobs),
            store.subscribe_threads(move |threads| threads_view.borrow_mut().threads = threads),
        ];

        Self {
            views,
            subscriptions,
            selected: 0,
            candidate: 0,
            panel: Panel::Candidates,
            scroll_offset: 0,
            compose: None,
            flash: None,
        }
    }

    fn detach(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }

    fn current_job_id(&self) -> Option<String> {
        self.views
            .borrow()
            .jobs
            .get(self.selected)
            .map(|j| j.job_id.clone())
    }

    fn current_candidate_id(&self) -> Option<String> {
        let views = self.views.borrow();
        let job = views.jobs.get(self.selected)?;
        job.candidates
            .get(self.candidate)
            .map(|c| c.candidate_id.clone())
    }

    /// Keeps the selection inside whatever the latest snapshot holds.
    fn clamp(&mut self) {
        let views = self.views.borrow();
        self.selected = self.selected.min(views.jobs.len().saturating_sub(1));
        let candidates = views
            .jobs
            .get(self.selected)
            .map_or(0, |j| j.candidates.len());
        self.candidate = self.candidate.min(candidates.saturating_sub(1));
    }

    fn next(&mut self) -> bool {
        let len = self.views.borrow().jobs.len();
        if len > 0 && self.selected < len - 1 {
            self.selected += 1;
            self.candidate = 0;
            self.scroll_offset = 0;
            return true;
        }
        false
    }

    fn prev(&mut self) -> bool {
        if self.selected > 0 {
            self.selected -= 1;
            self.candidate = 0;
            self.scroll_offset = 0;
            return true;
        }
        false
    }

    fn down(&mut self) {
        match self.panel {
            Panel::Candidates => self.candidate += 1,
            Panel::Conversation => self.scroll_offset = self.scroll_offset.saturating_add(3),
        }
        self.clamp();
    }

    fn up(&mut self) {
        match self.panel {
            Panel::Candidates => self.candidate = self.candidate.saturating_sub(1),
            Panel::Conversation => self.scroll_offset = self.scroll_offset.saturating_sub(3),
        }
    }

    fn set_flash(&mut self, message: impl Into<String>) {
        self.flash = Some((message.into(), Instant::now()));
    }

    fn expire_flash(&mut self) {
        if self
            .flash
            .as_ref()
            .is_some_and(|(_, at)| at.elapsed() >= FLASH_TTL)
        {
            self.flash = None;
        }
    }
}

pub fn run_browse(store: &mut Store, webhook: &WebhookClient, poll_interval: Duration) -> Result<()> {
    poll_once(store);
    let mut state = AppState::attach(store);

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, store, webhook, poll_interval);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    state.detach();
    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    store: &mut Store,
    webhook: &WebhookClient,
    poll_interval: Duration,
) -> Result<()> {
    let mut list_state = ListState::default();
    let mut last_poll = Instant::now();

    loop {
        if last_poll.elapsed() >= poll_interval {
            poll_once(store);
            last_poll = Instant::now();
        }
        state.expire_flash();
        state.clamp();
        list_state.select(Some(state.selected));

        terminal.draw(|frame| draw(frame, state, &mut list_state))?;

        if !event::poll(TICK)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        if state.compose.is_some() {
            match key.code {
                KeyCode::Esc => state.compose = None,
                KeyCode::Enter => {
                    let draft = state.compose.take().unwrap_or_default();
                    send_reply(state, webhook, &draft);
                }
                KeyCode::Backspace => {
                    if let Some(draft) = state.compose.as_mut() {
                        draft.pop();
                    }
                }
                KeyCode::Char(c) => {
                    if let Some(draft) = state.compose.as_mut() {
                        draft.push(c);
                    }
                }
                _ => {}
            }
            continue;
        }

        let moved = match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Down | KeyCode::Char('j') => state.next(),
            KeyCode::Up | KeyCode::Char('k') => state.prev(),
            KeyCode::Char('J') | KeyCode::PageDown => {
                state.down();
                false
            }
            KeyCode::Char('K') | KeyCode::PageUp => {
                state.up();
                false
            }
            KeyCode::Tab => {
                state.panel = match state.panel {
                    Panel::Candidates => Panel::Conversation,
                    Panel::Conversation => Panel::Candidates,
                };
                state.scroll_offset = 0;
                true
            }
            KeyCode::Char('a') => {
                set_candidate_status(state, store, STATUS_APPROVED);
                false
            }
            KeyCode::Char('x') => {
                set_candidate_status(state, store, STATUS_REJECTED);
                false
            }
            KeyCode::Char('u') => {
                set_candidate_status(state, store, STATUS_PENDING);
                false
            }
            KeyCode::Char('s') => {
                send_approvals(state, store, webhook);
                false
            }
            KeyCode::Char('r') => {
                refresh_threads(state, store, webhook);
                false
            }
            KeyCode::Char('R') => {
                if state.current_job_id().is_some() {
                    state.compose = Some(String::new());
                }
                false
            }
            KeyCode::Char('L') => {
                store.reset();
                state.set_flash("Reloaded from disk");
                false
            }
            KeyCode::Char('D') => {
                let job_id = format!("JOB{}", Utc::now().timestamp_millis());
                store.upsert_job_match(demo_job_match(job_id));
                state.selected = 0;
                state.candidate = 0;
                state.set_flash("Demo job added");
                false
            }
            _ => false,
        };

        if moved && state.panel == Panel::Conversation {
            if let Some(job_id) = state.current_job_id() {
                store.mark_threads_read(&job_id);
            }
        }
    }
    Ok(())
}

// --- Actions ---

fn set_candidate_status(state: &mut AppState, store: &mut Store, status: &str) {
    if state.panel != Panel::Candidates {
        return;
    }
    let (Some(job_id), Some(candidate_id)) = (state.current_job_id(), state.current_candidate_id())
    else {
        return;
    };
    store.update_candidate_status(&job_id, &candidate_id, status);
}

fn send_approvals(state: &mut AppState, store: &Store, webhook: &WebhookClient) {
    let Some(job_id) = state.current_job_id() else {
        return;
    };
    match webhook.send_approvals(&job_id, &store.approved_candidates(&job_id), "") {
        Ok(count) => state.set_flash(format!("Sent {} approval(s) to the workflow", count)),
        Err(e) => state.set_flash(format!("Failed: {:#}", e)),
    }
}

fn refresh_threads(state: &mut AppState, store: &mut Store, webhook: &WebhookClient) {
    let Some(job_id) = state.current_job_id() else {
        return;
    };
    match webhook.fetch_threads(&job_id) {
        Ok(ThreadFetch::Messages(messages)) => {
            let count = messages.len();
            store.replace_threads(&job_id, messages);
            state.set_flash(format!("Loaded {} message(s)", count));
        }
        Ok(ThreadFetch::Fallback(message)) => state.set_flash(message),
        Err(e) => state.set_flash(format!("Failed: {:#}", e)),
    }
}

fn send_reply(state: &mut AppState, webhook: &WebhookClient, draft: &str) {
    let Some(job_id) = state.current_job_id() else {
        return;
    };
    match webhook.send_reply(&job_id, draft) {
        Ok(()) => state.set_flash("Reply sent"),
        Err(e) => state.set_flash(format!("Failed: {:#}", e)),
    }
}

// --- Rendering ---

fn draw(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let views = state.views.borrow();
    let now = Utc::now();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(frame.area());

    let stats = DashboardStats::from_jobs(&views.jobs);
    let header = Line::from(vec![
        Span::styled(" Mailtrix ", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!(
            " {} jobs  {} pending approvals",
            stats.total_jobs, stats.pending_approvals
        )),
    ]);
    frame.render_widget(Paragraph::new(header), rows[0]);

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(rows[1]);

    // Left panel: job list
    let items: Vec<ListItem> = views
        .jobs
        .iter()
        .map(|job| {
            let badge = if job.unread_count > 0 {
                format!("[{}]", job.unread_count)
            } else {
                String::new()
            };
            ListItem::new(format!(
                "{:<4} {} ({} pending)",
                badge,
                truncate(job.title(), 30),
                job.pending_count()
            ))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Jobs ({}) ", views.jobs.len())),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, chunks[0], list_state);

    // Right panel: job header over candidates or conversation
    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(7), Constraint::Min(0)])
        .split(chunks[1]);

    let job = views.jobs.get(state.selected);
    let summary = Paragraph::new(build_summary(job, now))
        .block(Block::default().borders(Borders::ALL).title(" Job "))
        .wrap(Wrap { trim: false });
    frame.render_widget(summary, right[0]);

    let width = right[1].width.saturating_sub(4).max(20) as usize;
    let (title, body) = match (job, state.panel) {
        (None, _) => (
            " Candidates ".to_string(),
            Text::raw("No job matches yet. Press D to add a demo job."),
        ),
        (Some(job), Panel::Candidates) => (
            format!(" Candidates ({}) ", job.candidates.len()),
            build_candidates(job, state.candidate, width),
        ),
        (Some(job), Panel::Conversation) => {
            let messages = views.threads.get(&job.job_id).map(Vec::as_slice).unwrap_or(&[]);
            (
                format!(" Conversation ({}) ", messages.len()),
                build_conversation(messages, state.compose.as_deref(), width, now),
            )
        }
    };
    let body = Paragraph::new(body)
        .block(Block::default().borders(Borders::ALL).title(title))
        .scroll((state.scroll_offset, 0));
    frame.render_widget(body, right[1]);

    // Footer: transient status or help
    let footer = match (&state.flash, &state.compose) {
        (Some((message, _)), _) => {
            Paragraph::new(format!(" {}", message)).style(Style::default().fg(Color::Yellow))
        }
        (None, Some(_)) => Paragraph::new(" Enter:send  Esc:cancel")
            .style(Style::default().fg(Color::DarkGray)),
        (None, None) => Paragraph::new(
            " j/k:jobs  J/K:select/scroll  Tab:candidates/conversation  a:approve x:reject u:undo  s:send  r:refresh  R:reply  L:reload  D:demo  q:quit",
        )
        .style(Style::default().fg(Color::DarkGray)),
    };
    frame.render_widget(footer, rows[2]);
}

fn build_summary(job: Option<&JobMatch>, now: DateTime<Utc>) -> Text<'static> {
    let Some(job) = job else {
        return Text::raw("No job selected");
    };

    let mut lines: Vec<Line> = Vec::new();
    lines.push(Line::from(Span::styled(
        job.title().to_string(),
        Style::default().add_modifier(Modifier::BOLD),
    )));

    let mut where_who = Vec::new();
    if let Some(location) = &job.job_location {
        where_who.push(location.clone());
    }
    match (&job.recruiter_name, &job.recruiter_email) {
        (Some(name), Some(email)) => where_who.push(format!("{} <{}>", name, email)),
        (Some(who), None) | (None, Some(who)) => where_who.push(who.clone()),
        (None, None) => {}
    }
    if !where_who.is_empty() {
        lines.push(Line::from(where_who.join("  |  ")));
    }

    if !job.required_skills.is_empty() {
        lines.push(Line::from(format!("Skills: {}", job.required_skills.join(", "))));
    }
    if let Some(years) = job.min_experience {
        lines.push(Line::from(format!("Min experience: {} yrs", years)));
    }

    let received = job
        .received_at
        .as_deref()
        .or(job.created_at.as_deref())
        .map(|ts| format!("  received {}", relative_time(ts, now)))
        .unwrap_or_default();
    lines.push(Line::from(Span::styled(
        format!("{}{}", job.job_id, received),
        Style::default().fg(Color::DarkGray),
    )));

    Text::from(lines)
}

fn build_candidates(job: &JobMatch, selected: usize, width: usize) -> Text<'static> {
    if job.candidates.is_empty() {
        return Text::raw("No candidates");
    }

    let mut lines: Vec<Line> = Vec::new();
    for (i, candidate) in job.candidates.iter().enumerate() {
        let (icon, status_style) = match candidate.status.as_str() {
            STATUS_APPROVED => ("+", Style::default().fg(Color::Green)),
            STATUS_REJECTED => ("x", Style::default().fg(Color::Red)),
            _ => (" ", Style::default()),
        };
        let tier_style = match candidate.score_tier() {
            ScoreTier::Excellent => Style::default().fg(Color::Green),
            ScoreTier::Good => Style::default().fg(Color::Yellow),
            ScoreTier::Fair => Style::default().fg(Color::Red),
        };
        let marker = if i == selected { "> " } else { "  " };
        let name = candidate
            .candidate_name
            .clone()
            .unwrap_or_else(|| candidate.candidate_id.clone());
        let score = candidate
            .match_score
            .map(|s| format!("{:.0}", s))
            .unwrap_or_else(|| "?".to_string());

        lines.push(Line::from(vec![
            Span::raw(marker),
            Span::styled(format!("[{}] ", icon), status_style),
            Span::styled(name, Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("  "),
            Span::styled(
                format!("{} ({})", score, candidate.score_tier().label()),
                tier_style,
            ),
        ]));

        let mut facts = Vec::new();
        if let Some(email) = &candidate.candidate_email {
            facts.push(email.clone());
        }
        if let Some(years) = candidate.candidate_experience {
            facts.push(format!("{} yrs", years));
        }
        if !candidate.candidate_skills.is_empty() {
            facts.push(candidate.candidate_skills.join(", "));
        }
        if !facts.is_empty() {
            lines.push(Line::from(format!("      {}", facts.join("  |  "))));
        }
        if let Some(reason) = &candidate.match_reason {
            for line in textwrap::fill(reason, width.saturating_sub(6).max(20)).lines() {
                lines.push(Line::from(Span::styled(
                    format!("      {}", line),
                    Style::default().fg(Color::DarkGray),
                )));
            }
        }
        lines.push(Line::from(""));
    }

    Text::from(lines)
}

fn build_conversation(
    messages: &[ThreadMessage],
    draft: Option<&str>,
    width: usize,
    now: DateTime<Utc>,
) -> Text<'static> {
    let mut lines: Vec<Line> = Vec::new();

    if messages.is_empty() {
        lines.push(Line::from(Span::styled(
            "(No messages yet. Press r to refresh.)",
            Style::default().fg(Color::DarkGray),
        )));
    }

    for message in sorted_messages(messages) {
        let style = match message.direction {
            MessageDirection::Inbound => Style::default().fg(Color::Cyan),
            MessageDirection::Outbound => Style::default().fg(Color::Green),
        };
        let arrow = match message.direction {
            MessageDirection::Inbound => "<-",
            MessageDirection::Outbound => "->",
        };
        let when = message
            .sent_at
            .as_deref()
            .map(|ts| relative_time(ts, now))
            .unwrap_or_default();
        let unread = if message.is_unread_inbound() { " *" } else { "" };

        lines.push(Line::from(vec![
            Span::styled(
                format!("{} {}", arrow, message.display_name()),
                style.add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("  {}{}", when, unread), Style::default().fg(Color::DarkGray)),
        ]));
        for line in textwrap::fill(&message.plain_text(), width).lines() {
            lines.push(Line::from(format!("  {}", line)));
        }
        lines.push(Line::from(""));
    }

    if let Some(draft) = draft {
        lines.push(Line::from(Span::styled(
            format!("Reply: {}_", draft),
            Style::default().fg(Color::Yellow),
        )));
    }

    Text::from(lines)
}

/// Messages in send order; ones without a usable timestamp sort first.
pub(crate) fn sorted_messages(messages: &[ThreadMessage]) -> Vec<&ThreadMessage> {
    let mut sorted: Vec<&ThreadMessage> = messages.iter().collect();
    sorted.sort_by_key(|m| {
        m.sent_at
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
    });
    sorted
}

fn relative_time(timestamp: &str, now: DateTime<Utc>) -> String {
    let Ok(at) = DateTime::parse_from_rfc3339(timestamp) else {
        return timestamp.to_string();
    };
    let secs = (now - at.with_timezone(&Utc)).num_seconds();
    match secs {
        s if s < 60 => "just now".to_string(),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}
