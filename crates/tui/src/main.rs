//! Relay Dashboard TUI
//!
//! Terminal interface for real-time monitoring of relay sessions and host metrics.
//! Polls the relay's `/api/streams/stats` endpoint and can force-stop sessions.

use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{
        Axis, Block, Borders, Cell, Chart, Dataset, Gauge, Paragraph, Row, Table, TableState, Wrap,
    },
    Frame, Terminal,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, Stdout},
    time::{Duration, Instant},
};

const DEFAULT_URL: &str = "http://127.0.0.1:5002";
const POLL_INTERVAL_MS: u64 = 500;
const MAX_FPS_POINTS: usize = 120;
const MAX_EVENT_LOG_ENTRIES: usize = 100;

/// relaytop - live view of relay sessions
#[derive(Parser, Debug)]
#[command(name = "relaytop")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the relay's HTTP server
    #[arg(short, long, default_value = DEFAULT_URL)]
    url: String,
}

// ============================================================================
// Data Models (mirroring the relay's API types)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMemory {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfigMetrics {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub input_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub id: u64,
    pub pid: Option<u32>,
    pub uptime_secs: f64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub dropped_frames: u64,
    pub bytes_received: u64,
    pub fps: f64,
    pub encoder_fps: Option<f32>,
    pub reconnects: u64,
    pub state: String,
    pub resolution: String,
    pub last_frame_secs_ago: Option<f64>,
    pub busy_secs: Option<f64>,
    pub config: SessionConfigMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetrics {
    pub uptime_secs: f64,
    pub memory: ProcessMemory,
    pub system: SystemMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamsMetrics {
    pub active: usize,
    pub max: usize,
    pub utilization_percent: f64,
    pub list: Vec<SessionMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_video_frames: u64,
    pub total_audio_frames: u64,
    pub total_dropped_frames: u64,
    pub total_bytes_received: u64,
    pub avg_fps: f64,
    pub total_reconnects: u64,
}

/// Fleet statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub timestamp_unix_ms: i64,
    pub server: ServerMetrics,
    pub streams: StreamsMetrics,
    pub totals: Totals,
}

impl StatsSnapshot {
    /// Sum of the per-session frame rates
    pub fn aggregate_fps(&self) -> f64 {
        self.streams.list.iter().map(|s| s.fps).sum()
    }
}

/// Log lines describing sessions that appeared, changed state, or went away
pub fn diff_sessions(previous: &[SessionMetrics], current: &[SessionMetrics]) -> Vec<String> {
    let before: BTreeMap<u64, &SessionMetrics> = previous.iter().map(|s| (s.id, s)).collect();
    let after: BTreeMap<u64, &SessionMetrics> = current.iter().map(|s| (s.id, s)).collect();
    let mut events = Vec::new();

    for (id, session) in &after {
        match before.get(id) {
            None => events.push(format!(
                "Session {} started ({} {} @ {} fps)",
                id, session.config.input_format, session.resolution, session.config.fps
            )),
            Some(old) if old.state != session.state => {
                events.push(format!("Session {}: {} -> {}", id, old.state, session.state))
            }
            Some(old) if session.reconnects > old.reconnects => {
                events.push(format!("Session {} reconnecting (#{})", id, session.reconnects))
            }
            Some(_) => {}
        }
    }
    for id in before.keys() {
        if !after.contains_key(id) {
            events.push(format!("Session {} ended", id));
        }
    }

    events
}

// ============================================================================
// App State
// ============================================================================

/// Main application state for the TUI dashboard
pub struct App {
    /// Base URL of the relay
    base_url: String,
    /// Current stats snapshot from the relay
    pub stats: Option<StatsSnapshot>,
    /// Event log with recent session events
    pub event_log: VecDeque<String>,
    /// Aggregate fps history for the chart (elapsed_secs, fps)
    pub fps_history: VecDeque<(f64, f64)>,
    /// Selected row of the session table
    pub table_state: TableState,
    /// Connection status
    pub connected: bool,
    client: reqwest::Client,
    start_time: Instant,
}

impl App {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            stats: None,
            event_log: VecDeque::with_capacity(MAX_EVENT_LOG_ENTRIES),
            fps_history: VecDeque::with_capacity(MAX_FPS_POINTS),
            table_state: TableState::default(),
            connected: false,
            client: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    fn sessions(&self) -> &[SessionMetrics] {
        self.stats
            .as_ref()
            .map(|s| s.streams.list.as_slice())
            .unwrap_or(&[])
    }

    /// Add an event to the log
    pub fn log_event(&mut self, event: String) {
        if self.event_log.len() >= MAX_EVENT_LOG_ENTRIES {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }

    /// Fetch stats from the relay
    pub async fn fetch_stats(&mut self) {
        let url = format!("{}/api/streams/stats", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    match response.json::<StatsSnapshot>().await {
                        Ok(snapshot) => self.apply_snapshot(snapshot),
                        Err(e) => {
                            self.log_event(format!("JSON parse error: {}", e));
                            self.connected = false;
                        }
                    }
                } else {
                    self.log_event(format!("HTTP error: {}", response.status()));
                    self.connected = false;
                }
            }
            Err(e) => {
                if self.connected {
                    self.log_event(format!("Connection lost: {}", e));
                }
                self.connected = false;
            }
        }
    }

    /// Take a new snapshot: log differences, extend the chart, keep the selection valid
    pub fn apply_snapshot(&mut self, snapshot: StatsSnapshot) {
        if !self.connected {
            self.log_event(format!("Connected to {}", self.base_url));
        }
        for event in diff_sessions(self.sessions(), &snapshot.streams.list) {
            self.log_event(event);
        }

        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        if self.fps_history.len() >= MAX_FPS_POINTS {
            self.fps_history.pop_front();
        }
        self.fps_history.push_back((elapsed_secs, snapshot.aggregate_fps()));

        let len = snapshot.streams.list.len();
        self.stats = Some(snapshot);
        self.connected = true;
        self.table_state
            .select(clamp_selection(self.table_state.selected(), len));
    }

    pub fn select_next(&mut self) {
        let len = self.sessions().len();
        let next = self.table_state.selected().map_or(0, |i| i + 1);
        self.table_state.select(clamp_selection(Some(next), len));
    }

    pub fn select_previous(&mut self) {
        let len = self.sessions().len();
        let previous = self.table_state.selected().map_or(0, |i| i.saturating_sub(1));
        self.table_state.select(clamp_selection(Some(previous), len));
    }

    fn selected_session_id(&self) -> Option<u64> {
        let index = self.table_state.selected()?;
        self.sessions().get(index).map(|s| s.id)
    }

    /// Force-stop the selected session
    pub async fn stop_selected(&mut self) {
        let Some(id) = self.selected_session_id() else {
            self.log_event("No session selected".to_string());
            return;
        };
        let url = format!("{}/api/streams/{}/stop", self.base_url, id);
        let message = self.post_for_message(&url).await;
        self.log_event(format!("Stop session {}: {}", id, message));
    }

    /// Stop every session
    pub async fn stop_all(&mut self) {
        let url = format!("{}/api/streams/stop-all", self.base_url);
        let message = self.post_for_message(&url).await;
        self.log_event(format!("Stop all: {}", message));
    }

    async fn post_for_message(&self, url: &str) -> String {
        match self.client.post(url).send().await {
            Ok(response) => {
                let status = response.status();
                match response.json::<serde_json::Value>().await {
                    Ok(body) => body
                        .get("message")
                        .or_else(|| body.get("error"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| status.to_string()),
                    Err(_) => status.to_string(),
                }
            }
            Err(e) => format!("request failed: {}", e),
        }
    }
}

/// Keep a table selection inside `0..len`, or clear it for an empty table
pub fn clamp_selection(selected: Option<usize>, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(selected.unwrap_or(0).min(len - 1))
}

// ============================================================================
// Terminal Setup/Teardown
// ============================================================================

fn setup_terminal() -> io::Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ============================================================================
// Widget Rendering
// ============================================================================

fn state_color(state: &str) -> Color {
    match state {
        "STREAMING" => Color::Green,
        "RECONNECTING" | "SPAWNING" | "INIT" => Color::Yellow,
        "FAILED" => Color::Red,
        _ => Color::Gray,
    }
}

/// Render the session table
fn render_session_table(f: &mut Frame, area: Rect, app: &mut App) {
    let header_cells = [
        "ID", "State", "PID", "Input", "Res", "FPS", "Enc FPS", "Frames", "Dropped", "Recv", "Up",
    ]
    .iter()
    .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1).bottom_margin(1);

    let rows: Vec<Row> = app
        .sessions()
        .iter()
        .map(|s| {
            let dropped = match s.busy_secs {
                Some(busy) => format!("{} ({:.0}s)", s.dropped_frames, busy),
                None => s.dropped_frames.to_string(),
            };
            Row::new(vec![
                Cell::from(s.id.to_string()),
                Cell::from(s.state.clone()).style(Style::default().fg(state_color(&s.state))),
                Cell::from(s.pid.map_or("-".to_string(), |p| p.to_string())),
                Cell::from(s.config.input_format.clone()),
                Cell::from(s.resolution.clone()),
                Cell::from(format!("{:.1}", s.fps)),
                Cell::from(s.encoder_fps.map_or("-".to_string(), |f| format!("{:.1}", f))),
                Cell::from(s.video_frames.to_string()),
                Cell::from(dropped),
                Cell::from(format_bytes(s.bytes_received)),
                Cell::from(format_duration(s.uptime_secs)),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(5),
        Constraint::Length(13),
        Constraint::Length(8),
        Constraint::Length(6),
        Constraint::Length(10),
        Constraint::Length(6),
        Constraint::Length(8),
        Constraint::Length(9),
        Constraint::Length(11),
        Constraint::Length(10),
        Constraint::Length(9),
    ];

    let title = if app.connected {
        " Sessions "
    } else {
        " Sessions (Disconnected) "
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");

    f.render_stateful_widget(table, area, &mut app.table_state);
}

/// Render utilization, CPU and memory gauges
fn render_gauges(f: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    let (utilization, active, max, cpu, mem, rss) = match app.stats {
        Some(ref stats) => (
            stats.streams.utilization_percent / 100.0,
            stats.streams.active,
            stats.streams.max,
            stats.server.system.cpu_usage_percent as f64 / 100.0,
            stats.server.system.mem_usage_percent as f64 / 100.0,
            stats.server.memory.rss_bytes,
        ),
        None => (0.0, 0, 0, 0.0, 0.0, 0),
    };

    let utilization_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Capacity "))
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(utilization.clamp(0.0, 1.0))
        .label(format!("{}/{} ({:.0}%)", active, max, utilization * 100.0));

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" CPU "))
        .gauge_style(Style::default().fg(Color::Cyan))
        .ratio(cpu.clamp(0.0, 1.0))
        .label(format!("{:.1}%", cpu * 100.0));

    let mem_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(" Memory "))
        .gauge_style(Style::default().fg(Color::Magenta))
        .ratio(mem.clamp(0.0, 1.0))
        .label(format!("{:.1}% (relay {})", mem * 100.0, format_bytes(rss)));

    f.render_widget(utilization_gauge, chunks[0]);
    f.render_widget(cpu_gauge, chunks[1]);
    f.render_widget(mem_gauge, chunks[2]);
}

/// Render aggregate fps over time
fn render_fps_chart(f: &mut Frame, area: Rect, app: &App) {
    let data: Vec<(f64, f64)> = app.fps_history.iter().cloned().collect();

    if data.is_empty() {
        let block = Block::default().borders(Borders::ALL).title(" Aggregate FPS ");
        f.render_widget(block, area);
        return;
    }

    let min_x = data.first().map(|(x, _)| *x).unwrap_or(0.0);
    let max_x = data.last().map(|(x, _)| *x).unwrap_or(60.0).max(min_x + 1.0);
    let max_y = data.iter().map(|(_, y)| *y).fold(0.0f64, f64::max).max(1.0);

    let datasets = vec![Dataset::default()
        .name("fps")
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&data)];

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title(" Aggregate FPS "))
        .x_axis(
            Axis::default()
                .title("Time (s)")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_x, max_x])
                .labels(vec![
                    Span::raw(format!("{:.0}", min_x)),
                    Span::raw(format!("{:.0}", max_x)),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec![
                    Span::raw("0"),
                    Span::raw(format!("{:.0}", max_y / 2.0)),
                    Span::raw(format!("{:.0}", max_y)),
                ]),
        );

    f.render_widget(chart, area);
}

fn render_event_log(f: &mut Frame, area: Rect, app: &App) {
    let events: Vec<Line> = app
        .event_log
        .iter()
        .rev()
        .take((area.height as usize).saturating_sub(2))
        .map(|e| Line::from(e.as_str()))
        .collect();

    let paragraph = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title(" Event Log "))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Render status bar with fleet totals and key help
fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let status = match app.stats {
        Some(ref stats) => format!(
            " Up: {} | Frames: {} | Dropped: {} | Recv: {} | Reconnects: {} | \u{2191}\u{2193} select  x stop  X stop all  q quit ",
            format_duration(stats.server.uptime_secs),
            stats.totals.total_video_frames,
            stats.totals.total_dropped_frames,
            format_bytes(stats.totals.total_bytes_received),
            stats.totals.total_reconnects,
        ),
        None => format!(" Connecting to {}... | Press 'q' to quit ", app.base_url),
    };

    let paragraph = Paragraph::new(status).style(Style::default().fg(Color::White).bg(Color::DarkGray));

    f.render_widget(paragraph, area);
}

/// Format duration in seconds to human-readable string
fn format_duration(secs: f64) -> String {
    let total_secs = secs.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b >= KIB * KIB * KIB {
        format!("{:.2} GB", b / (KIB * KIB * KIB))
    } else if b >= KIB * KIB {
        format!("{:.1} MB", b / (KIB * KIB))
    } else if b >= KIB {
        format!("{:.1} KB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Main UI Layout
// ============================================================================

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.area();

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(size);

    // Left: sessions + events, right: gauges + chart
    let content_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(68), Constraint::Percentage(32)])
        .split(main_chunks[0]);

    let left_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(content_chunks[0]);

    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(9), Constraint::Min(0)])
        .split(content_chunks[1]);

    render_session_table(f, left_chunks[0], app);
    render_event_log(f, left_chunks[1], app);
    render_gauges(f, right_chunks[0], app);
    render_fps_chart(f, right_chunks[1], app);
    render_status_bar(f, main_chunks[1], app);
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();

    let mut terminal = setup_terminal()?;

    let mut app = App::new(args.url);
    app.log_event("relaytop started".to_string());

    let result = run_app(&mut terminal, &mut app).await;

    restore_terminal(&mut terminal)?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
) -> io::Result<()> {
    let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);
    let mut last_fetch: Option<Instant> = None;

    loop {
        if last_fetch.map_or(true, |t| t.elapsed() >= poll_interval) {
            app.fetch_stats().await;
            last_fetch = Some(Instant::now());
        }

        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Down => app.select_next(),
                        KeyCode::Up => app.select_previous(),
                        KeyCode::Char('x') => {
                            app.stop_selected().await;
                            last_fetch = None;
                        }
                        KeyCode::Char('X') => {
                            app.stop_all().await;
                            last_fetch = None;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn session(id: u64, state: &str) -> SessionMetrics {
        SessionMetrics {
            id,
            pid: Some(4000 + id as u32),
            uptime_secs: 10.0,
            video_frames: 300,
            audio_frames: 0,
            dropped_frames: 0,
            bytes_received: 1024,
            fps: 30.0,
            encoder_fps: Some(29.9),
            reconnects: 0,
            state: state.to_string(),
            resolution: "1280x720".to_string(),
            last_frame_secs_ago: Some(0.1),
            busy_secs: None,
            config: SessionConfigMetrics {
                width: Some(1280),
                height: Some(720),
                fps: 30,
                video_bitrate_kbps: 2500,
                audio_bitrate_kbps: 128,
                input_format: "webm".to_string(),
            },
        }
    }

    fn snapshot(list: Vec<SessionMetrics>) -> StatsSnapshot {
        StatsSnapshot {
            streams: StreamsMetrics {
                active: list.len(),
                max: 60,
                utilization_percent: list.len() as f64 / 60.0 * 100.0,
                list,
            },
            ..StatsSnapshot::default()
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_selection_stays_in_range(selected in proptest::option::of(0usize..200), len in 0usize..50) {
            match clamp_selection(selected, len) {
                None => prop_assert_eq!(len, 0),
                Some(i) => prop_assert!(i < len),
            }
        }
    }

    #[test]
    fn test_parses_relay_stats_json() {
        let json = r#"{
            "timestampUnixMs": 1700000000000,
            "server": {
                "uptimeSecs": 12.5,
                "memory": {"rssBytes": 1048576, "virtualBytes": 4194304},
                "system": {"cpuUsagePercent": 12.0, "memUsagePercent": 40.0,
                           "loadAvg1": 0.5, "loadAvg5": 0.4, "loadAvg15": 0.3}
            },
            "streams": {
                "active": 1, "max": 60, "utilizationPercent": 1.67,
                "list": [{
                    "id": 3, "pid": 4242, "uptimeSecs": 5.0, "videoFrames": 150,
                    "audioFrames": 0, "droppedFrames": 2, "bytesReceived": 90000,
                    "fps": 30.0, "encoderFps": null, "reconnects": 0,
                    "state": "STREAMING", "resolution": "source",
                    "lastFrameSecsAgo": 0.03, "busySecs": null,
                    "config": {"width": null, "height": null, "fps": 30,
                               "videoBitrateKbps": 2500, "audioBitrateKbps": 128,
                               "inputFormat": "h264"}
                }]
            },
            "totals": {"totalVideoFrames": 150, "totalAudioFrames": 0, "totalDroppedFrames": 2,
                       "totalBytesReceived": 90000, "avgFps": 30.0, "totalReconnects": 0}
        }"#;

        let stats: StatsSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(stats.streams.list.len(), 1);
        assert_eq!(stats.streams.list[0].state, "STREAMING");
        assert_eq!(stats.streams.list[0].config.input_format, "h264");
        assert_eq!(stats.server.memory.rss_bytes, 1048576);
    }

    #[test]
    fn test_diff_sessions_reports_changes() {
        let before = vec![session(1, "STREAMING"), session(2, "SPAWNING")];
        let after = vec![session(2, "STREAMING"), session(4, "SPAWNING")];

        let events = diff_sessions(&before, &after);

        assert!(events.iter().any(|e| e.contains("Session 1 ended")));
        assert!(events.iter().any(|e| e.contains("Session 2: SPAWNING -> STREAMING")));
        assert!(events.iter().any(|e| e.starts_with("Session 4 started")));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_diff_sessions_reports_reconnect() {
        let before = vec![session(1, "STREAMING")];
        let mut after = session(1, "STREAMING");
        after.reconnects = 1;

        assert_eq!(
            diff_sessions(&before, &[after]),
            vec!["Session 1 reconnecting (#1)".to_string()]
        );
    }

    #[test]
    fn test_apply_snapshot_tracks_selection_and_history() {
        let mut app = App::new("http://relay.local:5002/");
        assert_eq!(app.base_url, "http://relay.local:5002");

        app.apply_snapshot(snapshot(vec![session(1, "STREAMING"), session(2, "STREAMING")]));
        assert!(app.connected);
        assert_eq!(app.table_state.selected(), Some(0));
        app.select_next();
        app.select_next();
        assert_eq!(app.table_state.selected(), Some(1));

        app.apply_snapshot(snapshot(vec![session(1, "STREAMING")]));
        assert_eq!(app.table_state.selected(), Some(0));
        assert_eq!(app.selected_session_id(), Some(1));
        assert_eq!(app.fps_history.len(), 2);
        assert_eq!(app.fps_history.back().map(|(_, fps)| *fps), Some(30.0));

        app.apply_snapshot(snapshot(Vec::new()));
        assert_eq!(app.table_state.selected(), None);
        assert!(app.event_log.iter().any(|e| e == "Session 1 ended"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_duration(5.4), "5s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3725.0), "1h 2m");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
