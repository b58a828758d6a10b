use crate::app::{App, AppView, Panel};
use crate::settings::SettingsField;
use ratatui::{
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};
use wifitop::config::DirectionConfig;
use wifitop::speedtest::{stats, SpeedTestResult, TestPhase};

// Color Palette - Elegant & Minimal
const ACCENT: Color = Color::Rgb(100, 149, 237); // Cornflower blue
const SUCCESS: Color = Color::Rgb(134, 194, 156); // Soft green
const SUCCESS_DIM: Color = Color::Rgb(80, 120, 90);
const INFO: Color = Color::Rgb(147, 180, 220); // Soft blue
const INFO_DIM: Color = Color::Rgb(90, 110, 140);
const WARN: Color = Color::Rgb(220, 180, 130); // Soft amber
const ERROR: Color = Color::Rgb(220, 120, 120);
const TEXT_PRIMARY: Color = Color::Rgb(230, 230, 230);
const TEXT_SECONDARY: Color = Color::Rgb(160, 160, 160);
const TEXT_MUTED: Color = Color::Rgb(100, 100, 100);
const BORDER: Color = Color::Rgb(60, 60, 65);
const BORDER_ACTIVE: Color = Color::Rgb(100, 100, 110);

// Where each transfer phase sits on the overall progress scale.
const DOWNLOAD_SPAN: (f64, f64) = (10.0, 55.0);
const UPLOAD_SPAN: (f64, f64) = (55.0, 98.0);

/// What a throughput panel shows for one direction.
struct Metric<'a> {
    title: &'static str,
    color: Color,
    dim_color: Color,
    speed: f64,
    range: Option<(f64, f64)>,
    peak: Option<f64>,
    estimated: bool,
    progress: f64,
    samples: &'a [f64],
}

impl<'a> Metric<'a> {
    fn download(app: &'a App) -> Self {
        let result = app.result.as_ref();
        Self {
            title: "Download",
            color: SUCCESS,
            dim_color: SUCCESS_DIM,
            speed: result
                .map(|r| r.download_speed)
                .or_else(|| app.download_samples.last().copied())
                .unwrap_or(0.0),
            range: result.map(|r| (r.min_download, r.max_download)),
            peak: result.map(|r| r.peak_download),
            estimated: false,
            progress: phase_progress(app, TestPhase::Download, DOWNLOAD_SPAN),
            samples: &app.download_samples,
        }
    }

    fn upload(app: &'a App) -> Self {
        let result = app.result.as_ref();
        Self {
            title: "Upload",
            color: INFO,
            dim_color: INFO_DIM,
            speed: result
                .map(|r| r.upload_speed)
                .or_else(|| app.upload_samples.last().copied())
                .unwrap_or(0.0),
            range: result.map(|r| (r.min_upload, r.max_upload)),
            peak: result.map(|r| r.peak_upload),
            estimated: result.is_some_and(|r| r.upload_estimated),
            progress: phase_progress(app, TestPhase::Upload, UPLOAD_SPAN),
            samples: &app.upload_samples,
        }
    }

    fn headline(&self) -> String {
        if self.estimated {
            format!("~{} (est.)", format_speed(self.speed))
        } else {
            format_speed(self.speed)
        }
    }
}

pub fn draw_ui(frame: &mut Frame, app: &App) {
    let area = frame.area();

    match app.view {
        AppView::Main => draw_main_view(frame, area, app),
        AppView::Settings => draw_settings_view(frame, area, app),
    }
}

fn draw_main_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(1),
        Constraint::Min(8),
        Constraint::Length(1),
        Constraint::Length(1),
    ])
    .split(area);

    draw_header(frame, chunks[0], app);
    draw_progress_bar(frame, chunks[1], app.progress / 100.0, ACCENT, BORDER);

    if app.expanded {
        match app.selected_panel {
            Panel::Download => draw_expanded_metric(frame, chunks[2], &Metric::download(app)),
            Panel::Upload => draw_expanded_metric(frame, chunks[2], &Metric::upload(app)),
            Panel::Ping => draw_ping_expanded(frame, chunks[2], app),
        }
    } else {
        let panels = Layout::horizontal([
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
            Constraint::Ratio(1, 3),
        ])
        .split(chunks[2]);

        draw_metric_panel(frame, panels[0], &Metric::download(app), app.selected_panel == Panel::Download);
        draw_metric_panel(frame, panels[1], &Metric::upload(app), app.selected_panel == Panel::Upload);
        draw_ping_panel(frame, panels[2], app, app.selected_panel == Panel::Ping);
    }

    draw_summary(frame, chunks[3], app);
    draw_help(frame, chunks[4], app);
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::horizontal([
        Constraint::Length(12),
        Constraint::Min(10),
        Constraint::Length(20),
    ])
    .split(inner);

    // Title
    let title = Paragraph::new("wifitop")
        .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD));
    frame.render_widget(title, chunks[0]);

    // Status, as reported by the engine
    let color = match app.phase {
        TestPhase::Idle => TEXT_MUTED,
        TestPhase::Ping => WARN,
        TestPhase::Download => SUCCESS,
        TestPhase::Upload => INFO,
        TestPhase::Complete => ACCENT,
    };
    let status = if !app.status.is_empty() {
        app.status.as_str()
    } else {
        "Ready"
    };

    let status_text = Paragraph::new(status)
        .style(Style::default().fg(color))
        .alignment(Alignment::Center);
    frame.render_widget(status_text, chunks[1]);

    // Phase indicator
    let phase_text = create_phase_text(app.phase);
    frame.render_widget(
        Paragraph::new(phase_text).alignment(Alignment::Right),
        chunks[2],
    );
}

fn create_phase_text(phase: TestPhase) -> Line<'static> {
    let phases = [
        (TestPhase::Ping, "ping"),
        (TestPhase::Download, "down"),
        (TestPhase::Upload, "up"),
    ];

    let mut spans = Vec::new();

    for (i, (p, label)) in phases.iter().enumerate() {
        let style = if phase == *p {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else if phase > *p {
            Style::default().fg(TEXT_SECONDARY)
        } else {
            Style::default().fg(TEXT_MUTED)
        };

        spans.push(Span::styled(*label, style));

        if i < phases.len() - 1 {
            spans.push(Span::styled(" / ", Style::default().fg(TEXT_MUTED)));
        }
    }

    Line::from(spans)
}

// Panels
fn draw_metric_panel(frame: &mut Frame, area: Rect, metric: &Metric, selected: bool) {
    let border_color = if selected { BORDER_ACTIVE } else { BORDER };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(Span::styled(
            format!(" {} ", metric.title),
            Style::default().fg(if selected { metric.color } else { TEXT_SECONDARY }),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new(metric.headline())
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    let range = match metric.range {
        Some((min, max)) if !metric.estimated => format!("{} – {}", format_speed(min), format_speed(max)),
        _ => String::new(),
    };
    frame.render_widget(
        Paragraph::new(range)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );

    draw_progress_bar(frame, chunks[2], metric.progress, metric.color, metric.dim_color);

    if !metric.samples.is_empty() {
        draw_sparkline(frame, chunks[3], metric.samples, metric.color);
    }
}

fn draw_ping_panel(frame: &mut Frame, area: Rect, app: &App, selected: bool) {
    let border_color = if selected { BORDER_ACTIVE } else { BORDER };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(Span::styled(
            " Latency ",
            Style::default().fg(if selected { WARN } else { TEXT_SECONDARY }),
        ));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Length(1),
        Constraint::Min(3),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new(format_ping(current_ping(app), app.result.as_ref()))
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD))
            .alignment(Alignment::Center),
        chunks[0],
    );

    let jitter = match &app.result {
        Some(r) => format!("jitter {:.1} ms", r.jitter),
        None => "jitter —".to_string(),
    };
    frame.render_widget(
        Paragraph::new(jitter)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[1],
    );

    if let Some(r) = &app.result {
        frame.render_widget(
            Paragraph::new(format!("{:.0} – {:.0} ms", r.min_ping, r.max_ping))
                .style(Style::default().fg(TEXT_MUTED))
                .alignment(Alignment::Center),
            chunks[2],
        );
    }

    if !app.ping_samples.is_empty() {
        draw_sparkline(frame, chunks[3], &app.ping_samples, WARN);
    }
}

fn draw_progress_bar(frame: &mut Frame, area: Rect, ratio: f64, color: Color, dim_color: Color) {
    if area.width < 4 {
        return;
    }

    let width = (area.width - 2) as usize;
    let filled = ((ratio.clamp(0.0, 1.0) * width as f64) as usize).min(width);
    let empty = width.saturating_sub(filled);

    let bar = Line::from(vec![
        Span::raw(" "),
        Span::styled("━".repeat(filled), Style::default().fg(color)),
        Span::styled("━".repeat(empty), Style::default().fg(dim_color)),
        Span::raw(" "),
    ]);

    frame.render_widget(Paragraph::new(bar), area);
}

fn draw_sparkline(frame: &mut Frame, area: Rect, data: &[f64], color: Color) {
    if data.is_empty() || area.width < 4 || area.height < 2 {
        return;
    }

    let (min_val, max_val) = data_range(data);
    let range = (max_val - min_val).max(1.0);

    let points: Vec<(f64, f64)> = data
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as f64, v))
        .collect();

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .x_axis(Axis::default().bounds([0.0, data.len() as f64]))
        .y_axis(Axis::default().bounds([min_val - range * 0.1, max_val + range * 0.1]));

    frame.render_widget(chart, area);
}

// Expanded views
fn draw_expanded_metric(frame: &mut Frame, area: Rect, metric: &Metric) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER_ACTIVE))
        .title(Span::styled(format!(" {} ", metric.title), Style::default().fg(metric.color)));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Length(1),
        Constraint::Min(4),
    ])
    .split(inner);

    let separator = || Span::styled("  ·  ", Style::default().fg(TEXT_MUTED));
    let mut spans = vec![Span::styled(
        metric.headline(),
        Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
    )];
    if let Some((min, max)) = metric.range.filter(|_| !metric.estimated) {
        spans.push(separator());
        spans.push(Span::styled(format!("blocks {} – {}", format_speed(min), format_speed(max)), Style::default().fg(TEXT_SECONDARY)));
    }
    if let Some(peak) = metric.peak.filter(|_| !metric.estimated) {
        spans.push(separator());
        spans.push(Span::styled(format!("peak {}", format_speed(peak)), Style::default().fg(TEXT_MUTED)));
    }
    if let Some(avg) = stats::mean(metric.samples) {
        spans.push(separator());
        spans.push(Span::styled(format!("avg {}", format_speed(avg)), Style::default().fg(TEXT_MUTED)));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).alignment(Alignment::Center), chunks[0]);

    draw_progress_bar(frame, chunks[1], metric.progress, metric.color, metric.dim_color);
    draw_detailed_chart(frame, chunks[2], metric.samples, metric.color, "Mbps");
}

fn draw_ping_expanded(frame: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER_ACTIVE))
        .title(Span::styled(" Latency ", Style::default().fg(WARN)));

    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Min(4),
    ])
    .split(inner);

    let separator = || Span::styled("  ·  ", Style::default().fg(TEXT_MUTED));
    let mut spans = vec![Span::styled(
        format_ping(current_ping(app), app.result.as_ref()),
        Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD),
    )];
    if let Some(r) = &app.result {
        spans.push(separator());
        spans.push(Span::styled(format!("jitter {:.1} ms", r.jitter), Style::default().fg(TEXT_SECONDARY)));
        spans.push(separator());
        spans.push(Span::styled(format!("min {:.0}", r.min_ping), Style::default().fg(TEXT_MUTED)));
        spans.push(separator());
        spans.push(Span::styled(format!("max {:.0}", r.max_ping), Style::default().fg(TEXT_MUTED)));
    }
    let (min, max) = data_range(&app.ping_samples);
    if !app.ping_samples.is_empty() {
        spans.push(separator());
        spans.push(Span::styled(format!("raw {:.0} – {:.0}", min, max), Style::default().fg(TEXT_MUTED)));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)).alignment(Alignment::Center), chunks[0]);

    draw_detailed_chart(frame, chunks[1], &app.ping_samples, WARN, "ms");
}

fn draw_detailed_chart(frame: &mut Frame, area: Rect, data: &[f64], color: Color, unit: &str) {
    if data.is_empty() || area.width < 10 || area.height < 3 {
        return;
    }

    let (min_val, max_val) = data_range(data);
    let range = (max_val - min_val).max(0.1);
    let y_min = (min_val - range * 0.1).max(0.0);
    let y_max = max_val + range * 0.1;

    let points: Vec<(f64, f64)> = data
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as f64, v))
        .collect();

    let median = stats::median(data).unwrap_or(0.0);
    let median_line: Vec<(f64, f64)> = vec![(0.0, median), (data.len() as f64, median)];

    let datasets = vec![
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(color))
            .data(&points),
        Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(TEXT_MUTED))
            .data(&median_line),
    ];

    let y_labels = vec![
        Span::styled(format!("{:.0}", y_min), Style::default().fg(TEXT_MUTED)),
        Span::styled(format!("{:.0} {}", y_max, unit), Style::default().fg(TEXT_MUTED)),
    ];

    let chart = Chart::new(datasets)
        .x_axis(
            Axis::default()
                .style(Style::default().fg(BORDER))
                .bounds([0.0, data.len() as f64]),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(BORDER))
                .bounds([y_min, y_max])
                .labels(y_labels),
        );

    frame.render_widget(chart, area);
}

fn draw_summary(frame: &mut Frame, area: Rect, app: &App) {
    let line = if let Some(error) = &app.error {
        Line::from(Span::styled(error.clone(), Style::default().fg(ERROR)))
    } else if let Some(r) = &app.result {
        Line::from(Span::styled(summary_text(r), Style::default().fg(TEXT_SECONDARY)))
    } else {
        Line::default()
    };
    frame.render_widget(Paragraph::new(line).alignment(Alignment::Center), area);
}

fn summary_text(r: &SpeedTestResult) -> String {
    let mut parts = vec![
        format!("stability {:.0}/100", r.stability),
        r.speed_category.label().to_string(),
        format!(
            "{}{}",
            r.connection_type.label(),
            if r.is_symmetric { ", symmetric" } else { "" }
        ),
        format!("{:?} precision", r.precision).to_lowercase(),
        format!("{:.1}s", r.test_duration),
    ];
    if r.ping_fallback {
        parts.push("latency unavailable".to_string());
    }
    parts.join(" · ")
}

// Settings
fn draw_settings_view(frame: &mut Frame, area: Rect, app: &App) {
    let chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(10),
        Constraint::Length(1),
    ])
    .split(area);

    // Header
    let header_block = Block::default()
        .borders(Borders::BOTTOM)
        .border_style(Style::default().fg(BORDER));
    let header_inner = header_block.inner(chunks[0]);
    frame.render_widget(header_block, chunks[0]);

    frame.render_widget(
        Paragraph::new("Settings")
            .style(Style::default().fg(TEXT_PRIMARY).add_modifier(Modifier::BOLD)),
        header_inner,
    );

    // Settings content
    let content_area = Layout::horizontal([
        Constraint::Length(2),
        Constraint::Min(30),
        Constraint::Length(2),
    ])
    .split(chunks[1])[1];

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(BORDER));
    let inner = block.inner(content_area);
    frame.render_widget(block, content_area);

    let rows = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Length(3),
        Constraint::Min(0),
    ])
    .split(inner);

    let settings = &app.settings;
    let config = settings.engine_config();
    draw_setting_row(
        frame,
        rows[0],
        "Ping probes",
        &format!("{}", settings.ping_count),
        app.selected_setting == SettingsField::PingCount,
    );

    draw_setting_row(
        frame,
        rows[1],
        "Download blocks",
        &schedule_text(&config.download),
        app.selected_setting == SettingsField::DownloadSize,
    );

    draw_setting_row(
        frame,
        rows[2],
        "Upload blocks",
        &schedule_text(&config.upload),
        app.selected_setting == SettingsField::UploadSize,
    );

    // Help
    let help = "↑↓ select · ←→ adjust · enter done";
    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        chunks[2],
    );
}

fn schedule_text(direction: &DirectionConfig) -> String {
    let sizes: Vec<String> = direction
        .blocks
        .iter()
        .map(|b| format!("{}", b.bytes as f64 / 1_000_000.0))
        .collect();
    format!("{} MB", sizes.join(" / "))
}

fn draw_setting_row(frame: &mut Frame, area: Rect, label: &str, value: &str, selected: bool) {
    let chunks = Layout::horizontal([
        Constraint::Length(18),
        Constraint::Min(10),
    ])
    .split(area);

    let label_style = if selected {
        Style::default().fg(ACCENT)
    } else {
        Style::default().fg(TEXT_SECONDARY)
    };

    frame.render_widget(
        Paragraph::new(format!(" {}", label)).style(label_style),
        chunks[0],
    );

    let value_text = if selected {
        format!("< {} >", value)
    } else {
        value.to_string()
    };

    let value_style = if selected {
        Style::default().fg(TEXT_PRIMARY)
    } else {
        Style::default().fg(TEXT_MUTED)
    };

    frame.render_widget(Paragraph::new(value_text).style(value_style), chunks[1]);
}

fn draw_help(frame: &mut Frame, area: Rect, app: &App) {
    let help = if app.expanded {
        "esc close · q quit"
    } else if app.is_running() {
        "tab select · space expand · esc cancel · q quit"
    } else {
        "enter start · s settings · tab select · space expand · q quit"
    };

    frame.render_widget(
        Paragraph::new(help)
            .style(Style::default().fg(TEXT_MUTED))
            .alignment(Alignment::Center),
        area,
    );
}

// Helpers
fn current_ping(app: &App) -> f64 {
    app.result
        .as_ref()
        .map(|r| r.ping)
        .or_else(|| app.ping_samples.last().copied())
        .unwrap_or(0.0)
}

fn format_ping(ping: f64, result: Option<&SpeedTestResult>) -> String {
    if ping <= 0.0 {
        "—".to_string()
    } else if result.is_some_and(|r| r.ping_fallback) {
        format!("~{:.0} ms", ping)
    } else {
        format!("{:.0} ms", ping)
    }
}

/// Share of a transfer phase already covered, from the overall percentage.
fn phase_progress(app: &App, phase: TestPhase, (start, end): (f64, f64)) -> f64 {
    if app.phase < phase {
        0.0
    } else if app.phase > phase {
        1.0
    } else {
        ((app.progress - start) / (end - start)).clamp(0.0, 1.0)
    }
}

fn data_range(data: &[f64]) -> (f64, f64) {
    (
        stats::min(data).unwrap_or(0.0),
        stats::max(data).unwrap_or(0.0),
    )
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.1} Gbps", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.1} Mbps", mbps)
    } else if mbps > 0.0 {
        format!("{:.0} Kbps", mbps * 1000.0)
    } else {
        "—".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wifitop::config::BlockSpec;

    #[test]
    fn test_format_speed_units() {
        assert_eq!(format_speed(1_500.0), "1.5 Gbps");
        assert_eq!(format_speed(94.37), "94.4 Mbps");
        assert_eq!(format_speed(0.5), "500 Kbps");
        assert_eq!(format_speed(0.0), "—");
    }

    #[test]
    fn test_schedule_text() {
        assert_eq!(schedule_text(&DirectionConfig::download()), "100 / 150 / 200 MB");

        let mut upload = DirectionConfig::upload();
        upload.blocks = vec![BlockSpec::new(500_000, 5_000), BlockSpec::new(37_500_000, 5_000)];
        assert_eq!(schedule_text(&upload), "0.5 / 37.5 MB");
    }

    #[test]
    fn test_phase_progress() {
        let mut app = App::new(crate::settings::Settings::default());
        app.phase = TestPhase::Download;
        app.progress = 32.5;
        assert_eq!(phase_progress(&app, TestPhase::Download, DOWNLOAD_SPAN), 0.5);
        assert_eq!(phase_progress(&app, TestPhase::Upload, UPLOAD_SPAN), 0.0);

        app.phase = TestPhase::Complete;
        assert_eq!(phase_progress(&app, TestPhase::Upload, UPLOAD_SPAN), 1.0);
    }
}
