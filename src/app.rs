use crate::settings::{Settings, SettingsField};
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::time::Duration;
use tokio::sync::mpsc;
use wifitop::speedtest::{
    CancelHandle, HttpTransport, Progress, SpeedTest, SpeedTestResult, TestPhase,
};

pub type HttpSpeedTest = SpeedTest<HttpTransport, HttpTransport, HttpTransport>;

/// Instantaneous readings kept per chart.
const MAX_CHART_SAMPLES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppView {
    Main,
    Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Download,
    Upload,
    Ping,
}

impl Panel {
    pub fn next(self) -> Self {
        match self {
            Panel::Download => Panel::Upload,
            Panel::Upload => Panel::Ping,
            Panel::Ping => Panel::Download,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Panel::Download => Panel::Ping,
            Panel::Upload => Panel::Download,
            Panel::Ping => Panel::Upload,
        }
    }
}

pub struct App {
    pub phase: TestPhase,
    pub result: Option<SpeedTestResult>,
    pub error: Option<String>,
    pub should_quit: bool,

    // UI state
    pub view: AppView,
    pub selected_panel: Panel,
    pub expanded: bool,

    // Settings
    pub settings: Settings,
    pub selected_setting: SettingsField,

    // Progress tracking
    pub progress: f64,
    pub status: String,

    // Live readings for charts
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub ping_samples: Vec<f64>,

    cancel: Option<CancelHandle>,
}

impl App {
    pub fn new(settings: Settings) -> Self {
        Self {
            phase: TestPhase::Idle,
            result: None,
            error: None,
            should_quit: false,
            view: AppView::Main,
            selected_panel: Panel::Download,
            expanded: false,
            settings,
            selected_setting: SettingsField::PingCount,
            progress: 0.0,
            status: String::new(),
            download_samples: Vec::new(),
            upload_samples: Vec::new(),
            ping_samples: Vec::new(),
            cancel: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase != TestPhase::Idle && self.phase != TestPhase::Complete
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match self.view {
            AppView::Main => self.handle_main_key(key),
            AppView::Settings => self.handle_settings_key(key),
        }
    }

    fn handle_main_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Char('s') => {
                if !self.is_running() {
                    self.view = AppView::Settings;
                }
                None
            }
            KeyCode::Enter => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if !self.is_running() {
                    Some(AppAction::StartTest)
                } else {
                    // Expand current panel during test
                    self.expanded = true;
                    None
                }
            }
            KeyCode::Esc => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.is_running() {
                    Some(AppAction::CancelTest)
                } else {
                    None
                }
            }
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('j') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.next();
                }
                None
            }
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('k') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.prev();
                }
                None
            }
            KeyCode::Char(' ') => {
                self.expanded = !self.expanded;
                None
            }
            _ => None,
        }
    }

    fn handle_settings_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter => {
                self.view = AppView::Main;
                None
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected_setting = self.selected_setting.prev();
                None
            }
            KeyCode::Down | KeyCode::Char('j') | KeyCode::Tab => {
                self.selected_setting = self.selected_setting.next();
                None
            }
            KeyCode::Left | KeyCode::Char('h') => {
                self.decrease_setting();
                None
            }
            KeyCode::Right | KeyCode::Char('l') => {
                self.increase_setting();
                None
            }
            _ => None,
        }
    }

    fn increase_setting(&mut self) {
        match self.selected_setting {
            SettingsField::PingCount => {
                self.settings.ping_count = (self.settings.ping_count + 5).min(100);
            }
            SettingsField::DownloadSize => {
                self.settings.download_size_mb = (self.settings.download_size_mb + 25).min(500);
            }
            SettingsField::UploadSize => {
                self.settings.upload_size_mb = (self.settings.upload_size_mb + 25).min(250);
            }
        }
    }

    fn decrease_setting(&mut self) {
        match self.selected_setting {
            SettingsField::PingCount => {
                self.settings.ping_count = self.settings.ping_count.saturating_sub(5).max(5);
            }
            SettingsField::DownloadSize => {
                self.settings.download_size_mb = self.settings.download_size_mb.saturating_sub(25).max(25);
            }
            SettingsField::UploadSize => {
                self.settings.upload_size_mb = self.settings.upload_size_mb.saturating_sub(25).max(25);
            }
        }
    }

    pub fn start_test(&mut self, cancel: CancelHandle) {
        self.phase = TestPhase::Ping;
        self.result = None;
        self.error = None;
        self.progress = 0.0;
        self.status.clear();
        self.download_samples.clear();
        self.upload_samples.clear();
        self.ping_samples.clear();
        self.expanded = false;
        self.cancel = Some(cancel);
    }

    pub fn handle_update(&mut self, update: TestUpdate) {
        match update {
            TestUpdate::Progress(progress) => self.apply_progress(progress),
            TestUpdate::Finished(Ok(result)) => {
                self.result = Some(result);
                self.phase = TestPhase::Complete;
                self.cancel = None;
            }
            TestUpdate::Finished(Err(message)) => {
                self.error = Some(message);
                self.phase = TestPhase::Idle;
                self.cancel = None;
            }
        }
    }

    fn apply_progress(&mut self, progress: Progress) {
        self.progress = progress.percent;
        self.status = progress.status;
        self.phase = progress.detail.phase;

        let samples = match progress.detail.phase {
            TestPhase::Ping => &mut self.ping_samples,
            TestPhase::Download => &mut self.download_samples,
            TestPhase::Upload => &mut self.upload_samples,
            TestPhase::Idle | TestPhase::Complete => return,
        };
        if let Some(value) = progress.detail.current_speed {
            samples.push(value);
            if samples.len() > MAX_CHART_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn cancel_test(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.phase = TestPhase::Idle;
        self.status = "Cancelled".to_string();
    }
}

#[derive(Debug, Clone, Copy)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
}

pub enum TestUpdate {
    Progress(Progress),
    Finished(Result<SpeedTestResult, String>),
}

/// Runs one test, forwarding every progress report and the final outcome.
pub async fn run_speed_test(engine: HttpSpeedTest, update_tx: mpsc::UnboundedSender<TestUpdate>) {
    let progress_tx = update_tx.clone();
    let observer = move |progress: &Progress| {
        let _ = progress_tx.send(TestUpdate::Progress(progress.clone()));
    };

    let outcome = engine.run(&observer).await.map_err(|e| e.to_string());
    if let Err(message) = &outcome {
        tracing::warn!(error = %message, "speed test failed");
    }
    let _ = update_tx.send(TestUpdate::Finished(outcome));
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wifitop::speedtest::ProgressDetail;

    fn progress(percent: f64, phase: TestPhase, speed: Option<f64>) -> TestUpdate {
        TestUpdate::Progress(Progress {
            percent,
            status: format!("{phase}"),
            detail: ProgressDetail {
                phase,
                current_speed: speed,
            },
        })
    }

    #[test]
    fn test_progress_routes_readings_by_phase() {
        let mut app = App::new(Settings::default());
        app.start_test(CancelHandle::new());

        app.handle_update(progress(5.0, TestPhase::Ping, Some(12.0)));
        app.handle_update(progress(30.0, TestPhase::Download, Some(180.0)));
        app.handle_update(progress(31.0, TestPhase::Download, None));
        app.handle_update(progress(70.0, TestPhase::Upload, Some(40.0)));

        assert_eq!(app.ping_samples, vec![12.0]);
        assert_eq!(app.download_samples, vec![180.0]);
        assert_eq!(app.upload_samples, vec![40.0]);
        assert_eq!(app.phase, TestPhase::Upload);
        assert_eq!(app.progress, 70.0);
    }

    #[test]
    fn test_failure_returns_to_idle() {
        let mut app = App::new(Settings::default());
        app.start_test(CancelHandle::new());
        app.handle_update(TestUpdate::Finished(Err("upload measurement failed".to_string())));

        assert_eq!(app.phase, TestPhase::Idle);
        assert!(!app.is_running());
        assert_eq!(app.error.as_deref(), Some("upload measurement failed"));
    }

    #[test]
    fn test_cancel_trips_handle() {
        let mut app = App::new(Settings::default());
        let handle = CancelHandle::new();
        app.start_test(handle.clone());
        app.cancel_test();
        assert!(handle.is_cancelled());
        assert_eq!(app.phase, TestPhase::Idle);
    }
}
