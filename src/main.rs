mod app;
mod settings;
mod ui;

use anyhow::{Context, Result};
use app::{poll_event, run_speed_test, App, AppAction, TestUpdate};
use clap::Parser;
use crossterm::event::Event;
use ratatui::DefaultTerminal;
use settings::Settings;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use ui::draw_ui;
use wifitop::config::EngineConfig;
use wifitop::speedtest::{HttpTransport, SpeedTest};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML file overriding the engine defaults
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display())),
            None => Ok(EngineConfig::default()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging()?;

    let config = args.engine_config()?;
    let transport = HttpTransport::new()?;

    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(&mut terminal, Settings::from_config(config), transport).await;

    ratatui::restore();
    result
}

/// The terminal belongs to the UI, so logs go to a file in the temp dir.
fn init_logging() -> Result<WorkerGuard> {
    let appender = tracing_appender::rolling::never(std::env::temp_dir(), "wifitop.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wifitop=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))?;
    Ok(guard)
}

async fn run_app(terminal: &mut DefaultTerminal, settings: Settings, transport: HttpTransport) -> Result<()> {
    let mut app = App::new(settings);
    let mut test_rx: Option<mpsc::UnboundedReceiver<TestUpdate>> = None;

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        // Handle test updates
        if let Some(rx) = test_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(update) => app.handle_update(update),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        test_rx = None;
                        break;
                    }
                }
            }
        }

        // Handle input
        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        match SpeedTest::with_transport(app.settings.engine_config(), transport.clone()) {
                            Ok(engine) => {
                                app.start_test(engine.cancel_handle());
                                let (tx, rx) = mpsc::unbounded_channel();
                                test_rx = Some(rx);
                                tokio::spawn(run_speed_test(engine, tx));
                            }
                            Err(e) => app.error = Some(e.to_string()),
                        }
                    }
                    AppAction::CancelTest => {
                        app.cancel_test();
                        test_rx = None;
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    if app.is_running() {
        app.cancel_test();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_flag_is_optional() {
        let args = Args::try_parse_from(["wifitop"]).unwrap();
        assert!(args.config.is_none());
        assert_eq!(args.engine_config().unwrap(), EngineConfig::default());

        let args = Args::try_parse_from(["wifitop", "--config", "net.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("net.toml")));
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let args = Args::try_parse_from(["wifitop", "-c", "/nonexistent/wifitop.toml"]).unwrap();
        let err = args.engine_config().unwrap_err();
        assert!(err.to_string().contains("loading /nonexistent/wifitop.toml"));
    }
}
