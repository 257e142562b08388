mod cli;

use std::fs::{self, File};
use std::io::{self, Stdout};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;
use clap::Parser;
use cli::Cli;
use color_eyre::eyre::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tracing_subscriber::EnvFilter;

use trainscope::app::{App, SupervisorConfig};
use trainscope::ui::{self, Charts};

const INPUT_POLL: Duration = Duration::from_millis(50);

fn setup_terminal() -> Result<(Terminal<CrosstermBackend<Stdout>>, CrosstermGuard)> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok((terminal, CrosstermGuard))
}

struct CrosstermGuard;

impl Drop for CrosstermGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = execute!(stdout, LeaveAlternateScreen);
    }
}

/// The TUI owns the terminal, so its logs go to a file; headless
/// subcommands log to stderr unless `--log` is given.
fn init_tracing(log: Option<&Path>, tui: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let path = match (log, tui) {
        (Some(path), _) => Some(path.to_path_buf()),
        (None, true) => {
            let log_dir = PathBuf::from("logs");
            fs::create_dir_all(&log_dir)
                .wrap_err_with(|| format!("failed to create {}", log_dir.display()))?;
            let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            Some(log_dir.join(format!("trainscope_{timestamp}.log")))
        }
        (None, false) => None,
    };

    match path {
        Some(path) => {
            let file = File::create(&path)
                .wrap_err_with(|| format!("failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

fn handle_key_event(app: &mut App, key: KeyEvent) -> Result<()> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        app.request_quit();
        return Ok(());
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => app.request_quit(),
        KeyCode::Char('t') | KeyCode::Char('T') => app.start_training()?,
        KeyCode::Char('c') | KeyCode::Char('C') => app.cancel_training(),
        KeyCode::Char('k') | KeyCode::Char('K') => app.kill_training(),
        KeyCode::Char('r') | KeyCode::Char('R') => app.load_recording(None),
        KeyCode::Char('l') | KeyCode::Char('L') => app.return_to_live(),
        KeyCode::Char(' ') => app.toggle_playback(Instant::now()),
        KeyCode::Char('s') | KeyCode::Char('S') => app.stop_playback(),
        KeyCode::Left => app.scrub(-1),
        KeyCode::Right => app.scrub(1),
        KeyCode::PageDown => app.scrub(-10),
        KeyCode::PageUp => app.scrub(10),
        KeyCode::Char('+') | KeyCode::Char('=') => app.change_speed(true),
        KeyCode::Char('-') | KeyCode::Char('_') => app.change_speed(false),
        _ => {}
    }
    Ok(())
}

/// Waits for input no longer than the next playback tick.
fn input_timeout(app: &App, now: Instant) -> Duration {
    app.playback()
        .next_deadline()
        .map(|deadline| deadline.saturating_duration_since(now).min(INPUT_POLL))
        .unwrap_or(INPUT_POLL)
}

fn run(config: SupervisorConfig, run_file: Option<PathBuf>) -> Result<()> {
    let mut app = App::new(config);
    let charts = Charts::attach(&mut app);
    app.check_scripts();
    if let Some(path) = run_file {
        app.view_saved_run(&path);
    }

    let (mut terminal, _guard) = setup_terminal()?;
    let result = run_loop(&mut terminal, &mut app, &charts);
    app.shutdown();
    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    charts: &Charts,
) -> Result<()> {
    while !app.should_quit() {
        app.process_background_tasks();
        app.poll_playback(Instant::now());

        terminal.draw(|frame| ui::render(frame, app, charts))?;

        if event::poll(input_timeout(app, Instant::now()))? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    handle_key_event(app, key_event)?
                }
                Event::Resize(_, _) => {
                    terminal.clear()?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.log.as_deref(), cli.command.is_none())?;
    let config = SupervisorConfig::load_or_default(cli.config.as_deref())?;

    if cli.command.is_some() {
        cli::handle_cli(cli, config)?;
    } else {
        run(config, cli.run)?;
    }

    Ok(())
}
