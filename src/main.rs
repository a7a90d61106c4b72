//! Time Tracker - countdown and count-up work timer.
//!
//! Each invocation resumes the saved timer, runs one command and exits.
//! `timetracker run` stays in the foreground, ticking every second and
//! reading commands from stdin.

use std::cell::{OnceCell, RefCell};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use timetracker::audio::AudioPlayer;
use timetracker::clock::SystemClock;
use timetracker::config::Config;
use timetracker::engine::TimerEngine;
use timetracker::event::{self, Command, EventResult};
use timetracker::idle::IdleReminder;
use timetracker::logging;
use timetracker::notifications;
use timetracker::persistence::Database;
use timetracker::time_util::system_timezone;
use timetracker::timer::{self, TimerMessage};

/// How long the interactive loop waits for input before draining messages.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "timetracker")]
#[command(about = "Countdown and count-up work timer with a session log")]
#[command(version)]
struct Cli {
    /// Database file (overrides the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn log_level<'a>(&self, config: &'a Config) -> &'a str {
        if self.verbose {
            "debug"
        } else {
            &config.logging.level
        }
    }
}

/// Renders engine messages: prints, notifies and chimes.
struct Presenter {
    rx: Receiver<TimerMessage>,
    interactive: bool,
    // Opened on first use, on the main thread; rodio's stream is not Send
    audio: OnceCell<Option<AudioPlayer>>,
    notices: RefCell<Vec<JoinHandle<()>>>,
}

impl Presenter {
    fn new(rx: Receiver<TimerMessage>, interactive: bool) -> Self {
        Self {
            rx,
            interactive,
            audio: OnceCell::new(),
            notices: RefCell::new(Vec::new()),
        }
    }

    fn audio(&self) -> Option<&AudioPlayer> {
        self.audio
            .get_or_init(|| match AudioPlayer::new() {
                Ok(player) => Some(player),
                Err(e) => {
                    warn!(error = %e, "Audio unavailable");
                    None
                }
            })
            .as_ref()
    }

    fn process_timer_messages(&self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.handle_message(msg);
        }
    }

    fn handle_message(&self, msg: TimerMessage) {
        match msg {
            TimerMessage::StateChanged { text, title } => {
                debug!(%text, %title, "Display changed");
                if self.interactive && io::stdout().is_terminal() {
                    print!("\x1b]0;{}\x07", title);
                    let _ = io::stdout().flush();
                }
            }
            TimerMessage::LogUpdated => debug!("Session log updated"),
            TimerMessage::FinalizeNeeded(pending) => {
                println!(
                    "Name the stopped count-up ({} to {}) with: finalize <task>",
                    pending.start, pending.end
                );
            }
            TimerMessage::Alert(alert) => {
                info!(kind = ?alert.kind, "Alert");
                if let Some(notice) = &alert.notice {
                    if self.interactive {
                        println!("\n[{}] {}", notice.summary, notice.body);
                    }
                    let handle = notifications::show_notice(notice);
                    if !self.interactive {
                        self.notices.borrow_mut().push(handle);
                    }
                }
                if let Some(length) = alert.chime {
                    if let Some(audio) = self.audio() {
                        audio.play_chime(length);
                    }
                }
            }
            TimerMessage::SoundMuted => {
                if let Some(Some(audio)) = self.audio.get() {
                    audio.stop();
                }
            }
        }
    }

    /// Lets notifications and the chime finish before a one-shot exit.
    fn finish(&self) {
        for handle in self.notices.borrow_mut().drain(..) {
            let _ = handle.join();
        }
        if let Some(Some(audio)) = self.audio.get() {
            audio.wait();
        }
    }
}

fn lock(engine: &Mutex<TimerEngine>) -> Result<MutexGuard<'_, TimerEngine>> {
    engine.lock().map_err(|_| anyhow!("Engine lock poisoned"))
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn run_once(
    mut engine: TimerEngine,
    presenter: &Presenter,
    idle: &IdleReminder,
    command: Command,
) -> Result<()> {
    let show_idle = command == Command::Status;
    let result = event::handle_command(&mut engine, command);
    presenter.process_timer_messages();

    if let Ok(EventResult::Output(text)) = &result {
        println!("{}", text);
        if show_idle && !engine.is_running() {
            println!("Idle reminder: {}", idle.status(&engine));
        }
    }

    presenter.finish();
    result?;
    Ok(())
}

fn run_interactive(engine: TimerEngine, presenter: &Presenter, idle: IdleReminder) -> Result<()> {
    let engine = Arc::new(Mutex::new(engine));
    let running = Arc::new(AtomicBool::new(true));

    // Spawn timer tick thread
    let ticker = {
        let engine = Arc::clone(&engine);
        let running = Arc::clone(&running);
        thread::spawn(move || timer::run_timer_loop(engine, idle, running))
    };

    // Stdin blocks, so it gets its own thread
    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    println!("Interactive mode. Type 'help' for commands, 'quit' to leave.");
    {
        let mut engine = lock(&engine)?;
        if let EventResult::Output(text) = event::handle_command(&mut engine, Command::Status)? {
            println!("{}", text);
        }
    }
    presenter.process_timer_messages();
    prompt();

    loop {
        presenter.process_timer_messages();

        let line = match line_rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event::parse_line(&line) {
            Ok(None) => {}
            Ok(Some(Command::Run)) => println!("Already running interactively"),
            Ok(Some(command)) => {
                let result = {
                    let mut engine = lock(&engine)?;
                    event::handle_command(&mut engine, command)
                };
                presenter.process_timer_messages();
                match result {
                    Ok(EventResult::Output(text)) => println!("{}", text),
                    Ok(EventResult::Quit) => break,
                    Ok(EventResult::Interactive) => {}
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(usage) => println!("{}", usage.trim_end()),
        }
        prompt();
    }

    running.store(false, Ordering::Relaxed);
    let _ = ticker.join();
    presenter.process_timer_messages();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    logging::init(cli.log_level(&config));

    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    let default_tz = config.display_timezone()?.unwrap_or_else(system_timezone);
    let idle = config.idle.reminder()?;

    // Create channel for timer messages
    let (tx, rx) = mpsc::channel();
    let mut engine = TimerEngine::new(Arc::new(db), Box::new(SystemClock), tx)
        .with_default_timezone(default_tz);
    engine
        .restore()
        .context("Failed to restore the saved timer")?;

    let command = cli.command.unwrap_or(Command::Status);
    if command == Command::Run {
        let presenter = Presenter::new(rx, true);
        run_interactive(engine, &presenter, idle)
    } else {
        let presenter = Presenter::new(rx, false);
        run_once(engine, &presenter, &idle, command)
    }
}
