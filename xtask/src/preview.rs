//! Drives the real [`kboot::menu`] selector on the host terminal against a
//! `kboot.cfg`, so a menu layout can be checked without a firmware console
//! or a kernel to actually hand off to.
//!
//! The terminal setup/teardown and the draw loop follow the same
//! crossterm/ratatui shape used elsewhere in this workspace's TUI tooling;
//! only the widgets differ.

use std::fs;
use std::io;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use argh::FromArgs;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Rect;
use ratatui::style::{Modifier, Style};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState};
use ratatui::{Frame, Terminal};

use kboot::environ::Environment;
use kboot::menu::{MenuClock, MenuKey, MenuOutcome, MenuUi};
use kboot::parser::{parse, StrSource};

/// Previews a `kboot.cfg`'s menu entries interactively.
#[derive(FromArgs)]
#[argh(subcommand, name = "preview")]
pub struct PreviewArgs {
    /// path to the `kboot.cfg` to preview
    #[argh(option)]
    config: std::path::PathBuf,
}

struct HostClock {
    start: Instant,
}

impl MenuClock for HostClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}

struct TerminalUi<'a> {
    term: &'a mut Terminal<CrosstermBackend<io::Stdout>>,
}

impl MenuUi for TerminalUi<'_> {
    fn poll_key(&mut self) -> Option<MenuKey> {
        if !event::poll(Duration::from_millis(0)).unwrap_or(false) {
            return None;
        }
        match event::read().ok()? {
            Event::Key(key) => match key.code {
                KeyCode::Up => Some(MenuKey::Up),
                KeyCode::Down => Some(MenuKey::Down),
                KeyCode::Enter => Some(MenuKey::Enter),
                KeyCode::Esc => Some(MenuKey::Escape),
                _ => None,
            },
            _ => None,
        }
    }

    fn render(&mut self, names: &[&str], selected: usize, remaining_ms: Option<u64>) {
        let items: Vec<ListItem> = names.iter().map(|n| ListItem::new(*n)).collect();
        let mut state = ListState::default();
        state.select(Some(selected));
        let title = match remaining_ms {
            Some(ms) => format!("KBoot menu (booting default in {}s)", ms / 1000),
            None => "KBoot menu".to_string(),
        };
        let _ = self.term.draw(|f: &mut Frame<'_, CrosstermBackend<io::Stdout>>| {
            let area: Rect = f.size();
            let list = List::new(items)
                .block(Block::default().borders(Borders::ALL).title(title))
                .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
            f.render_stateful_widget(list, area, &mut state);
        });
    }
}

pub fn run(args: &PreviewArgs) -> Result<()> {
    let text = fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let commands = parse(StrSource::new(&text)).map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let mut root = Environment::new();
    root.command_list_exec(&commands).map_err(|e| anyhow::anyhow!("{e:?}"))?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let clock = HostClock { start: Instant::now() };
    let mut ui = TerminalUi { term: &mut terminal };
    let outcome = kboot::menu::run(root, &clock, &mut ui);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    match outcome {
        MenuOutcome::Selected(env) => {
            let name = env.get("name").and_then(kboot::value::Value::stringify);
            println!("selected: {}", name.as_deref().unwrap_or("<root>"));
        }
        MenuOutcome::Cancelled => println!("cancelled"),
    }

    Ok(())
}
