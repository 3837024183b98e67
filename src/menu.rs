//! The timed menu selector (§4.7).
//!
//! Picking the highlighted entry, handling a countdown, and painting pixels
//! are all external concerns, firmware/video-specific, like the hooks in
//! [`crate::arch`]. This module owns only the timed-loop/selection logic and
//! reaches the outside world through two small trait objects: [`MenuClock`]
//! (a TSC-backed delay, `time::now`/`wait!`) and [`MenuUi`] (key polling and
//! rendering).

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::environ::Environment;
use crate::value::Value;

/// How often the countdown loop polls the console and re-renders (§5: "the
/// menu timeout loop ... alternates short delays (~10 ms) with console
/// polling and timer-tick accounting").
pub const POLL_INTERVAL_MS: u32 = 10;

/// A monotonic millisecond clock, with a busy-wait delay primitive. The
/// concrete implementation is a thin wrapper over firmware/TSC timing, kept
/// out of this crate the same way [`crate::arch::ArchHooks`] keeps CPU
/// bring-up out.
pub trait MenuClock: Send {
    fn now_ms(&self) -> u64;
    /// Busy-waits for approximately `ms` milliseconds.
    fn delay_ms(&self, ms: u32);
}

/// A key read from the console during the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuKey {
    Up,
    Down,
    Enter,
    Escape,
}

/// The presentation layer: non-blocking key polling plus a render callback
/// invoked once per loop iteration.
pub trait MenuUi {
    /// Returns `None` if no key has been pressed since the last poll.
    fn poll_key(&mut self) -> Option<MenuKey>;
    /// `remaining_ms` is `None` once there is no timeout, or once it has
    /// already elapsed and the default is about to be chosen.
    fn render(&mut self, names: &[&str], selected: usize, remaining_ms: Option<u64>);
}

/// The result of running the menu: either an environment with its loader
/// set, or a user cancellation (§5: "the only user cancellation path is ESC
/// at the menu, which falls through to the shell").
pub enum MenuOutcome {
    Selected(Box<Environment>),
    Cancelled,
}

fn entry_name(env: &Environment, index: usize) -> String {
    env.get("name")
        .and_then(Value::stringify)
        .unwrap_or_else(|| format!("entry {index}"))
}

fn is_hidden(env: &Environment) -> bool {
    matches!(env.get("hidden"), Some(Value::Boolean(true)))
}

/// Runs the menu over `root.menu_entries` (§4.7).
///
/// If the list is empty (or every entry is hidden), `root` itself is
/// returned as the selection. It is assumed to already carry its own
/// loader, set directly by a top-level `kboot`/`linux`/`reboot`/`exit`
/// command rather than through `menu_entry`.
pub fn run(root: Environment, clock: &dyn MenuClock, ui: &mut dyn MenuUi) -> MenuOutcome {
    let visible: Vec<usize> = (0..root.menu_entries.len())
        .filter(|&i| !is_hidden(&root.menu_entries[i]))
        .collect();
    if visible.is_empty() {
        return MenuOutcome::Selected(Box::new(root));
    }

    let default_name = root.get("default").and_then(Value::stringify);
    let mut selected = default_name
        .as_deref()
        .and_then(|name| visible.iter().position(|&i| entry_name(&root.menu_entries[i], i) == name))
        .unwrap_or(0);

    let timeout_ms = match root.get("timeout") {
        Some(Value::Integer(seconds)) => Some(seconds.saturating_mul(1000)),
        _ => None,
    };
    let deadline = timeout_ms.map(|ms| clock.now_ms().saturating_add(ms));

    loop {
        let names: Vec<String> = visible.iter().map(|&i| entry_name(&root.menu_entries[i], i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let remaining = deadline.map(|d| d.saturating_sub(clock.now_ms()));
        ui.render(&name_refs, selected, remaining);

        if remaining == Some(0) {
            break;
        }

        match ui.poll_key() {
            Some(MenuKey::Up) => selected = selected.checked_sub(1).unwrap_or(visible.len() - 1),
            Some(MenuKey::Down) => selected = (selected + 1) % visible.len(),
            Some(MenuKey::Enter) => break,
            Some(MenuKey::Escape) => return MenuOutcome::Cancelled,
            None => {}
        }

        clock.delay_ms(POLL_INTERVAL_MS);
    }

    let index = visible[selected];
    let chosen = root
        .menu_entries
        .into_iter()
        .nth(index)
        .expect("selected index stays within menu_entries for the lifetime of the loop");
    MenuOutcome::Selected(Box::new(chosen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environ::LoaderKind;
    use core::cell::Cell;

    struct FakeClock {
        now: Cell<u64>,
    }
    impl MenuClock for FakeClock {
        fn now_ms(&self) -> u64 {
            self.now.get()
        }
        fn delay_ms(&self, ms: u32) {
            self.now.set(self.now.get() + u64::from(ms));
        }
    }

    struct ScriptedUi {
        keys: Vec<Option<MenuKey>>,
    }
    impl MenuUi for ScriptedUi {
        fn poll_key(&mut self) -> Option<MenuKey> {
            if self.keys.is_empty() {
                None
            } else {
                self.keys.remove(0)
            }
        }
        fn render(&mut self, _names: &[&str], _selected: usize, _remaining_ms: Option<u64>) {}
    }

    fn child_named(name: &str) -> Environment {
        let mut env = Environment::new();
        env.set("name".into(), Value::String(name.into()));
        env
    }

    #[test]
    fn empty_menu_returns_root_unchanged() {
        let mut root = Environment::new();
        root.set_loader(LoaderKind::Reboot).unwrap();
        let clock = FakeClock { now: Cell::new(0) };
        let mut ui = ScriptedUi { keys: Vec::new() };
        match run(root, &clock, &mut ui) {
            MenuOutcome::Selected(env) => assert!(matches!(env.loader().unwrap().kind, LoaderKind::Reboot)),
            MenuOutcome::Cancelled => panic!("expected a selection"),
        }
    }

    #[test]
    fn enter_selects_highlighted_entry() {
        let mut root = Environment::new();
        root.menu_entries.push(child_named("first"));
        root.menu_entries.push(child_named("second"));
        let clock = FakeClock { now: Cell::new(0) };
        let mut ui = ScriptedUi {
            keys: alloc::vec![Some(MenuKey::Down), Some(MenuKey::Enter)],
        };
        match run(root, &clock, &mut ui) {
            MenuOutcome::Selected(env) => {
                assert_eq!(env.get("name"), Some(&Value::String("second".into())));
            }
            MenuOutcome::Cancelled => panic!("expected a selection"),
        }
    }

    #[test]
    fn escape_cancels() {
        let mut root = Environment::new();
        root.menu_entries.push(child_named("only"));
        let clock = FakeClock { now: Cell::new(0) };
        let mut ui = ScriptedUi {
            keys: alloc::vec![Some(MenuKey::Escape)],
        };
        assert!(matches!(run(root, &clock, &mut ui), MenuOutcome::Cancelled));
    }

    #[test]
    fn timeout_elapses_to_default() {
        let mut root = Environment::new();
        root.set("timeout".into(), Value::Integer(1));
        root.set("default".into(), Value::String("second".into()));
        root.menu_entries.push(child_named("first"));
        root.menu_entries.push(child_named("second"));
        let clock = FakeClock { now: Cell::new(0) };
        let mut ui = ScriptedUi {
            keys: alloc::vec![None; 200],
        };
        match run(root, &clock, &mut ui) {
            MenuOutcome::Selected(env) => {
                assert_eq!(env.get("name"), Some(&Value::String("second".into())));
            }
            MenuOutcome::Cancelled => panic!("expected a selection"),
        }
    }

    #[test]
    fn hidden_entries_are_skipped_in_navigation() {
        let mut root = Environment::new();
        let mut hidden = child_named("hidden-one");
        hidden.set("hidden".into(), Value::Boolean(true));
        root.menu_entries.push(hidden);
        root.menu_entries.push(child_named("visible-one"));
        let clock = FakeClock { now: Cell::new(0) };
        let mut ui = ScriptedUi {
            keys: alloc::vec![Some(MenuKey::Enter)],
        };
        match run(root, &clock, &mut ui) {
            MenuOutcome::Selected(env) => {
                assert_eq!(env.get("name"), Some(&Value::String("visible-one".into())));
            }
            MenuOutcome::Cancelled => panic!("expected a selection"),
        }
    }
}
