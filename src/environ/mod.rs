//! The environment data model and command executor (§4.6).
//!
//! The builtin command registry is a `OnceCell<RwLock<Vec<Builtin>>>`,
//! a global, lazily-initialized, lock-protected table. It holds a `Vec`
//! rather than a keyed map since the dispatch contract is an explicit
//! linear scan by name, not a keyed lookup.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::RwLock;

use crate::device::{fs_open, Device, EntryKind, FileHandle, RequiredKind};
use crate::error::{ExecError, IoResult};
use crate::parser::{self, StrSource};
use crate::value::{Command, CommandList, Value, VarLookup};
use alloc::sync::Arc;

/// Names a user command may not `set`/`unset` (§3 "Environment").
const RESERVED_NAMES: &[&str] = &["device", "device_label", "device_uuid"];

/// Entries that a child environment does **not** inherit from its parent
/// (§3 "On creation with a parent").
const NO_INHERIT: &[&str] = &[
    "default",
    "gui",
    "gui_background",
    "gui_icon",
    "gui_selection",
    "hidden",
    "timeout",
];

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// What froze an [`Environment`] (§4.6: "`environ_set_loader` ... atomically
/// freezes the environment").
///
/// `Config` is this crate's resolution of an underspecified handoff: `config`
/// (§4.6) "hands the environment tree to the menu selector and then to the
/// OS boot" but must not call into [`crate::menu`]/[`crate::image`] itself
/// (that would cycle the module graph back through `environ`). Storing the
/// freshly built environment here lets the top-level driver that already
/// depends on all three modules pick it up and continue. See `DESIGN.md`.
pub enum LoaderKind {
    Reboot,
    Exit,
    Kboot,
    Linux,
    Config(Box<Environment>),
}

impl core::fmt::Debug for LoaderKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LoaderKind::Reboot => write!(f, "Reboot"),
            LoaderKind::Exit => write!(f, "Exit"),
            LoaderKind::Kboot => write!(f, "Kboot"),
            LoaderKind::Linux => write!(f, "Linux"),
            LoaderKind::Config(_) => write!(f, "Config(..)"),
        }
    }
}

#[derive(Debug)]
pub struct LoaderState {
    pub kind: LoaderKind,
}

/// A configuration environment: a set of named variables, zero or more
/// child environments reachable through the menu, and (once frozen) the
/// loader that will boot it (§3).
#[derive(Debug, Default)]
pub struct Environment {
    entries: Vec<(String, Value)>,
    pub menu_entries: Vec<Environment>,
    pub device: Option<Arc<Device>>,
    pub directory: Option<FileHandle>,
    loader: Option<LoaderState>,
    current_command: Option<String>,
}

impl VarLookup for Environment {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a child of `self`: entries are cloned except the no-inherit
    /// set; `device` and `directory` are shared by reference, with the
    /// directory handle retained (§3).
    #[must_use]
    pub fn child(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(name, _)| !NO_INHERIT.contains(&name.as_str()))
            .cloned()
            .collect();
        Self {
            entries,
            menu_entries: Vec::new(),
            device: self.device.clone(),
            directory: self.directory.as_ref().map(FileHandle::retain),
            loader: None,
            current_command: None,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: String, value: Value) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn unset(&mut self, name: &str) {
        self.entries.retain(|(k, _)| k != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn loader(&self) -> Option<&LoaderState> {
        self.loader.as_ref()
    }

    #[must_use]
    pub fn current_command(&self) -> Option<&str> {
        self.current_command.as_deref()
    }

    /// Freezes this environment against further execution (§3, §4.6,
    /// property 4).
    ///
    /// # Errors
    ///
    /// [`ExecError::LoaderAlreadySet`] if a loader was already recorded.
    pub fn set_loader(&mut self, kind: LoaderKind) -> Result<(), ExecError> {
        if self.loader.is_some() {
            return Err(ExecError::LoaderAlreadySet);
        }
        self.loader = Some(LoaderState { kind });
        Ok(())
    }

    /// Substitutes `entry`'s arguments against `self`, looks up the
    /// matching builtin, and invokes it, tracking `current_command` for
    /// the duration so nested failures can quote the command name (§4.6).
    ///
    /// # Errors
    ///
    /// [`ExecError::UnknownCommand`] if no builtin is registered under
    /// `entry.name`; [`ExecError::Variable`] if argument substitution
    /// fails; whatever the builtin itself returns otherwise.
    pub fn command_exec(&mut self, entry: &Command) -> Result<(), ExecError> {
        let substituted = Value::ValueList(entry.args.clone()).substitute(self)?;
        let Value::ValueList(args) = substituted else {
            unreachable!("substitute preserves the ValueList shape")
        };

        let handler = {
            let table = registry().read();
            table.iter().find(|b| b.name == entry.name).map(|b| b.handler)
        };
        let handler = handler.ok_or(ExecError::UnknownCommand)?;

        let previous = self.current_command.take();
        self.current_command = Some(entry.name.clone());
        let result = handler(self, &args);
        self.current_command = previous;
        result
    }

    /// Executes `list` against `self` in order. Once `self.loader` is set,
    /// every remaining command is rejected with `LoaderAlreadySet` instead
    /// of running (§4.6 invariant, property 4, scenario S2).
    ///
    /// # Errors
    ///
    /// Whatever the first failing command returns; execution stops there.
    pub fn command_list_exec(&mut self, list: &CommandList) -> Result<(), ExecError> {
        for cmd in list {
            if self.loader.is_some() {
                return Err(ExecError::LoaderAlreadySet);
            }
            self.command_exec(cmd)?;
        }
        Ok(())
    }
}

type Handler = fn(&mut Environment, &[Value]) -> Result<(), ExecError>;

pub struct Builtin {
    pub name: &'static str,
    pub handler: Handler,
}

static REGISTRY: OnceCell<RwLock<Vec<Builtin>>> = OnceCell::uninit();

fn registry() -> &'static RwLock<Vec<Builtin>> {
    REGISTRY.init_once(|| RwLock::new(default_builtins()));
    REGISTRY.get().expect("initialized immediately above")
}

fn default_builtins() -> Vec<Builtin> {
    alloc::vec![
        Builtin { name: "set", handler: builtin_set },
        Builtin { name: "unset", handler: builtin_unset },
        Builtin { name: "env", handler: builtin_env },
        Builtin { name: "help", handler: builtin_help },
        Builtin { name: "version", handler: builtin_version },
        Builtin { name: "reboot", handler: builtin_reboot },
        Builtin { name: "exit", handler: builtin_exit },
        Builtin { name: "config", handler: builtin_config },
        Builtin { name: "include", handler: builtin_include },
        Builtin { name: "menu_entry", handler: builtin_menu_entry },
        Builtin { name: "kboot", handler: builtin_kboot },
        Builtin { name: "linux", handler: builtin_linux },
    ]
}

fn builtin_set(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::String(name), value] = args else {
        return Err(ExecError::InvalidArguments);
    };
    if !is_valid_name(name) || is_reserved(name) {
        return Err(ExecError::ReservedName);
    }
    env.set(name.clone(), value.clone());
    Ok(())
}

fn builtin_unset(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::String(name)] = args else {
        return Err(ExecError::InvalidArguments);
    };
    if is_reserved(name) {
        return Err(ExecError::ReservedName);
    }
    env.unset(name);
    Ok(())
}

fn builtin_env(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    if !args.is_empty() {
        return Err(ExecError::InvalidArguments);
    }
    for (name, value) in env.iter() {
        match value.stringify() {
            Some(text) => kb_info!("{name}={text}"),
            None => kb_info!("{name}=<{value:?}>"),
        }
    }
    Ok(())
}

fn builtin_help(_env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    if !args.is_empty() {
        return Err(ExecError::InvalidArguments);
    }
    kb_info!(
        "commands: set unset env help version reboot exit config include menu_entry kboot linux"
    );
    Ok(())
}

fn builtin_version(_env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    if !args.is_empty() {
        return Err(ExecError::InvalidArguments);
    }
    kb_info!("KBoot {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn builtin_reboot(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    if !args.is_empty() {
        return Err(ExecError::InvalidArguments);
    }
    env.set_loader(LoaderKind::Reboot)
}

fn builtin_exit(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    if !args.is_empty() {
        return Err(ExecError::InvalidArguments);
    }
    env.set_loader(LoaderKind::Exit)
}

/// Reads a file fully into a CR-stripped UTF-8 string (§6: "CRLF or LF line
/// endings (CR is discarded)").
fn read_file_to_string(handle: &FileHandle) -> IoResult<String> {
    let mut buf = Vec::with_capacity(handle.size() as usize);
    let mut offset: u64 = 0;
    let mut chunk = [0u8; 512];
    loop {
        let n = handle.read(&mut chunk, offset)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        offset += n as u64;
    }
    Ok(String::from_utf8_lossy(&buf)
        .chars()
        .filter(|&c| c != '\r')
        .collect())
}

fn exec_file(env: &mut Environment, handle: &FileHandle) -> Result<(), ExecError> {
    let text = read_file_to_string(handle)?;
    let cmds = parser::parse(StrSource::new(&text))?;
    env.command_list_exec(&cmds)
}

/// `config <path>`: replaces the active configuration (§4.6). Builds a
/// fresh child of `env`, binds its device/directory to the new file's
/// mount, executes the new file's commands against it, and, on success,
/// stores the resulting tree as `env`'s loader (see [`LoaderKind::Config`]).
fn builtin_config(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::String(path)] = args else {
        return Err(ExecError::InvalidArguments);
    };
    let dir = env.directory.as_ref().ok_or(ExecError::InvalidArguments)?;
    let handle = fs_open(dir, path, RequiredKind::File)?;

    let mut child = env.child();
    child.directory = Some(env.directory.as_ref().unwrap().retain());
    exec_file(&mut child, &handle)?;

    env.set_loader(LoaderKind::Config(Box::new(child)))
}

/// `include <path>`: a single file is parsed and executed in place; a
/// directory's file entries are collected, sorted lexicographically by
/// name (the FS does not guarantee order), and executed in that order,
/// last writer wins (§4.6, property 7, scenario S3). Non-file entries
/// inside a directory are silently skipped.
fn builtin_include(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::String(path)] = args else {
        return Err(ExecError::InvalidArguments);
    };
    let dir = env.directory.as_ref().ok_or(ExecError::InvalidArguments)?;
    let target = fs_open(dir, path, RequiredKind::Any)?;

    match target.kind() {
        EntryKind::Regular => exec_file(env, &target),
        EntryKind::Dir => {
            let mut names = Vec::new();
            target.iterate(|e| {
                if e.kind == EntryKind::Regular {
                    names.push(e.name);
                }
            })?;
            names.sort();
            for name in names {
                let file = target.open_entry(&name)?;
                exec_file(env, &file)?;
            }
            Ok(())
        }
    }
}

/// `menu_entry <name> { ... }`: how `menu_entries` (§3, §4.7) actually gets
/// populated. Creates a child of `env` named `name`, executes the nested
/// command list against it (which may end in a `kboot`/`linux` command that
/// freezes the child), and appends it to `env.menu_entries`. See
/// `DESIGN.md`.
fn builtin_menu_entry(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::String(name), Value::CommandList(body)] = args else {
        return Err(ExecError::InvalidArguments);
    };
    let mut child = env.child();
    child.set("name".into(), Value::String(name.clone()));
    child.command_list_exec(body)?;
    env.menu_entries.push(child);
    Ok(())
}

/// An OS-loader command: stages its settings directly into the *current*
/// environment (§4.6: "they only validate their arguments, stage private
/// state, and call `environ_set_loader`") rather than creating a child;
/// the child, if any, was already created by `menu_entry`.
fn builtin_kboot(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::CommandList(body)] = args else {
        return Err(ExecError::InvalidArguments);
    };
    env.command_list_exec(body)?;
    env.set_loader(LoaderKind::Kboot)
}

fn builtin_linux(env: &mut Environment, args: &[Value]) -> Result<(), ExecError> {
    let [Value::CommandList(body)] = args else {
        return Err(ExecError::InvalidArguments);
    };
    env.command_list_exec(body)?;
    env.set_loader(LoaderKind::Linux)
}
