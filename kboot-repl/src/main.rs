//! Hosts the KBoot shell (§4.9) over stdio, for exercising the parser and
//! command executor without a firmware console.

use std::io::{self, Read, Write};

use kboot::environ::{Environment, LoaderKind};
use kboot::shell::{self, Console};

struct StdioConsole {
    stdin: io::Stdin,
}

impl Console for StdioConsole {
    // Reads one byte at a time rather than decoding UTF-8 proper: the
    // configuration grammar (§4.5) only ever needs ASCII structural
    // characters, and quoted string bodies pass through byte for byte.
    fn read_char(&mut self) -> Option<char> {
        let mut buf = [0u8; 1];
        match self.stdin.read(&mut buf) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(buf[0] as char),
        }
    }

    fn write_str(&mut self, s: &str) {
        print!("{s}");
        let _ = io::stdout().flush();
    }
}

fn main() {
    let mut env = Environment::new();
    let mut console = StdioConsole { stdin: io::stdin() };
    shell::run(&mut env, &mut console);

    match env.loader().map(|state| &state.kind) {
        Some(LoaderKind::Exit) => println!("exit"),
        Some(LoaderKind::Reboot) => println!("reboot"),
        Some(LoaderKind::Kboot) => println!("kboot: would load kernel"),
        Some(LoaderKind::Linux) => println!("linux: would load kernel"),
        Some(LoaderKind::Config(_)) => println!("config: would switch configuration"),
        None => println!("(no input)"),
    }
}
