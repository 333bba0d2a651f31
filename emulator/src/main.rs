mod script;
mod session;

use std::io::{self, BufRead, Write};

use tracker_core::EventQueue;
use tracker_core::config::ControlConfig;

use session::{QUEUE_DEPTH, Session};

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    let queue = EventQueue::<QUEUE_DEPTH>::new();
    let mut session = Session::new(&queue, ControlConfig::new());
    let mut line = String::new();

    writeln!(
        writer,
        "Tracker control-plane emulator ready. Type `help` for commands or `exit` to quit."
    )?;
    for output in session.boot() {
        writeln!(writer, "{output}")?;
    }

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for output in session.handle_line(trimmed) {
            writeln!(writer, "{output}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}
