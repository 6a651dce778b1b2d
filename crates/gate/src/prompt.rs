//! Line and password input for the shell.

use std::io::{self, BufRead, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use owo_colors::OwoColorize;

/// Default prompt shown while a command is expected.
pub fn shell_prompt() -> String {
    format!("{} ", "securegate$".cyan().bold())
}

/// Print `prompt` and read one line. `Ok(None)` means end of input.
pub fn read_line(prompt: &str) -> io::Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush()?;

    let mut line = String::new();
    let read = io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Print `prompt` and read a line without echoing it.
pub fn read_password(prompt: &str) -> io::Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush()?;

    let _guard = RawGuard::enter()?;
    let mut password = String::new();
    loop {
        match event::read()? {
            Event::Key(KeyEvent {
                code: KeyCode::Enter,
                ..
            }) => break,
            Event::Key(KeyEvent {
                code: KeyCode::Char('c'),
                modifiers: KeyModifiers::CONTROL,
                ..
            }) => {
                drop(_guard);
                println!();
                return Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
            }
            Event::Key(KeyEvent {
                code: KeyCode::Char('d'),
                modifiers: KeyModifiers::CONTROL,
                ..
            }) => {
                drop(_guard);
                println!();
                return Ok(None);
            }
            Event::Key(KeyEvent {
                code: KeyCode::Backspace,
                ..
            }) => {
                password.pop();
            }
            Event::Key(KeyEvent {
                code: KeyCode::Char(c),
                ..
            }) => password.push(c),
            _ => {}
        }
    }
    drop(_guard);
    println!();
    Ok(Some(password))
}

struct RawGuard;

impl RawGuard {
    fn enter() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}
