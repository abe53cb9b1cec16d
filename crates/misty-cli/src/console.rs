//! Console lines as skill inputs.

use std::io::{self, BufRead};
use std::thread;

use misty_runtime::SkillInput;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Forward every stdin line to `sender` from a background thread.
///
/// The thread ends at EOF, on a read error, or once the skill stops
/// listening.
pub fn forward_stdin(sender: UnboundedSender<SkillInput>) -> thread::JoinHandle<()> {
    thread::spawn(move || forward_lines(io::stdin().lock(), &sender))
}

pub(crate) fn forward_lines(reader: impl BufRead, sender: &UnboundedSender<SkillInput>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "console read failed");
                return;
            }
        };
        if sender.send(SkillInput::UserLine(line.trim().to_string())).is_err() {
            debug!("skill no longer reads console input");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn each_line_becomes_one_trimmed_input() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(io::Cursor::new("yes\n  Dana \nstop\n"), &tx);

        let mut lines = Vec::new();
        while let Ok(SkillInput::UserLine(line)) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines, ["yes", "Dana", "stop"]);
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        forward_lines(io::Cursor::new("a\nb\n"), &tx);
    }
}
