//! Control socket command codec
//!
//! Commands are short ASCII tokens with no framing; one read carries one
//! command. Replies are `OK` or `Invalid`.

use std::fmt;

pub const REPLY_OK: &[u8] = b"OK";
pub const REPLY_INVALID: &[u8] = b"Invalid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Drain,
    Drop,
    Pause,
    Resume,
}

impl Command {
    pub fn token(self) -> &'static str {
        match self {
            Command::Drain => "Drain",
            Command::Drop => "Drop",
            Command::Pause => "Pause",
            Command::Resume => "Resume",
        }
    }

    /// Parse one received command. Trailing NULs and whitespace are ignored.
    pub fn parse(raw: &[u8]) -> Option<Command> {
        let end = raw
            .iter()
            .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        match &raw[..end] {
            b"Drain" => Some(Command::Drain),
            b"Drop" => Some(Command::Drop),
            b"Pause" => Some(Command::Pause),
            b"Resume" => Some(Command::Resume),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        for cmd in [Command::Drain, Command::Drop, Command::Pause, Command::Resume] {
            assert_eq!(Command::parse(cmd.token().as_bytes()), Some(cmd));
        }
        assert_eq!(Command::parse(b"Pause\0"), Some(Command::Pause));
        assert_eq!(Command::parse(b"Resume\n"), Some(Command::Resume));
    }

    #[test]
    fn test_rejects_unknown_and_partial() {
        assert_eq!(Command::parse(b""), None);
        assert_eq!(Command::parse(b"Dra"), None);
        assert_eq!(Command::parse(b"drain"), None);
        assert_eq!(Command::parse(b"Stop"), None);
    }
}
