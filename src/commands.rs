//! Terminal command parsing.
//!
//! Anything that is not a recognized command is chat. The one-letter
//! answer/reject shortcuts are only live while a call is ringing, so
//! ordinary one-letter chat is not swallowed.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Call(String),
    Answer,
    Reject,
    HangUp,
    JoinGroup,
    LeaveGroup,
    Talk,
    StopTalk,
    Video,
    VideoStop,
    Mute,
    Unmute,
    Peers,
    Status,
    Devices,
    Help,
    Quit,
    Chat(String),
}

impl Command {
    /// Parse one input line. Empty lines parse to `None`.
    pub fn parse(line: &str, ringing: bool) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };

        let cmd = match word.to_lowercase().as_str() {
            "call" | "c" if !rest.is_empty() => Command::Call(rest.to_string()),
            "answer" => Command::Answer,
            "reject" => Command::Reject,
            "a" if rest.is_empty() && ringing => Command::Answer,
            "r" if rest.is_empty() && ringing => Command::Reject,
            "hangup" | "h" | "end" if rest.is_empty() => Command::HangUp,
            "voice" | "v" if rest.is_empty() => Command::JoinGroup,
            "leave" if rest.is_empty() => Command::LeaveGroup,
            "talk" | "t" if rest.is_empty() => Command::Talk,
            "stop" | "s" if rest.is_empty() => Command::StopTalk,
            "video" if rest.is_empty() => Command::Video,
            "video" if rest.eq_ignore_ascii_case("stop") => Command::VideoStop,
            "mute" if rest.is_empty() => Command::Mute,
            "unmute" if rest.is_empty() => Command::Unmute,
            "peers" | "p" | "who" if rest.is_empty() => Command::Peers,
            "status" if rest.is_empty() => Command::Status,
            "devices" if rest.is_empty() => Command::Devices,
            "help" | "?" if rest.is_empty() => Command::Help,
            "quit" | "q" | "exit" if rest.is_empty() => Command::Quit,
            _ => Command::Chat(line.to_string()),
        };
        Some(cmd)
    }
}
