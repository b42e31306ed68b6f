//! The recognized SMTP command set: which tokens are commands, which of them
//! are advertised as extensions, and the state mask each one requires.

use super::state::SessionState;

/// A recognized SMTP command token.
///
/// Lookup is an exact match on the uppercase wire token; anything else is
/// answered with `502`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    Vrfy,
    Expn,
    Size,
    StartTls,
    Auth,
}

impl Command {
    /// Extension names advertised in the EHLO reply, alphabetical.
    pub const EXTENSIONS: [&'static str; 6] =
        ["AUTH", "EXPN", "HELP", "SIZE", "STARTTLS", "VRFY"];

    /// Maps a wire token to a command. Case-sensitive.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "HELO" => Some(Self::Helo),
            "EHLO" => Some(Self::Ehlo),
            "MAIL" => Some(Self::Mail),
            "RCPT" => Some(Self::Rcpt),
            "DATA" => Some(Self::Data),
            "RSET" => Some(Self::Rset),
            "NOOP" => Some(Self::Noop),
            "QUIT" => Some(Self::Quit),
            "HELP" => Some(Self::Help),
            "VRFY" => Some(Self::Vrfy),
            "EXPN" => Some(Self::Expn),
            "SIZE" => Some(Self::Size),
            "STARTTLS" => Some(Self::StartTls),
            "AUTH" => Some(Self::Auth),
            _ => None,
        }
    }

    /// The state mask this command requires, or `None` when it is legal in
    /// every state.
    pub fn required_state(self) -> Option<SessionState> {
        match self {
            Self::Mail => Some(SessionState::EXPECT_MAIL),
            Self::Rcpt => Some(SessionState::EXPECT_RCPT),
            Self::Data => Some(SessionState::EXPECT_DATA),
            Self::Auth => Some(SessionState::EXPECT_AUTH),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_sensitive() {
        assert_eq!(Command::parse("HELO"), Some(Command::Helo));
        assert_eq!(Command::parse("helo"), None);
        assert_eq!(Command::parse("8BITMIME"), None);
    }

    #[test]
    fn sequenced_commands_declare_masks() {
        assert_eq!(
            Command::parse("RCPT").unwrap().required_state(),
            Some(SessionState::EXPECT_RCPT)
        );
        assert_eq!(Command::parse("NOOP").unwrap().required_state(), None);
    }

    #[test]
    fn extension_list_is_sorted() {
        let mut sorted = Command::EXTENSIONS;
        sorted.sort_unstable();
        assert_eq!(sorted, Command::EXTENSIONS);
    }
}
