use node_proto::Headers;

/// Something the application should know about a remote peer.
///
/// Per peer, `Enter` comes first and `Exit` comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Enter {
        peer: String,
        name: String,
        headers: Headers,
        endpoint: String,
    },
    Evasive {
        peer: String,
        name: String,
    },
    Exit {
        peer: String,
        name: String,
    },
    Join {
        peer: String,
        name: String,
        group: String,
    },
    Leave {
        peer: String,
        name: String,
        group: String,
    },
    Whisper {
        peer: String,
        name: String,
        payload: Vec<u8>,
    },
    Shout {
        peer: String,
        name: String,
        group: String,
        payload: Vec<u8>,
    },
    Stop {
        peer: String,
        name: String,
    },
}

impl Event {
    pub fn peer(&self) -> &str {
        match self {
            Self::Enter { peer, .. }
            | Self::Evasive { peer, .. }
            | Self::Exit { peer, .. }
            | Self::Join { peer, .. }
            | Self::Leave { peer, .. }
            | Self::Whisper { peer, .. }
            | Self::Shout { peer, .. }
            | Self::Stop { peer, .. } => peer,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Enter { name, .. }
            | Self::Evasive { name, .. }
            | Self::Exit { name, .. }
            | Self::Join { name, .. }
            | Self::Leave { name, .. }
            | Self::Whisper { name, .. }
            | Self::Shout { name, .. }
            | Self::Stop { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enter { .. } => "ENTER",
            Self::Evasive { .. } => "EVASIVE",
            Self::Exit { .. } => "EXIT",
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Whisper { .. } => "WHISPER",
            Self::Shout { .. } => "SHOUT",
            Self::Stop { .. } => "STOP",
        }
    }

    /// Group the event refers to, for `Join`, `Leave` and `Shout`.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Join { group, .. } | Self::Leave { group, .. } | Self::Shout { group, .. } => {
                Some(group)
            }
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Whisper { payload, .. } | Self::Shout { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let shout = Event::Shout {
            peer: "P1".into(),
            name: "alice".into(),
            group: "ROOM".into(),
            payload: b"hi".to_vec(),
        };
        assert_eq!(shout.peer(), "P1");
        assert_eq!(shout.name(), "alice");
        assert_eq!(shout.kind(), "SHOUT");
        assert_eq!(shout.group(), Some("ROOM"));
        assert_eq!(shout.payload(), Some(&b"hi"[..]));

        let exit = Event::Exit {
            peer: "P1".into(),
            name: "alice".into(),
        };
        assert_eq!(exit.kind(), "EXIT");
        assert_eq!(exit.group(), None);
        assert_eq!(exit.payload(), None);
    }
}
