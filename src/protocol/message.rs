//! The `Message` sum type carried over the wire between client and daemon.

/// One protocol message. Every variant carries its own payload; the
/// discriminator (see [`Message::discriminant`]) is usable without decoding
/// the payload, which is what lets [`crate::connection::Connection`]
/// recognise a locally-echoed `CancelBuild` cheaply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sent once by the client to kick off a build.
    BuildRequest {
        working_dir: String,
        args: Vec<String>,
    },
    /// First message the daemon must send once it has accepted the request.
    BuildStarted { daemon_pid: u32 },
    /// A structured project-lifecycle event (e.g. "module X configured").
    ProjectEvent { project: String, description: String },
    /// A single line of build output.
    LogLine { text: String },
    /// The daemon is asking the user a question and is blocked on the answer.
    Prompt { message: String },
    /// The client's answer to a prior `Prompt`.
    PromptResponse { text: String },
    /// Liveness signal sent periodically by the daemon while otherwise idle.
    KeepAlive,
    /// Client-initiated build cancellation. Well-known discriminator with no
    /// payload, per the wire protocol.
    CancelBuild,
    /// Terminal message of a build; carries the process exit code.
    BuildFinished { exit_code: i32 },
}

/// Wire discriminator values. Stable across protocol versions; do not
/// renumber without also bumping [`crate::daemon::PROTOCOL_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Discriminant {
    BuildRequest = 1,
    BuildStarted = 2,
    ProjectEvent = 3,
    LogLine = 4,
    Prompt = 5,
    PromptResponse = 6,
    KeepAlive = 7,
    CancelBuild = 8,
    BuildFinished = 9,
}

impl Discriminant {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Discriminant::BuildRequest,
            2 => Discriminant::BuildStarted,
            3 => Discriminant::ProjectEvent,
            4 => Discriminant::LogLine,
            5 => Discriminant::Prompt,
            6 => Discriminant::PromptResponse,
            7 => Discriminant::KeepAlive,
            8 => Discriminant::CancelBuild,
            9 => Discriminant::BuildFinished,
            _ => return None,
        })
    }
}

impl Message {
    /// The wire discriminator for this message, without touching the payload.
    pub fn discriminant(&self) -> Discriminant {
        match self {
            Message::BuildRequest { .. } => Discriminant::BuildRequest,
            Message::BuildStarted { .. } => Discriminant::BuildStarted,
            Message::ProjectEvent { .. } => Discriminant::ProjectEvent,
            Message::LogLine { .. } => Discriminant::LogLine,
            Message::Prompt { .. } => Discriminant::Prompt,
            Message::PromptResponse { .. } => Discriminant::PromptResponse,
            Message::KeepAlive => Discriminant::KeepAlive,
            Message::CancelBuild => Discriminant::CancelBuild,
            Message::BuildFinished { .. } => Discriminant::BuildFinished,
        }
    }

    /// True iff this message is the well-known cancellation message.
    pub fn is_cancel_build(&self) -> bool {
        matches!(self, Message::CancelBuild)
    }
}
