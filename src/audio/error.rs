use thiserror::Error;

use crate::audio::codec::CodecError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no relay node is connected")]
    NotConnected,
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("relay websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed relay payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("invalid relay address {0}")]
    Address(String),
}

/// Errors raised by the per-guild audio core.
///
/// The first group is caused by user input and is shown as-is; the rest are
/// infrastructure failures that get logged and reduced to a generic message.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("You must join a voice channel first.")]
    UserNotInChannel,
    #[error("You need to be in the same voice channel as me.")]
    NotInSameChannel,
    #[error("I am not allowed to connect to that voice channel.")]
    ConnectDenied,
    #[error("I am not allowed to speak in that voice channel.")]
    SpeakDenied,
    #[error("That voice channel is full.")]
    ChannelFull,
    #[error("That voice channel no longer exists.")]
    ChannelNotFound,
    #[error("Nothing is playing right now.")]
    NothingPlaying,
    #[error("The queue is full ({0} tracks).")]
    QueueFull(usize),
    #[error("Too many players are active right now, try again later.")]
    PlayerLimitReached,
    #[error("No matches for `{0}`.")]
    NoMatches(String),
    #[error("Could not load that track: {0}")]
    LoadFailed(String),

    #[error("voice connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("playback backend error: {0}")]
    Backend(String),
    #[error("could not save guild settings: {0}")]
    Storage(String),
}

impl PlayerError {
    /// Errors caused by the user's request; shown verbatim and never logged as errors.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            PlayerError::Connection(_)
                | PlayerError::Relay(_)
                | PlayerError::Codec(_)
                | PlayerError::Backend(_)
                | PlayerError::Storage(_)
        )
    }

    /// Failures that may succeed when the caller tries again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlayerError::Connection(_) | PlayerError::PlayerLimitReached => true,
            PlayerError::Relay(e) => !matches!(e, RelayError::Payload(_) | RelayError::Address(_)),
            _ => false,
        }
    }

    /// Text safe to show in Discord.
    pub fn user_message(&self) -> String {
        if self.is_user_facing() {
            self.to_string()
        } else if self.is_retryable() {
            "Something went wrong while connecting, please try again in a moment.".to_string()
        } else {
            "Something went wrong!".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(PlayerError::ChannelFull.is_user_facing());
        assert!(!PlayerError::ChannelFull.is_retryable());

        let relay = PlayerError::Relay(RelayError::NotConnected);
        assert!(!relay.is_user_facing());
        assert!(relay.is_retryable());

        let backend = PlayerError::Backend("decoder exploded".into());
        assert_eq!(backend.user_message(), "Something went wrong!");

        let storage = PlayerError::Storage("disk full".into());
        assert!(!storage.is_user_facing());
        assert!(!storage.is_retryable());
    }
}
