pub mod request;
pub mod response;

/// Protocol events the client sends or interprets itself.
///
/// Any other event name is application-defined and only ever routed to handlers.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::AsRefStr,
)]
pub enum ProtocolEvent {
    #[strum(serialize = "pusher:subscribe")]
    Subscribe,
    #[strum(serialize = "pusher:unsubscribe")]
    Unsubscribe,
    #[strum(serialize = "pusher:ping")]
    Ping,
    #[strum(serialize = "pusher:pong")]
    Pong,
    #[strum(serialize = "pusher:connection_established")]
    ConnectionEstablished,
    #[strum(serialize = "pusher:error")]
    Error,
    #[strum(serialize = "pusher_internal:subscription_succeeded")]
    SubscriptionSucceeded,
}

impl ProtocolEvent {
    const ALL: [Self; 7] = [
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Ping,
        Self::Pong,
        Self::ConnectionEstablished,
        Self::Error,
        Self::SubscriptionSucceeded,
    ];

    /// Look up the protocol event with the given wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_ref() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(ProtocolEvent::Subscribe.to_string(), "pusher:subscribe");
        assert_eq!(
            ProtocolEvent::SubscriptionSucceeded.as_ref(),
            "pusher_internal:subscription_succeeded"
        );
    }

    #[test]
    fn from_name_only_matches_protocol_events() {
        assert_eq!(
            ProtocolEvent::from_name("pusher:ping"),
            Some(ProtocolEvent::Ping)
        );
        assert_eq!(ProtocolEvent::from_name("new-message"), None);
        assert_eq!(ProtocolEvent::from_name("pusher:PING"), None);
    }
}
