use super::machine::ConnectionState;
use crate::device::Side;
use chrono::{DateTime, Local};
use serde::Serialize;

/// Visual class of a status line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    Disconnected,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub text: String,
    pub class: StatusClass,
}

impl Status {
    fn new(text: &str, class: StatusClass) -> Self {
        Self {
            text: text.to_string(),
            class,
        }
    }
}

/// The one place status text is derived from
///
/// A present error message always wins over the connection state.
pub fn status_for(state: ConnectionState, error_message: Option<&str>) -> Status {
    if let Some(message) = error_message.filter(|m| !m.is_empty()) {
        return Status::new(message, StatusClass::Error);
    }

    match state {
        ConnectionState::Disconnected => {
            Status::new("no joy-con connected", StatusClass::Disconnected)
        }
        ConnectionState::LeftConnected => {
            Status::new("right joy-con not connected", StatusClass::Disconnected)
        }
        ConnectionState::RightConnected => {
            Status::new("left joy-con not connected", StatusClass::Disconnected)
        }
        ConnectionState::Connected => Status::new("Connected", StatusClass::Connected),
        ConnectionState::Error => Status::new("Error", StatusClass::Error),
    }
}

/// Everything a front end needs to render the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub connection_state: ConnectionState,
    pub status: Status,
    pub left_present: bool,
    pub right_present: bool,
    pub vibrating: bool,
    pub vibrating_side: Option<Side>,
    pub remaining_count: Option<u32>,
    pub updated_at: DateTime<Local>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            status: status_for(ConnectionState::Disconnected, None),
            left_present: false,
            right_present: false,
            vibrating: false,
            vibrating_side: None,
            remaining_count: None,
            updated_at: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_covers_every_state() {
        assert_eq!(
            status_for(ConnectionState::Disconnected, None),
            Status::new("no joy-con connected", StatusClass::Disconnected)
        );
        assert_eq!(
            status_for(ConnectionState::LeftConnected, None).text,
            "right joy-con not connected"
        );
        assert_eq!(
            status_for(ConnectionState::RightConnected, None).text,
            "left joy-con not connected"
        );
        assert_eq!(
            status_for(ConnectionState::Connected, None).class,
            StatusClass::Connected
        );
        assert_eq!(
            status_for(ConnectionState::Error, None),
            Status::new("Error", StatusClass::Error)
        );
    }

    #[test]
    fn error_message_overrides_state() {
        let status = status_for(ConnectionState::Connected, Some("Failed to open device"));
        assert_eq!(status.text, "Failed to open device");
        assert_eq!(status.class, StatusClass::Error);

        let empty = status_for(ConnectionState::Connected, Some(""));
        assert_eq!(empty.class, StatusClass::Connected);
    }
}
