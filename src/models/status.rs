use std::{
    fmt::{Display, Formatter, Result},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Failed,
    Delivered,
    Bounced,
    Read,
    Clicked,
}

impl NotificationStatus {
    /// Forward transitions of the delivery lifecycle.
    ///
    /// `failed -> pending` is only reachable through
    /// a dead letter replay, see `NotificationRepository::reopen_for_replay`.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;

        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Sending)
                | (Queued, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Bounced)
                | (Delivered, Read)
                | (Read, Clicked)
        )
    }

    /// No further dispatch is required for the record.
    pub fn is_settled(self) -> bool {
        !matches!(
            self,
            NotificationStatus::Pending | NotificationStatus::Queued | NotificationStatus::Sending
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Queued => "queued",
            NotificationStatus::Sending => "sending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Bounced => "bounced",
            NotificationStatus::Read => "read",
            NotificationStatus::Clicked => "clicked",
        }
    }
}

impl Display for NotificationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "queued" => Ok(NotificationStatus::Queued),
            "sending" => Ok(NotificationStatus::Sending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            "delivered" => Ok(NotificationStatus::Delivered),
            "bounced" => Ok(NotificationStatus::Bounced),
            "read" => Ok(NotificationStatus::Read),
            "clicked" => Ok(NotificationStatus::Clicked),
            other => Err(crate::Error::validation(format!(
                "Unknown notification status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl Display for OutboxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(crate::Error::validation(format!(
                "Unknown outbox status '{}'",
                other
            ))),
        }
    }
}
