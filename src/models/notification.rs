use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    Error, Result,
    models::{status::NotificationStatus, validation},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    Sms,
    Webhook,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
            ChannelType::Webhook => "webhook",
        }
    }
}

impl Display for ChannelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(ChannelType::Email),
            "sms" => Ok(ChannelType::Sms),
            "webhook" => Ok(ChannelType::Webhook),
            other => Err(Error::validation(format!("Unknown channel type '{}'", other))),
        }
    }
}

/// Lower rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(Error::validation(format!("Unknown priority '{}'", other))),
        }
    }
}

/// Channel-specific content, decoded once when a record is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelRequest {
    Email {
        recipient: String,
        subject: String,
        body: String,
    },
    Sms {
        recipient: String,
        body: String,
    },
    Webhook {
        url: String,
        body: JsonValue,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Flattened persisted shape of a [`ChannelRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelColumns {
    pub channel: ChannelType,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub headers: JsonValue,
}

impl ChannelRequest {
    pub fn channel(&self) -> ChannelType {
        match self {
            ChannelRequest::Email { .. } => ChannelType::Email,
            ChannelRequest::Sms { .. } => ChannelType::Sms,
            ChannelRequest::Webhook { .. } => ChannelType::Webhook,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            ChannelRequest::Email { recipient, .. } | ChannelRequest::Sms { recipient, .. } => {
                recipient
            }
            ChannelRequest::Webhook { url, .. } => url,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ChannelRequest::Email {
                recipient,
                subject,
                body,
            } => {
                validation::validate_email_address(recipient)?;
                if subject.trim().is_empty() && body.trim().is_empty() {
                    return Err(Error::validation("Email requires a subject or a body"));
                }
            }
            ChannelRequest::Sms { recipient, body } => {
                validation::validate_phone_number(recipient)?;
                validation::validate_not_empty("body", body)?;
            }
            ChannelRequest::Webhook { url, body, .. } => {
                validation::validate_webhook_url(url)?;
                if body.is_null() {
                    return Err(Error::validation("Webhook body cannot be null"));
                }
            }
        }
        Ok(())
    }

    pub fn to_columns(&self) -> Result<ChannelColumns> {
        let columns = match self {
            ChannelRequest::Email {
                recipient,
                subject,
                body,
            } => ChannelColumns {
                channel: ChannelType::Email,
                recipient: recipient.clone(),
                subject: Some(subject.clone()),
                body: body.clone(),
                headers: JsonValue::Object(Default::default()),
            },
            ChannelRequest::Sms { recipient, body } => ChannelColumns {
                channel: ChannelType::Sms,
                recipient: recipient.clone(),
                subject: None,
                body: body.clone(),
                headers: JsonValue::Object(Default::default()),
            },
            ChannelRequest::Webhook { url, body, headers } => ChannelColumns {
                channel: ChannelType::Webhook,
                recipient: url.clone(),
                subject: None,
                body: serde_json::to_string(body)?,
                headers: serde_json::to_value(headers)?,
            },
        };
        Ok(columns)
    }

    pub fn from_columns(columns: ChannelColumns) -> Result<Self> {
        let request = match columns.channel {
            ChannelType::Email => ChannelRequest::Email {
                recipient: columns.recipient,
                subject: columns.subject.unwrap_or_default(),
                body: columns.body,
            },
            ChannelType::Sms => ChannelRequest::Sms {
                recipient: columns.recipient,
                body: columns.body,
            },
            ChannelType::Webhook => ChannelRequest::Webhook {
                url: columns.recipient,
                body: serde_json::from_str(&columns.body)?,
                headers: serde_json::from_value(columns.headers)?,
            },
        };
        Ok(request)
    }
}

/// Aggregate root of the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: NotificationStatus,
    pub priority: Priority,
    pub request: ChannelRequest,
    pub idempotency_key: Option<String>,
    pub retry_count: u32,
    pub version: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn from_new(new: NewNotification, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            status: NotificationStatus::Pending,
            priority: new.priority,
            request: new.request,
            idempotency_key: new.idempotency_key,
            retry_count: 0,
            version: 1,
            error: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            clicked_at: None,
            scheduled_for: new.scheduled_for,
            expires_at: new.expires_at,
        }
    }

    pub fn channel(&self) -> ChannelType {
        self.request.channel()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Applies a lifecycle transition and stamps the matching timestamp.
    pub fn transition(&mut self, next: NotificationStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            NotificationStatus::Sent => {
                self.sent_at = Some(now);
                self.error = None;
            }
            NotificationStatus::Delivered => self.delivered_at = Some(now),
            NotificationStatus::Read => self.read_at = Some(now),
            NotificationStatus::Clicked => self.clicked_at = Some(now),
            _ => {}
        }

        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    pub tenant_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub request: ChannelRequest,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewNotification {
    pub fn new(tenant_id: impl Into<String>, request: ChannelRequest) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            priority: Priority::default(),
            request,
            idempotency_key: None,
            scheduled_for: None,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_schedule(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_tenant_id(&self.tenant_id)?;
        self.request.validate()?;

        if let Some(key) = &self.idempotency_key {
            validation::validate_not_empty("idempotency_key", key)?;
        }

        if let (Some(scheduled_for), Some(expires_at)) = (self.scheduled_for, self.expires_at) {
            if expires_at <= scheduled_for {
                return Err(Error::validation(
                    "expires_at must be later than scheduled_for",
                ));
            }
        }

        Ok(())
    }
}

/// Content changes accepted while a record has not started sending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationUpdate {
    pub priority: Option<Priority>,
    pub request: Option<ChannelRequest>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub channel: Option<ChannelType>,
    pub recipient: Option<String>,
}

impl NotificationFilter {
    pub fn matches(&self, notification: &Notification) -> bool {
        self.status.is_none_or(|status| notification.status == status)
            && self
                .channel
                .is_none_or(|channel| notification.channel() == channel)
            && self
                .recipient
                .as_deref()
                .is_none_or(|recipient| notification.request.recipient() == recipient)
    }
}
