//! SMTP submission over pooled lettre sessions.
//!
//! Each pooled connection is an authenticated, EHLO'd session; messages are
//! built with lettre's builder so headers, encoding and dot-stuffing follow
//! its rules.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use lettre::{
    Message,
    message::{Mailbox, header::ContentType},
    transport::smtp::{
        Error as SmtpError,
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
    },
};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    models::notification::{ChannelRequest, ChannelType},
    pool::{ConnectionManager, ConnectionPool},
    senders::{ChannelSender, SendReceipt},
};

impl From<SmtpError> for Error {
    fn from(err: SmtpError) -> Self {
        if err.is_permanent() {
            Error::permanent(format!("SMTP server rejected message: {}", err))
        } else {
            Error::transient(format!("SMTP error: {}", err))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain session, for a local relay.
    #[default]
    None,
    /// Upgrade with STARTTLS; the server must offer it.
    StartTls,
    /// TLS from the first byte (SMTPS).
    Tls,
}

#[derive(Clone)]
pub struct SmtpAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SmtpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConnector {
    pub host: String,
    pub port: u16,
    pub helo_name: String,
    pub connect_timeout: Duration,
    pub security: SmtpSecurity,
    pub auth: Option<SmtpAuth>,
}

impl SmtpConnector {
    fn tls_parameters(&self) -> Result<TlsParameters> {
        TlsParameters::new(self.host.clone())
            .map_err(|e| Error::Configuration(format!("invalid SMTP TLS settings: {}", e)))
    }

    async fn open(&self) -> Result<AsyncSmtpConnection> {
        let hello = ClientId::Domain(self.helo_name.clone());
        let wrapper = match self.security {
            SmtpSecurity::Tls => Some(self.tls_parameters()?),
            _ => None,
        };

        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.host.as_str(), self.port),
            Some(self.connect_timeout),
            &hello,
            wrapper,
            None,
        )
        .await?;

        if self.security == SmtpSecurity::StartTls {
            if !connection.can_starttls() {
                let _ = connection.quit().await;
                return Err(Error::transient(format!(
                    "SMTP server {} does not offer STARTTLS",
                    self.host
                )));
            }
            connection.starttls(self.tls_parameters()?, &hello).await?;
        }

        if let Some(auth) = &self.auth {
            let credentials = Credentials::new(auth.username.clone(), auth.password.clone());
            connection
                .auth(&[Mechanism::Plain, Mechanism::Login], &credentials)
                .await?;
        }

        Ok(connection)
    }
}

#[async_trait]
impl ConnectionManager for SmtpConnector {
    type Connection = AsyncSmtpConnection;

    async fn connect(&self) -> Result<AsyncSmtpConnection> {
        let connection = timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| Error::Timeout(self.connect_timeout))??;

        debug!(host = %self.host, port = self.port, security = ?self.security, "SMTP session opened");
        Ok(connection)
    }

    async fn is_alive(&self, connection: &mut AsyncSmtpConnection) -> bool {
        !connection.has_broken()
            && timeout(self.connect_timeout, connection.test_connected())
                .await
                .unwrap_or(false)
    }

    async fn disconnect(&self, mut connection: AsyncSmtpConnection) {
        // A broken session has already sent QUIT.
        if connection.has_broken() {
            return;
        }
        if let Ok(Err(e)) = timeout(self.connect_timeout, connection.quit()).await {
            debug!(error = %e, "SMTP QUIT failed");
        }
    }
}

pub struct EmailSender {
    pool: ConnectionPool<SmtpConnector>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(pool: ConnectionPool<SmtpConnector>, from_address: &str) -> Result<Self> {
        let from: Mailbox = from_address
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid sender address '{}': {}", from_address, e)))?;

        info!(from = %from, "Email sender initialized");
        Ok(Self { pool, from })
    }

    pub fn pool(&self) -> &ConnectionPool<SmtpConnector> {
        &self.pool
    }

    fn build_message(&self, recipient: &str, subject: &str, body: &str) -> Result<Message> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| Error::permanent(format!("invalid recipient '{}': {}", recipient, e)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| Error::permanent(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(&self, request: &ChannelRequest) -> Result<SendReceipt> {
        let ChannelRequest::Email {
            recipient,
            subject,
            body,
        } = request
        else {
            return Err(Error::permanent(format!(
                "email sender cannot deliver {} requests",
                request.channel()
            )));
        };

        let message = self.build_message(recipient, subject, body)?;

        let mut connection = self.pool.get().await.map_err(|e| match e {
            Error::PoolClosed => Error::transient("SMTP pool is closed"),
            other => other,
        })?;

        match connection
            .send(message.envelope(), &message.formatted())
            .await
        {
            Ok(_) => {
                if let Err(e) = connection.release().await {
                    debug!(error = %e, "SMTP connection not returned to pool");
                }
                info!(recipient = %recipient, "Email sent successfully");
                Ok(SendReceipt::new(ChannelType::Email))
            }
            Err(e) => {
                // lettre aborts the session on any failed command.
                warn!(recipient = %recipient, error = %e, "SMTP send failed");
                connection.discard().await;
                Err(e.into())
            }
        }
    }
}
