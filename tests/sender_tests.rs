use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use delivery_service::{
    Error,
    clients::{
        sms::SmsSender,
        smtp::{EmailSender, SmtpConnector, SmtpSecurity},
        webhook::WebhookSender,
    },
    models::notification::{ChannelRequest, ChannelType},
    pool::ConnectionPool,
    senders::{ChannelSender, SendReceipt, SenderRegistry, classify_status},
    trace::TraceContext,
};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path},
};

use crate::common::{email_request, sms_request};

fn sms_sender(server: &MockServer) -> SmsSender {
    SmsSender::new(
        Client::new(),
        format!("{}/messages", server.uri()),
        "test-key".to_string(),
    )
}

/// Test: Provider statuses map onto transient and permanent failures
#[test]
fn test_status_classification() {
    assert!(classify_status(StatusCode::OK, "").is_ok());
    assert!(classify_status(StatusCode::ACCEPTED, "").is_ok());

    for transient in [
        StatusCode::REQUEST_TIMEOUT,
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::SERVICE_UNAVAILABLE,
    ] {
        assert!(matches!(
            classify_status(transient, "busy"),
            Err(Error::TransientDelivery(_))
        ));
    }

    for permanent in [
        StatusCode::BAD_REQUEST,
        StatusCode::UNAUTHORIZED,
        StatusCode::NOT_FOUND,
        StatusCode::UNPROCESSABLE_ENTITY,
    ] {
        assert!(matches!(
            classify_status(permanent, "nope"),
            Err(Error::PermanentDelivery(_))
        ));
    }
}

/// Test: SMS is posted with bearer auth and the provider id is kept
#[tokio::test]
async fn test_sms_success() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_json(json!({"to": "+15550100", "body": "Your code is 1234"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sid": "SM123"})))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = sms_sender(&server).send(&sms_request()).await?;

    assert_eq!(receipt.channel, ChannelType::Sms);
    assert_eq!(receipt.provider_message_id.as_deref(), Some("SM123"));

    Ok(())
}

/// Test: SMS provider errors are classified by status
#[tokio::test]
async fn test_sms_failure_classification() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid number"))
        .mount(&server)
        .await;

    let sender = sms_sender(&server);

    assert!(matches!(
        sender.send(&sms_request()).await,
        Err(Error::TransientDelivery(_))
    ));
    assert!(matches!(
        sender.send(&sms_request()).await,
        Err(Error::PermanentDelivery(_))
    ));

    Ok(())
}

/// Test: An unreachable provider is a transient failure
#[tokio::test]
async fn test_sms_unreachable_provider() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let sender = SmsSender::new(
        Client::new(),
        format!("http://{}/messages", addr),
        "k".to_string(),
    );

    assert!(matches!(
        sender.send(&sms_request()).await,
        Err(Error::TransientDelivery(_))
    ));

    Ok(())
}

/// Test: Webhooks carry custom headers and the current trace id
#[tokio::test]
async fn test_webhook_headers_and_trace() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hooks/order"))
        .and(header("x-signature", "abc123"))
        .and(header("x-trace-id", "trace-77"))
        .and(body_json(json!({"order": 42})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let request = ChannelRequest::Webhook {
        url: format!("{}/hooks/order", server.uri()),
        body: json!({"order": 42}),
        headers: HashMap::from([("x-signature".to_string(), "abc123".to_string())]),
    };

    let sender = WebhookSender::new(Client::new());
    let receipt = TraceContext::new("trace-77")
        .scope(sender.send(&request))
        .await?;
    assert_eq!(receipt.channel, ChannelType::Webhook);

    Ok(())
}

/// Test: A header that cannot be sent is a permanent failure
#[tokio::test]
async fn test_webhook_invalid_header_is_permanent() -> Result<()> {
    let request = ChannelRequest::Webhook {
        url: "http://127.0.0.1:9/hook".to_string(),
        body: json!({}),
        headers: HashMap::from([("bad header".to_string(), "v".to_string())]),
    };

    let result = WebhookSender::new(Client::new()).send(&request).await;
    assert!(matches!(result, Err(Error::PermanentDelivery(_))));

    Ok(())
}

struct SlowSender;

#[async_trait]
impl ChannelSender for SlowSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Sms
    }

    async fn send(&self, _request: &ChannelRequest) -> delivery_service::Result<SendReceipt> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(SendReceipt::new(ChannelType::Sms))
    }
}

/// Test: The registry enforces the per-send deadline and rejects unknown channels
#[tokio::test]
async fn test_registry_timeout_and_missing_sender() -> Result<()> {
    let registry = SenderRegistry::new(Duration::from_millis(50)).register(Arc::new(SlowSender));

    let timed_out = registry.send(&sms_request()).await;
    assert!(matches!(timed_out, Err(Error::Timeout(_))));
    assert!(timed_out.unwrap_err().is_retryable());

    assert!(matches!(
        registry.send(&email_request()).await,
        Err(Error::PermanentDelivery(_))
    ));

    Ok(())
}

/// Minimal SMTP relay that records the commands it receives. `rcpt_reply`
/// is sent in response to RCPT TO.
async fn spawn_smtp_server(rcpt_reply: &'static str) -> Result<(u16, Arc<Mutex<Vec<String>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let log = Arc::new(Mutex::new(Vec::new()));
    let server_log = Arc::clone(&log);

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let log = Arc::clone(&server_log);

            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                let _ = write.write_all(b"220 test.local ESMTP ready\r\n").await;

                let mut in_data = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    if in_data {
                        if line == "." {
                            in_data = false;
                            log.lock().push("<end of data>".to_string());
                            let _ = write.write_all(b"250 2.0.0 queued\r\n").await;
                        } else {
                            log.lock().push(format!("DATA:{}", line));
                        }
                        continue;
                    }

                    log.lock().push(line.clone());
                    let verb = line.split_whitespace().next().unwrap_or("").to_uppercase();
                    let reply: &[u8] = match verb.as_str() {
                        "EHLO" => b"250-test.local\r\n250 8BITMIME\r\n",
                        "RCPT" => rcpt_reply.as_bytes(),
                        "DATA" => {
                            in_data = true;
                            b"354 end with .\r\n"
                        }
                        "QUIT" => {
                            let _ = write.write_all(b"221 bye\r\n").await;
                            return;
                        }
                        _ => b"250 ok\r\n",
                    };
                    let _ = write.write_all(reply).await;
                }
            });
        }
    });

    Ok((port, log))
}

fn connector(port: u16) -> SmtpConnector {
    SmtpConnector {
        host: "127.0.0.1".to_string(),
        port,
        helo_name: "delivery.test".to_string(),
        connect_timeout: Duration::from_secs(2),
        security: SmtpSecurity::None,
        auth: None,
    }
}

/// Test: Email is submitted over SMTP and the session is pooled for reuse
#[tokio::test]
async fn test_email_over_smtp() -> Result<()> {
    let (port, log) = spawn_smtp_server("250 ok\r\n").await?;
    let pool = ConnectionPool::new(connector(port), 2);
    let sender = EmailSender::new(pool.clone(), "noreply@example.com")?;

    let request = ChannelRequest::Email {
        recipient: "user@example.com".to_string(),
        subject: "Welcome".to_string(),
        body: "Hello\n.hidden dot line".to_string(),
    };

    sender.send(&request).await?;
    sender.send(&request).await?;

    let log = log.lock().clone();
    assert_eq!(log.iter().filter(|l| l.starts_with("EHLO")).count(), 1);
    assert_eq!(log.iter().filter(|l| l.as_str() == "<end of data>").count(), 2);
    assert!(log.iter().any(|l| l.starts_with("MAIL FROM:<noreply@example.com>")));
    assert!(log.iter().any(|l| l.starts_with("RCPT TO:<user@example.com>")));
    assert!(log.contains(&"DATA:Subject: Welcome".to_string()));
    assert!(log.contains(&"DATA:..hidden dot line".to_string()));
    assert!(log.iter().any(|l| l == "NOOP"), "reused session should be checked");

    assert_eq!(pool.stats().idle, 1);
    pool.close().await;

    Ok(())
}

/// Test: A 5xx reply is permanent and the aborted session is not pooled
#[tokio::test]
async fn test_email_rejected_recipient() -> Result<()> {
    let (port, log) = spawn_smtp_server("550 5.1.1 no such user\r\n").await?;
    let pool = ConnectionPool::new(connector(port), 1);
    let sender = EmailSender::new(pool.clone(), "noreply@example.com")?;

    let result = sender.send(&email_request()).await;
    assert!(matches!(result, Err(Error::PermanentDelivery(_))));

    let log = log.lock().clone();
    assert!(log.iter().any(|l| l == "QUIT"));
    assert!(!log.iter().any(|l| l.starts_with("DATA")));
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(pool.stats().leased, 0);

    // The next send opens a fresh session.
    let result = sender.send(&email_request()).await;
    assert!(matches!(result, Err(Error::PermanentDelivery(_))));
    assert_eq!(pool.stats().leased, 0);

    Ok(())
}

/// Test: A transient 4xx reply is retryable
#[tokio::test]
async fn test_email_greylisted_recipient() -> Result<()> {
    let (port, _) = spawn_smtp_server("451 4.7.1 try again later\r\n").await?;
    let pool = ConnectionPool::new(connector(port), 1);
    let sender = EmailSender::new(pool, "noreply@example.com")?;

    let result = sender.send(&email_request()).await;
    assert!(matches!(result, Err(Error::TransientDelivery(_))));

    Ok(())
}

/// Test: Malformed addresses fail before any SMTP session is opened
#[tokio::test]
async fn test_email_address_validation() -> Result<()> {
    let pool = ConnectionPool::new(connector(1), 1);

    let invalid_sender = EmailSender::new(pool.clone(), "not an address");
    assert!(matches!(invalid_sender, Err(Error::Configuration(_))));

    let sender = EmailSender::new(pool.clone(), "noreply@example.com")?;
    let request = ChannelRequest::Email {
        recipient: "nobody".to_string(),
        subject: "Welcome".to_string(),
        body: "Hello".to_string(),
    };

    let result = sender.send(&request).await;
    assert!(matches!(result, Err(Error::PermanentDelivery(_))));
    assert_eq!(pool.stats().leased, 0);
    assert_eq!(pool.stats().idle, 0);

    Ok(())
}
