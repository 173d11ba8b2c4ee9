use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::{AdapterError, Notifier};

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub timeout: Duration,
}

/// Where mail is handed off, derived from [`SmtpConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Relay<'a> {
    Tls {
        host: &'a str,
        port: u16,
        username: &'a str,
        password: &'a str,
    },
    Plain {
        host: &'a str,
        port: u16,
    },
    Local,
}

impl SmtpConfig {
    /// Host and port must both be set to leave `localhost:25`.
    fn relay(&self) -> Relay<'_> {
        match (
            self.host.as_deref(),
            self.port,
            self.username.as_deref(),
            self.password.as_deref(),
        ) {
            (Some(host), Some(port), Some(username), Some(password)) => Relay::Tls {
                host,
                port,
                username,
                password,
            },
            (Some(host), Some(port), _, _) => Relay::Plain { host, port },
            _ => Relay::Local,
        }
    }
}

/// Plain-text mail delivery over SMTP.
///
/// With host, port and credentials set the relay is reached over implicit TLS.
/// A host and port without credentials is used unauthenticated. Otherwise mail
/// goes to an unauthenticated relay on `localhost:25`.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, AdapterError> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            AdapterError::DeliveryFailed(format!("invalid sender {:?}: {e}", config.from))
        })?;

        let transport = match config.relay() {
            Relay::Tls {
                host,
                port,
                username,
                password,
            } => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| AdapterError::DeliveryFailed(e.to_string()))?
                .port(port)
                .credentials(Credentials::new(username.to_string(), password.to_string()))
                .timeout(Some(config.timeout))
                .build(),
            Relay::Plain { host, port } => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                    .port(port)
                    .timeout(Some(config.timeout))
                    .build()
            }
            Relay::Local => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("localhost")
                .port(25)
                .timeout(Some(config.timeout))
                .build(),
        };

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, to: &str, subject: &str, body: &str) -> Result<(), AdapterError> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| AdapterError::DeliveryFailed(format!("invalid recipient {to:?}: {e}")))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| AdapterError::DeliveryFailed(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| AdapterError::DeliveryFailed(e.to_string()))?;
        info!(to = %to.email, "email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(from: &str) -> SmtpConfig {
        SmtpConfig {
            host: None,
            port: None,
            username: None,
            password: None,
            from: from.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn relay_needs_both_host_and_port() {
        let mut cfg = config("no-reply@localhost");
        assert_eq!(cfg.relay(), Relay::Local);

        cfg.host = Some("smtp.example.com".into());
        assert_eq!(cfg.relay(), Relay::Local);

        cfg.port = Some(2525);
        assert_eq!(
            cfg.relay(),
            Relay::Plain {
                host: "smtp.example.com",
                port: 2525
            }
        );

        cfg.username = Some("alerts@example.com".into());
        cfg.password = Some("secret".into());
        assert_eq!(
            cfg.relay(),
            Relay::Tls {
                host: "smtp.example.com",
                port: 2525,
                username: "alerts@example.com",
                password: "secret",
            }
        );
    }

    #[tokio::test]
    async fn rejects_malformed_sender() {
        let err = SmtpNotifier::new(&config("not an address")).err().unwrap();
        assert!(matches!(err, AdapterError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn rejects_malformed_recipient_before_connecting() {
        let notifier = SmtpNotifier::new(&config("no-reply@localhost")).unwrap();
        let err = notifier
            .notify("nobody", "subject", "body")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid recipient"));
    }
}
