use lettre::message::{header, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plaintext upgraded via STARTTLS (port 587).
    #[default]
    Starttls,
    /// Implicit TLS from the first byte (port 465).
    Tls,
    /// No encryption at all. Local relays only.
    None,
}

/// Sender section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum EmailSenderConfig {
    Smtp {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        tls: SmtpTls,
        from: String,
    },
    Sendmail {
        /// Path of the sendmail binary; the system default when absent.
        #[serde(default)]
        command: Option<String>,
        from: String,
    },
    Sendgrid {
        api_key: String,
        from: String,
    },
    /// Log instead of sending. Useful in development and tests.
    Noop,
}

/// One rendered login email ready for transport.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("invalid mail address: {0}")]
    Address(String),
    #[error("message assembly failed: {0}")]
    Assembly(String),
    #[error("transport failed: {0}")]
    Transport(String),
}

/// The closed set of mail transports.
pub enum EmailSender {
    Smtp {
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: Mailbox,
    },
    Sendmail {
        transport: AsyncSendmailTransport<Tokio1Executor>,
        from: Mailbox,
    },
    Sendgrid {
        http: reqwest::Client,
        api_key: String,
        from: String,
    },
    Noop,
    #[cfg(test)]
    Failing,
}

impl std::fmt::Debug for EmailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            EmailSender::Smtp { .. } => "Smtp",
            EmailSender::Sendmail { .. } => "Sendmail",
            EmailSender::Sendgrid { .. } => "Sendgrid",
            EmailSender::Noop => "Noop",
            #[cfg(test)]
            EmailSender::Failing => "Failing",
        };
        write!(f, "EmailSender::{kind}")
    }
}

fn parse_mailbox(from: &str) -> Result<Mailbox, String> {
    from.parse::<Mailbox>()
        .map_err(|e| format!("invalid from address {from:?}: {e}"))
}

impl EmailSender {
    pub fn from_config(config: &EmailSenderConfig) -> Result<Self, String> {
        match config {
            EmailSenderConfig::Smtp {
                host,
                port,
                username,
                password,
                tls,
                from,
            } => {
                let mut builder = match tls {
                    SmtpTls::Starttls => {
                        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                            .map_err(|e| format!("smtp relay {host:?}: {e}"))?
                    }
                    SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                        .map_err(|e| format!("smtp relay {host:?}: {e}"))?,
                    SmtpTls::None => {
                        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                    }
                };
                if let Some(port) = port {
                    builder = builder.port(*port);
                }
                if let (Some(username), Some(password)) = (username, password) {
                    builder =
                        builder.credentials(Credentials::new(username.clone(), password.clone()));
                }
                Ok(EmailSender::Smtp {
                    transport: builder.build(),
                    from: parse_mailbox(from)?,
                })
            }
            EmailSenderConfig::Sendmail { command, from } => {
                let transport = match command {
                    Some(command) => AsyncSendmailTransport::new_with_command(command),
                    None => AsyncSendmailTransport::new(),
                };
                Ok(EmailSender::Sendmail {
                    transport,
                    from: parse_mailbox(from)?,
                })
            }
            EmailSenderConfig::Sendgrid { api_key, from } => {
                // The from address is validated here, used as a string below.
                parse_mailbox(from)?;
                let http = reqwest::Client::builder()
                    .timeout(std::time::Duration::from_secs(15))
                    .build()
                    .map_err(|e| format!("sendgrid http client: {e}"))?;
                Ok(EmailSender::Sendgrid {
                    http,
                    api_key: api_key.clone(),
                    from: from.clone(),
                })
            }
            EmailSenderConfig::Noop => Ok(EmailSender::Noop),
        }
    }

    pub async fn send(&self, mail: OutgoingEmail) -> Result<(), SendError> {
        match self {
            EmailSender::Smtp { transport, from } => {
                let message = build_message(from, &mail)?;
                transport
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(|e| SendError::Transport(e.to_string()))
            }
            EmailSender::Sendmail { transport, from } => {
                let message = build_message(from, &mail)?;
                transport
                    .send(message)
                    .await
                    .map_err(|e| SendError::Transport(e.to_string()))
            }
            EmailSender::Sendgrid {
                http,
                api_key,
                from,
            } => {
                let payload = serde_json::json!({
                    "personalizations": [{"to": [{"email": mail.to}]}],
                    "from": {"email": from},
                    "subject": mail.subject,
                    "content": [
                        {"type": "text/plain", "value": mail.text},
                        {"type": "text/html", "value": mail.html},
                    ],
                });
                let response = http
                    .post(SENDGRID_ENDPOINT)
                    .bearer_auth(api_key)
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| SendError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(SendError::Transport(format!("sendgrid {status}: {body}")));
                }
                Ok(())
            }
            EmailSender::Noop => {
                tracing::info!(to = %mail.to, subject = %mail.subject, "noop mail sender, dropping message");
                Ok(())
            }
            #[cfg(test)]
            EmailSender::Failing => Err(SendError::Transport("test transport failure".to_string())),
        }
    }
}

/// Multipart alternative: plaintext first, HTML preferred.
fn build_message(from: &Mailbox, mail: &OutgoingEmail) -> Result<Message, SendError> {
    let to = mail
        .to
        .parse::<Mailbox>()
        .map_err(|e| SendError::Address(format!("{}: {e}", mail.to)))?;
    Message::builder()
        .from(from.clone())
        .to(to)
        .subject(mail.subject.clone())
        .multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(header::ContentType::TEXT_PLAIN)
                        .body(mail.text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(header::ContentType::TEXT_HTML)
                        .body(mail.html.clone()),
                ),
        )
        .map_err(|e| SendError::Assembly(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing() -> OutgoingEmail {
        OutgoingEmail {
            to: "bob@example.com".to_string(),
            subject: "Sign in".to_string(),
            html: "<p>hi</p>".to_string(),
            text: "hi".to_string(),
        }
    }

    #[test]
    fn test_build_message_is_multipart_alternative() {
        let from = parse_mailbox("ChatbotGate <gate@example.com>").unwrap();
        let message = build_message(&from, &outgoing()).unwrap();
        let rendered = String::from_utf8(message.formatted()).unwrap();
        assert!(rendered.contains("multipart/alternative"));
        assert!(rendered.contains("text/plain"));
        assert!(rendered.contains("text/html"));
    }

    #[test]
    fn test_bad_recipient_is_rejected() {
        let from = parse_mailbox("gate@example.com").unwrap();
        let mut mail = outgoing();
        mail.to = "not an address".to_string();
        assert!(matches!(
            build_message(&from, &mail),
            Err(SendError::Address(_))
        ));
    }

    #[test]
    fn test_sender_config_parsing() {
        let yaml = r#"
kind: smtp
host: smtp.example.com
port: 2525
username: gate
password: hunter2
tls: starttls
from: gate@example.com
"#;
        let config: EmailSenderConfig = serde_yml::from_str(yaml).unwrap();
        assert!(matches!(config, EmailSenderConfig::Smtp { port: Some(2525), .. }));
        assert!(EmailSender::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_noop_sender_succeeds() {
        let sender = EmailSender::from_config(&EmailSenderConfig::Noop).unwrap();
        sender.send(outgoing()).await.unwrap();
    }
}
