use std::any::Any;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument};

use super::{InitContext, Resource, ResourceError};
use crate::config::EmailConfig;

/// SMTP session held open for outbound mail. Disabled mail is ready without
/// connecting.
pub struct MailerResource {
    config: EmailConfig,
    session: Option<BufReader<TcpStream>>,
}

impl MailerResource {
    pub fn new(config: EmailConfig) -> Self {
        Self { config, session: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn from_address(&self) -> &str {
        &self.config.from_address
    }
}

#[async_trait]
impl Resource for MailerResource {
    fn name(&self) -> &'static str {
        "email"
    }

    #[instrument(name = "mailer.initialize", skip_all)]
    async fn initialize(&mut self, _ctx: &InitContext<'_>) -> Result<(), ResourceError> {
        if !self.config.enabled {
            info!("mail disabled; skipping SMTP connection");
            return Ok(());
        }

        let stream = TcpStream::connect((self.config.smtp_host.as_str(), self.config.smtp_port))
            .await
            .map_err(|e| ResourceError::Connect(e.to_string()))?;
        let mut session = BufReader::new(stream);

        let mut greeting = String::new();
        session.read_line(&mut greeting).await?;
        if !greeting.starts_with("220") {
            return Err(ResourceError::Handshake(format!(
                "unexpected SMTP greeting `{}`",
                greeting.trim_end()
            )));
        }

        debug!(greeting = greeting.trim_end(), "SMTP server ready");
        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let stream = session.get_mut();
        stream.write_all(b"QUIT\r\n").await?;
        stream.shutdown().await?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
