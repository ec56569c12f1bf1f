//! notify: violation alerts
//!
//! [`SmtpNotifier`] emails the clip to the configured recipients;
//! [`LogNotifier`] only logs, for runs with email disabled. Neither retries:
//! a failed delivery is returned to the dispatcher as-is.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{info, warn};

use crate::config::{EmailSettings, EmailTlsMode};
use crate::detection::TrackId;

/// Delivers one alert per reported vehicle.
pub trait Notifier: Send + Sync {
    fn notify(&self, clip_path: &Path, speed_kmh: f64, track_id: TrackId) -> Result<()>;
}

/// Logs the alert instead of sending it.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, clip_path: &Path, speed_kmh: f64, track_id: TrackId) -> Result<()> {
        warn!(
            track_id = %track_id,
            speed_kmh,
            clip = %clip_path.display(),
            "speed violation"
        );
        Ok(())
    }
}

pub struct SmtpNotifier {
    transport: SmtpTransport,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject_prefix: String,
}

impl SmtpNotifier {
    pub fn from_settings(settings: &EmailSettings) -> Result<Self> {
        let host = settings.smtp_host.as_str();
        let mut builder = match settings.tls {
            EmailTlsMode::Tls => {
                SmtpTransport::relay(host).context("failed to configure SMTP TLS relay")?
            }
            EmailTlsMode::StartTls => SmtpTransport::starttls_relay(host)
                .context("failed to configure SMTP STARTTLS relay")?,
            EmailTlsMode::None => SmtpTransport::builder_dangerous(host),
        };
        builder = builder
            .port(settings.smtp_port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        let from: Mailbox = settings
            .from
            .parse()
            .with_context(|| format!("invalid sender address {:?}", settings.from))?;
        let to = settings
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid recipient address {addr:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            host,
            port = settings.smtp_port,
            recipients = to.len(),
            "SMTP notifier configured"
        );

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            subject_prefix: settings.subject_prefix.clone(),
        })
    }

    fn build_message(&self, clip_path: &Path, speed_kmh: f64, track_id: TrackId) -> Result<Message> {
        let clip = std::fs::read(clip_path)
            .with_context(|| format!("failed to read clip {}", clip_path.display()))?;
        let file_name = clip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("vehicle_{track_id}.mp4"));

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject(&self.subject_prefix, track_id));
        for to in &self.to {
            builder = builder.to(to.clone());
        }

        let attachment = Attachment::new(file_name).body(
            clip,
            ContentType::parse("video/mp4").context("invalid attachment content type")?,
        );
        builder
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::html(alert_body(speed_kmh, track_id)))
                    .singlepart(attachment),
            )
            .context("failed to build alert email")
    }
}

impl Notifier for SmtpNotifier {
    fn notify(&self, clip_path: &Path, speed_kmh: f64, track_id: TrackId) -> Result<()> {
        let message = self.build_message(clip_path, speed_kmh, track_id)?;
        self.transport
            .send(&message)
            .context("SMTP delivery failed")?;
        info!(track_id = %track_id, speed_kmh, "alert email sent");
        Ok(())
    }
}

fn subject(prefix: &str, track_id: TrackId) -> String {
    if prefix.is_empty() {
        format!("Speed violation alert - vehicle {track_id}")
    } else {
        format!("{prefix} Speed violation alert - vehicle {track_id}")
    }
}

fn alert_body(speed_kmh: f64, track_id: TrackId) -> String {
    let now = Local::now();
    format!(
        "<p>Hello,</p>\
         <p>Vehicle {track_id} exceeded the configured speed limit. \
         The recorded speed was {speed_kmh:.0} km/h on {} at {}. \
         The footage of the event is attached for review.</p>\
         <p>speedtrap</p>",
        now.format("%d/%m/%Y"),
        now.format("%H:%M:%S"),
    )
}
