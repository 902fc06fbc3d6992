use reqwest::Client;
use serde_json::json;

use crate::models::schedule::{Schedule, ScheduleRun};

/// Delivers run reports to the channels a schedule configures. Channels are
/// independent: one failing delivery never blocks the others, and delivery
/// failures are logged rather than surfaced as run failures.
pub struct Notifier {
    http: Client,
    email_api_url: Option<String>,
    email_api_token: Option<String>,
}

impl Notifier {
    pub fn new(email_api_url: Option<String>, email_api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            email_api_url,
            email_api_token,
        }
    }

    /// Announce a finalized run if its status matches an enabled flag.
    pub async fn dispatch(&self, schedule: &Schedule, run: &ScheduleRun) {
        let config = &schedule.notification_config;
        if !config.wants(run.status) {
            return;
        }

        let report = json!({
            "schedule_id": schedule.id,
            "schedule_name": schedule.name,
            "run_id": run.id,
            "status": run.status,
            "batch_id": run.batch_id,
            "executed_at": run.executed_at,
            "duration_ms": run.duration_ms,
            "files_found": run.files_found,
            "files_processed": run.files_processed,
            "error": run.error,
        });

        if let Some(url) = &config.webhook_url {
            if let Err(e) = self.post_json(url, &report).await {
                tracing::warn!(schedule_id = %schedule.id, url = %url, error = %e, "webhook delivery failed");
            }
        }

        if let Some(url) = &config.chat_webhook_url {
            let text = summary_line(schedule, run);
            if let Err(e) = self.post_json(url, &json!({ "text": text })).await {
                tracing::warn!(schedule_id = %schedule.id, url = %url, error = %e, "chat delivery failed");
            }
        }

        if !config.emails.is_empty() {
            match &self.email_api_url {
                Some(base) => {
                    for recipient in &config.emails {
                        let message = json!({
                            "to": recipient,
                            "subject": format!(
                                "[docbatch] {} run {}",
                                schedule.name, run.status
                            ),
                            "body": summary_line(schedule, run),
                        });
                        if let Err(e) = self.post_email(base, &message).await {
                            tracing::warn!(
                                schedule_id = %schedule.id,
                                recipient = %recipient,
                                error = %e,
                                "email delivery failed"
                            );
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        "email recipients configured but no email gateway set"
                    );
                }
            }
        }
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<(), reqwest::Error> {
        self.http
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_email(&self, base: &str, body: &serde_json::Value) -> Result<(), reqwest::Error> {
        let url = format!("{}/v1/send", base.trim_end_matches('/'));
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.email_api_token {
            request = request.bearer_auth(token);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

fn summary_line(schedule: &Schedule, run: &ScheduleRun) -> String {
    match &run.error {
        Some(error) => format!(
            "Schedule `{}` finished {}: {} of {} files processed ({})",
            schedule.name, run.status, run.files_processed, run.files_found, error
        ),
        None => format!(
            "Schedule `{}` finished {}: {} of {} files processed",
            schedule.name, run.status, run.files_processed, run.files_found
        ),
    }
}
