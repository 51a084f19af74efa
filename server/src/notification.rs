//! Push approval over HTTP
//!
//! `POST <NOTIFICATION_URL>` with the request description; the push service
//! holds the request open until the user answers on their device.

use async_trait::async_trait;
use ldap_gateway_core::{ApprovalDecision, ApprovalTransport, StepUpError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const TITLE: &str = "SSH Authentication Request";
const BODY: &str = "Please review and respond to your pending authentication request.";

#[derive(Debug, Serialize)]
struct NotificationAction {
    icon: &'static str,
    title: &'static str,
    callback: &'static str,
}

#[derive(Debug, Serialize)]
struct NotificationRequest<'a> {
    username: &'a str,
    title: &'static str,
    body: &'static str,
    actions: [NotificationAction; 2],
}

impl<'a> NotificationRequest<'a> {
    fn new(username: &'a str) -> Self {
        Self {
            username,
            title: TITLE,
            body: BODY,
            actions: [
                NotificationAction {
                    icon: "approve",
                    title: "Approve",
                    callback: "approve",
                },
                NotificationAction {
                    icon: "reject",
                    title: "Reject",
                    callback: "reject",
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationResponse {
    #[serde(default)]
    action: Option<String>,
    /// Older push services answer `{"success": bool}`
    #[serde(default)]
    success: Option<bool>,
}

impl NotificationResponse {
    fn decision(&self) -> Result<ApprovalDecision, StepUpError> {
        match (self.action.as_deref(), self.success) {
            (Some(a), _) if a.eq_ignore_ascii_case("approve") => Ok(ApprovalDecision::Approve),
            (Some(a), _) if a.eq_ignore_ascii_case("reject") => Ok(ApprovalDecision::Reject),
            (Some(other), _) => Err(StepUpError::InvalidResponse(format!(
                "unknown action '{}'",
                other
            ))),
            (None, Some(true)) => Ok(ApprovalDecision::Approve),
            (None, Some(false)) => Ok(ApprovalDecision::Reject),
            (None, None) => Err(StepUpError::InvalidResponse(
                "neither action nor success present".to_string(),
            )),
        }
    }
}

pub struct HttpNotifier {
    client: Client,
    url: String,
}

impl HttpNotifier {
    /// `timeout` bounds the HTTP exchange; the step-up deadline is applied separately.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, StepUpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StepUpError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ApprovalTransport for HttpNotifier {
    async fn request_approval(&self, username: &str) -> Result<ApprovalDecision, StepUpError> {
        debug!("Sending approval request for {}", username);
        let response = self
            .client
            .post(&self.url)
            .json(&NotificationRequest::new(username))
            .send()
            .await
            .map_err(|e| StepUpError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StepUpError::Transport(format!(
                "push service answered {}",
                status
            )));
        }

        let body: NotificationResponse = response
            .json()
            .await
            .map_err(|e| StepUpError::InvalidResponse(e.to_string()))?;
        body.decision()
    }
}
