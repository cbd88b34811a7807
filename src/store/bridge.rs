//! External database bridge: an optional HTTP mirror that pushes grant
//! status changes to the relational database owned by the web backend.
//! Never allowed to affect in-memory state.

use tracing::{error, trace};

use crate::domain_types::GrantId;
use crate::store::GrantStatus;

/// Configuration for the bridge, sourced from `python_services_url` /
/// `python_api_key` in the orchestrator's environment configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base URL of the external service, e.g. `https://api.example.org`.
    pub base_url: String,
    /// Optional bearer-style key sent as `X-API-Key`.
    pub api_key: Option<String>,
}

/// Fire-and-forget mirror of Data Store status changes to an external
/// relational database.
///
/// The external status label intentionally lags the in-memory one for
/// `approved` (mirrored as `under_review`, pending admin confirmation) —
/// see [`external_status_label`].
pub struct ExternalDbBridge {
    client: reqwest::Client,
    config: BridgeConfig,
}

impl ExternalDbBridge {
    /// Builds a bridge over the given configuration.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Mirrors a status change. Logs and swallows any failure: this bridge
    /// is an eventual-consistency write-through and must never revert or
    /// retry the in-memory mutation.
    pub async fn mirror_status(&self, grant_id: GrantId, status: GrantStatus) {
        let url = format!(
            "{}/api/v1/grants/{}?status_update={}",
            self.config.base_url.trim_end_matches('/'),
            grant_id,
            external_status_label(status)
        );
        let mut request = self.client.patch(&url);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("X-API-Key", api_key);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                trace!(%grant_id, ?status, "external grant status mirrored");
            }
            Ok(response) => {
                error!(%grant_id, status = %response.status(), "external grant status mirror rejected");
            }
            Err(err) => {
                error!(%grant_id, error = %err, "external grant status mirror failed");
            }
        }
    }
}

/// The status label sent to the external database for a given internal
/// status. `Approved` intentionally mirrors as `under_review` pending admin
/// confirmation — the in-memory record is always the authoritative
/// `approved`.
#[must_use]
pub fn external_status_label(status: GrantStatus) -> &'static str {
    match status {
        GrantStatus::Pending => "pending",
        GrantStatus::UnderReview | GrantStatus::Approved => "under_review",
        GrantStatus::Rejected => "rejected",
        GrantStatus::Completed => "completed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approved_mirrors_as_under_review() {
        assert_eq!(external_status_label(GrantStatus::Approved), "under_review");
        assert_eq!(external_status_label(GrantStatus::Rejected), "rejected");
    }
}
