//! Gmail REST adapter implementing `EventSource`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::adapters::http::{build_client, endpoint, send_json, source_error};
use crate::config::SourceConfig;
use crate::credentials::CredentialProvider;
use crate::sync::retry::RetryPolicy;
use crate::sync::EventSource;
use crate::types::error::{Result, SyncError};
use crate::types::{Event, RawPayload};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const UNREAD_LABEL: &str = "UNREAD";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

pub struct GmailSource {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    base_url: String,
    query: String,
    max_results: u32,
    retry: RetryPolicy,
}

impl GmailSource {
    pub fn new(
        config: &SourceConfig,
        credentials: Arc<dyn CredentialProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http: build_client(),
            credentials,
            base_url: GMAIL_API_BASE.to_string(),
            query: config.effective_query(),
            max_results: config.max_results,
            retry,
        }
    }
}

#[async_trait]
impl EventSource for GmailSource {
    async fn list_candidates(&self) -> Result<Vec<Event>> {
        let url = endpoint(&self.base_url, &["messages"])?;
        let token = self.credentials.access_token().await?;
        let max_results = self.max_results.to_string();

        debug!(query = %self.query, "Listing unread messages");
        let body = send_json(&self.retry, "list messages", &token, || {
            self.http
                .get(url.clone())
                .query(&[("q", self.query.as_str()), ("maxResults", max_results.as_str())])
        })
        .await
        .map_err(|e| source_error(e, None))?;

        let (events, more) = parse_message_list(body)?;
        if more {
            info!(
                "More than {} matching messages; the rest will be picked up by the next run",
                self.max_results
            );
        }
        Ok(events)
    }

    async fn fetch_body(&self, event: &Event) -> Result<RawPayload> {
        let url = endpoint(&self.base_url, &["messages", event.id.as_str()])?;
        let token = self.credentials.access_token().await?;

        let body = send_json(&self.retry, "get message", &token, || {
            self.http.get(url.clone()).query(&[("format", "full")])
        })
        .await
        .map_err(|e| source_error(e, Some(event.id.as_str())))?;

        Ok(RawPayload(body))
    }

    async fn mark_consumed(&self, event_id: &str) -> Result<()> {
        let url = endpoint(&self.base_url, &["messages", event_id, "modify"])?;
        let token = self.credentials.access_token().await?;
        let request = json!({ "removeLabelIds": [UNREAD_LABEL] });

        send_json(&self.retry, "mark message read", &token, || {
            self.http.post(url.clone()).json(&request)
        })
        .await
        .map_err(|e| source_error(e, Some(event_id)))?;

        debug!(event_id, "Marked message as read");
        Ok(())
    }
}

/// Events from a `messages.list` response and whether more pages exist
fn parse_message_list(body: Value) -> Result<(Vec<Event>, bool)> {
    if body.is_null() {
        return Ok((Vec::new(), false));
    }
    let list: MessageList = serde_json::from_value(body)
        .map_err(|e| SyncError::SourceUnavailable(format!("unexpected list response: {}", e)))?;

    let events = list
        .messages
        .into_iter()
        .filter(|m| !m.id.is_empty())
        .map(|m| Event::new(m.id))
        .collect();
    Ok((events, list.next_page_token.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_list() {
        let body = json!({
            "messages": [
                { "id": "18c1", "threadId": "18c1" },
                { "id": "18c2", "threadId": "18c0" }
            ],
            "resultSizeEstimate": 2
        });
        let (events, more) = parse_message_list(body).unwrap();
        assert_eq!(events, vec![Event::new("18c1"), Event::new("18c2")]);
        assert!(!more);
    }

    #[test]
    fn test_empty_mailbox_has_no_messages_key() {
        let (events, more) = parse_message_list(json!({ "resultSizeEstimate": 0 })).unwrap();
        assert!(events.is_empty());
        assert!(!more);
        assert!(parse_message_list(Value::Null).unwrap().0.is_empty());
    }

    #[test]
    fn test_next_page_reported() {
        let body = json!({ "messages": [{ "id": "a" }], "nextPageToken": "tok" });
        let (_, more) = parse_message_list(body).unwrap();
        assert!(more);
    }

    #[test]
    fn test_malformed_list_is_source_error() {
        let err = parse_message_list(json!({ "messages": "nope" })).unwrap_err();
        assert_eq!(err.exit_code(), 11);
    }

    #[test]
    fn test_query_includes_subject_filter() {
        struct NoCredentials;
        #[async_trait]
        impl CredentialProvider for NoCredentials {
            async fn access_token(&self) -> Result<String> {
                Err(SyncError::AuthExpired("none".into()))
            }
        }

        let config = SourceConfig {
            subject_filter: Some("Invoice".into()),
            ..SourceConfig::default()
        };
        let source = GmailSource::new(&config, Arc::new(NoCredentials), RetryPolicy::none());
        assert_eq!(source.query, "is:unread in:inbox subject:\"Invoice\"");
        assert_eq!(source.max_results, 50);
    }
}
