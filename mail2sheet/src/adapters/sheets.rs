//! Google Sheets adapter implementing `LogSink`
//!
//! Column E of every row holds the message id. `prepare` reads that column
//! once so `row_exists` can be answered locally for the rest of the run.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::http::{build_client, endpoint, send_json, sink_error};
use crate::config::SinkConfig;
use crate::credentials::CredentialProvider;
use crate::sync::retry::RetryPolicy;
use crate::sync::LogSink;
use crate::types::error::Result;
use crate::types::{CanonicalRecord, SHEET_HEADERS};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

const ROW_RANGE: &str = "A:E";
const HEADER_RANGE: &str = "A1:E1";
const ID_HEADER_CELL: &str = "E1";
const ID_COLUMN_RANGE: &str = "E2:E";

/// What row 1 of the sheet currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Empty,
    /// Written by an older version that had no id column
    MissingIdColumn,
    Present,
}

pub struct SheetsSink {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    base_url: String,
    spreadsheet_id: String,
    sheet_name: String,
    retry: RetryPolicy,
    /// Ids in column E; `None` until `prepare` ran
    known_ids: RwLock<Option<HashSet<String>>>,
    /// The last append failed in a way that may still have written the row
    uncertain: AtomicBool,
}

impl SheetsSink {
    pub fn new(
        config: &SinkConfig,
        credentials: Arc<dyn CredentialProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http: build_client(),
            credentials,
            base_url: SHEETS_API_BASE.to_string(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            sheet_name: config.sheet_name.clone(),
            retry,
            known_ids: RwLock::new(None),
            uncertain: AtomicBool::new(false),
        }
    }

    fn range(&self, cells: &str) -> String {
        a1_range(&self.sheet_name, cells)
    }

    async fn ensure_sheet(&self, token: &str) -> Result<()> {
        let url = endpoint(&self.base_url, &[self.spreadsheet_id.as_str()])?;
        let metadata = send_json(&self.retry, "read spreadsheet metadata", token, || {
            self.http
                .get(url.clone())
                .query(&[("fields", "sheets.properties.title")])
        })
        .await
        .map_err(sink_error)?;

        if parse_sheet_titles(&metadata).contains(&self.sheet_name) {
            return Ok(());
        }

        info!("Creating sheet {:?}", self.sheet_name);
        let url = endpoint(
            &self.base_url,
            &[format!("{}:batchUpdate", self.spreadsheet_id).as_str()],
        )?;
        let request = json!({
            "requests": [{ "addSheet": { "properties": { "title": self.sheet_name } } }]
        });
        send_json(&self.retry, "add sheet", token, || {
            self.http.post(url.clone()).json(&request)
        })
        .await
        .map_err(sink_error)?;
        Ok(())
    }

    async fn ensure_headers(&self, token: &str) -> Result<()> {
        let header_range = self.range(HEADER_RANGE);
        let current = self.read_values(token, &header_range).await?;

        let (range, row): (String, Vec<&str>) = match header_state(&current) {
            HeaderState::Present => return Ok(()),
            HeaderState::Empty => (header_range, SHEET_HEADERS.to_vec()),
            HeaderState::MissingIdColumn => {
                (self.range(ID_HEADER_CELL), vec![SHEET_HEADERS[4]])
            }
        };

        info!(range = %range, "Writing header row");
        let url = endpoint(
            &self.base_url,
            &[self.spreadsheet_id.as_str(), "values", range.as_str()],
        )?;
        let request = json!({ "range": range, "majorDimension": "ROWS", "values": [row] });
        send_json(&self.retry, "write headers", token, || {
            self.http
                .put(url.clone())
                .query(&[("valueInputOption", "RAW")])
                .json(&request)
        })
        .await
        .map_err(sink_error)?;
        Ok(())
    }

    async fn read_values(&self, token: &str, range: &str) -> Result<Value> {
        let url = endpoint(&self.base_url, &[self.spreadsheet_id.as_str(), "values", range])?;
        send_json(&self.retry, "read values", token, || self.http.get(url.clone()))
            .await
            .map_err(sink_error)
    }

    async fn fetch_known_ids(&self, token: &str) -> Result<HashSet<String>> {
        let values = self.read_values(token, &self.range(ID_COLUMN_RANGE)).await?;
        Ok(parse_column_ids(&values))
    }
}

#[async_trait]
impl LogSink for SheetsSink {
    async fn prepare(&self) -> Result<()> {
        let token = self.credentials.access_token().await?;
        self.ensure_sheet(&token).await?;
        self.ensure_headers(&token).await?;

        let ids = self.fetch_known_ids(&token).await?;
        info!(rows = ids.len(), "Loaded existing message ids from sheet");
        *self.known_ids.write().await = Some(ids);
        Ok(())
    }

    async fn append(&self, record: &CanonicalRecord) -> Result<()> {
        let token = self.credentials.access_token().await?;

        if self.uncertain.swap(false, Ordering::SeqCst) {
            let ids = self.fetch_known_ids(&token).await?;
            let landed = ids.contains(&record.event_id);
            *self.known_ids.write().await = Some(ids);
            if landed {
                warn!(
                    event_id = %record.event_id,
                    "Previous append attempt was written after all, not appending again"
                );
                return Ok(());
            }
        }

        let range = format!("{}:append", self.range(ROW_RANGE));
        let url = endpoint(
            &self.base_url,
            &[self.spreadsheet_id.as_str(), "values", range.as_str()],
        )?;
        let request = json!({ "majorDimension": "ROWS", "values": [record.to_row()] });

        // Retries of appends are driven by the engine
        let result = send_json(&RetryPolicy::none(), "append row", &token, || {
            self.http
                .post(url.clone())
                .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                .json(&request)
        })
        .await;

        match result {
            Ok(_) => {
                if let Some(ids) = self.known_ids.write().await.as_mut() {
                    ids.insert(record.event_id.clone());
                }
                debug!(event_id = %record.event_id, "Row appended");
                Ok(())
            }
            Err(failure) => {
                if failure.is_transient() {
                    self.uncertain.store(true, Ordering::SeqCst);
                }
                Err(sink_error(failure))
            }
        }
    }

    async fn row_exists(&self, event_id: &str) -> Result<Option<bool>> {
        Ok(self
            .known_ids
            .read()
            .await
            .as_ref()
            .map(|ids| ids.contains(event_id)))
    }
}

/// A1 notation for `cells` on `sheet`, quoted so any sheet name works
fn a1_range(sheet: &str, cells: &str) -> String {
    format!("'{}'!{}", sheet.replace('\'', "''"), cells)
}

fn parse_sheet_titles(metadata: &Value) -> Vec<String> {
    metadata["sheets"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|sheet| sheet["properties"]["title"].as_str())
        .map(str::to_string)
        .collect()
}

/// Rows of a `values.get` response; the key is absent for empty ranges
fn value_rows(values: &Value) -> impl Iterator<Item = &Vec<Value>> {
    values["values"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_array)
}

fn header_state(values: &Value) -> HeaderState {
    let first_row: Vec<&str> = value_rows(values)
        .next()
        .map(|row| row.iter().map(|cell| cell.as_str().unwrap_or("").trim()).collect())
        .unwrap_or_default();

    if first_row.iter().all(|cell| cell.is_empty()) {
        HeaderState::Empty
    } else if first_row.get(4).map_or(true, |cell| cell.is_empty()) {
        HeaderState::MissingIdColumn
    } else {
        HeaderState::Present
    }
}

fn parse_column_ids(values: &Value) -> HashSet<String> {
    value_rows(values)
        .filter_map(|row| row.first())
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::error::SyncError;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct StaticToken;

    #[async_trait]
    impl CredentialProvider for StaticToken {
        async fn access_token(&self) -> Result<String> {
            Ok("token".into())
        }
    }

    fn sink() -> SheetsSink {
        let config = SinkConfig {
            spreadsheet_id: "sheet-id".into(),
            sheet_name: "Inbox Log".into(),
        };
        SheetsSink::new(&config, Arc::new(StaticToken), RetryPolicy::none())
    }

    #[test]
    fn test_a1_range_quotes_sheet_names() {
        assert_eq!(a1_range("Sheet1", "A:E"), "'Sheet1'!A:E");
        assert_eq!(a1_range("Bob's mail", "E2:E"), "'Bob''s mail'!E2:E");
    }

    #[test]
    fn test_parse_sheet_titles() {
        let metadata = json!({
            "sheets": [
                { "properties": { "title": "Sheet1" } },
                { "properties": { "title": "Inbox Log" } }
            ]
        });
        assert_eq!(parse_sheet_titles(&metadata), vec!["Sheet1", "Inbox Log"]);
        assert!(parse_sheet_titles(&json!({})).is_empty());
    }

    #[test]
    fn test_header_state() {
        assert_eq!(header_state(&json!({ "range": "'S'!A1:E1" })), HeaderState::Empty);
        assert_eq!(header_state(&json!({ "values": [[""]] })), HeaderState::Empty);
        assert_eq!(
            header_state(&json!({ "values": [["From", "Subject", "Date", "Content"]] })),
            HeaderState::MissingIdColumn
        );
        assert_eq!(
            header_state(&json!({ "values": [SHEET_HEADERS] })),
            HeaderState::Present
        );
    }

    #[test]
    fn test_parse_column_ids_skips_blank_cells() {
        let values = json!({
            "range": "'S'!E2:E9",
            "values": [["18c1"], [], [" 18c2 "], [""], ["18c1"]]
        });
        let ids = parse_column_ids(&values);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("18c1"));
        assert!(ids.contains("18c2"));
        assert!(parse_column_ids(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_row_exists_unknown_before_prepare() {
        let sink = sink();
        assert_eq!(sink.row_exists("18c1").await.unwrap(), None);

        *sink.known_ids.write().await = Some(["18c1".to_string()].into_iter().collect());
        assert_eq!(sink.row_exists("18c1").await.unwrap(), Some(true));
        assert_eq!(sink.row_exists("18c2").await.unwrap(), Some(false));
    }

    /// Loopback stand-in for the Sheets API. Every append is answered with
    /// 503 and column E reads return `column_e`. Request lines are recorded.
    async fn fake_sheets(column_e: Value) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let request_line = read_request(&mut stream).await;
                log.lock().unwrap().push(request_line.clone());

                let (status, body) = if request_line.starts_with("POST") {
                    ("503 Service Unavailable", json!({ "error": { "message": "backend error" } }))
                } else {
                    ("200 OK", column_e.clone())
                };
                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (base, seen)
    }

    /// Read one request with its body and return the request line
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn record(id: &str) -> CanonicalRecord {
        CanonicalRecord {
            event_id: id.into(),
            sender: "a@example.com".into(),
            subject: "hello".into(),
            date: "2024-01-01 10:00:00".into(),
            content: "body".into(),
        }
    }

    #[tokio::test]
    async fn test_append_after_ambiguous_failure_rechecks_column() {
        // The 503 append was in fact written, so the id shows up in column E
        let (base, seen) = fake_sheets(json!({ "values": [["18c1"]] })).await;
        let mut sink = sink();
        sink.base_url = base;
        *sink.known_ids.write().await = Some(HashSet::new());

        let err = sink.append(&record("18c1")).await.unwrap_err();
        assert!(matches!(err, SyncError::SinkUnavailable(_)));

        sink.append(&record("18c1")).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2, "{:?}", seen);
        assert!(seen[0].starts_with("POST") && seen[0].contains("append"));
        assert!(seen[1].starts_with("GET") && seen[1].contains("E2"));
        assert_eq!(sink.row_exists("18c1").await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_append_after_ambiguous_failure_retries_when_row_absent() {
        let (base, seen) = fake_sheets(json!({ "values": [["other"]] })).await;
        let mut sink = sink();
        sink.base_url = base;

        assert!(sink.append(&record("18c1")).await.is_err());
        assert!(sink.append(&record("18c1")).await.is_err());

        let methods: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|line| line.split(' ').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(methods, vec!["POST", "GET", "POST"]);
    }

    #[test]
    fn test_sink_range_uses_configured_sheet() {
        let sink = sink();
        assert_eq!(sink.range(ROW_RANGE), "'Inbox Log'!A:E");
        assert_eq!(sink.range(ID_COLUMN_RANGE), "'Inbox Log'!E2:E");
    }
}
