use crate::{
    cache::CacheEntry,
    error::ForwardError,
};
use reqwest::{
    header::CONTENT_TYPE,
    StatusCode,
};
use std::{
    future::Future,
    pin::Pin,
    time::Duration,
};
use url::Url;

/// Delivers one batch to the central endpoint.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, entry: &'a CacheEntry) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>>;
}

/// Posts the points of a batch as a JSON array.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(endpoint: Url, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("pattoo-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, entry: &'a CacheEntry) -> Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&entry.batch.points)
                .map_err(|err| ForwardError::Permanent(format!("cannot encode batch: {err}")))?;

            let response = self
                .client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(classify_request_error)?;

            classify_status(response.status())
        })
    }
}

/// Maps an HTTP status to a delivery outcome.
pub fn classify_status(status: StatusCode) -> Result<(), ForwardError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        400 | 413 | 415 | 422 => Err(ForwardError::Permanent(status.to_string())),
        408 | 429 | 500..=599 => Err(ForwardError::Transient(status.to_string())),
        _ => Err(ForwardError::Unknown(status.to_string())),
    }
}

fn classify_request_error(err: reqwest::Error) -> ForwardError {
    if err.is_timeout() || err.is_connect() {
        ForwardError::Transient(err.to_string())
    } else if err.is_builder() || err.is_body() {
        ForwardError::Permanent(err.to_string())
    } else {
        ForwardError::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntryStatus;
    use pattoo_agent_collector::{
        Batch,
        DataType,
        MetricPoint,
        MetricTable,
        MetricValue,
    };
    use pretty_assertions::assert_eq;
    use tokio::{
        io::{
            AsyncReadExt as _,
            AsyncWriteExt as _,
        },
        net::TcpListener,
        sync::oneshot,
    };

    fn entry() -> CacheEntry {
        let table: MetricTable = [
            MetricPoint::new("ifInOctets", "switch-1", 1, MetricValue::Unsigned(10), DataType::Counter),
            MetricPoint::new("ifDescr", "switch-1", 1, MetricValue::Text("lo".to_string()), DataType::Text),
        ]
        .into_iter()
        .collect();
        CacheEntry {
            sequence_id: 1,
            status: EntryStatus::InFlight,
            batch: Batch::new("agent-1", table),
        }
    }

    /// Answers a single request with `status` and hands back what was received.
    async fn respond_once(status: &'static str) -> (Url, oneshot::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/pattoo/api/v1.0/receive/agent-1", listener.local_addr().unwrap())).unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let read = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..read]);
                if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                    break position + 4;
                }
            };
            let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            while buffer.len() < header_end + length {
                let read = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..read]);
            }

            let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            tx.send((head, buffer[header_end..].to_vec())).ok();
        });

        (url, rx)
    }

    #[tokio::test]
    async fn posts_points_as_json_array() {
        let (url, received) = respond_once("200 OK").await;
        let transport = HttpTransport::new(url, Duration::from_secs(5)).unwrap();
        let entry = entry();

        transport.send(&entry).await.unwrap();

        let (head, body) = received.await.unwrap();
        assert!(head.starts_with("POST /pattoo/api/v1.0/receive/agent-1 HTTP/1.1"));
        assert!(head.to_lowercase().contains("content-type: application/json"));
        let posted: Vec<MetricPoint> = serde_json::from_slice(&body).unwrap();
        assert_eq!(posted, entry.batch.points);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let (url, _received) = respond_once("503 Service Unavailable").await;
        let transport = HttpTransport::new(url, Duration::from_secs(5)).unwrap();
        assert!(matches!(transport.send(&entry()).await, Err(ForwardError::Transient(_))));
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let (url, _received) = respond_once("422 Unprocessable Entity").await;
        let transport = HttpTransport::new(url, Duration::from_secs(5)).unwrap();
        let err = transport.send(&entry()).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("http://{address}/receive/agent-1")).unwrap();
        let transport = HttpTransport::new(url, Duration::from_secs(5)).unwrap();
        assert!(matches!(transport.send(&entry()).await, Err(ForwardError::Transient(_))));
    }

    #[test]
    fn status_classes() {
        let outcome = |code: u16| classify_status(StatusCode::from_u16(code).unwrap());
        assert_eq!(outcome(200), Ok(()));
        assert_eq!(outcome(204), Ok(()));
        for code in [400, 413, 415, 422] {
            assert!(matches!(outcome(code), Err(ForwardError::Permanent(_))), "{code}");
        }
        for code in [408, 429, 500, 502, 503] {
            assert!(matches!(outcome(code), Err(ForwardError::Transient(_))), "{code}");
        }
        for code in [301, 401, 403, 404] {
            assert!(matches!(outcome(code), Err(ForwardError::Unknown(_))), "{code}");
        }
    }
}
