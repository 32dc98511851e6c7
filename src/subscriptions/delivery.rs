//! Outbound delivery of subscription results

use crate::error::DeliveryError;
use crate::model::PollResponse;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

/// Pushes a result payload to a subscription destination
#[async_trait]
pub trait ResultSender: Send + Sync {
    async fn send(&self, destination: &str, response: &PollResponse) -> Result<(), DeliveryError>;
}

/// POSTs the poll response as JSON; any non-2xx answer is a failure
pub struct HttpResultSender {
    client: reqwest::Client,
}

impl HttpResultSender {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ResultSender for HttpResultSender {
    async fn send(&self, destination: &str, response: &PollResponse) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(response)?;

        let answer = self
            .client
            .post(destination)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !answer.status().is_success() {
            return Err(DeliveryError::Status(answer.status().as_u16()));
        }

        log::debug!("📤 Delivered {} results to {}", response.results.len(), destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::QueryResults;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP endpoint answering every request with `status`
    async fn endpoint(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 64 * 1024];
            let _ = socket.read(&mut buffer).await;
            let answer = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
            socket.write_all(answer.as_bytes()).await.unwrap();
        });

        format!("http://{}/", address)
    }

    fn response() -> PollResponse {
        PollResponse {
            query_name: "SimpleEventQuery".to_string(),
            subscription_id: Some("sub-1".to_string()),
            results: QueryResults::Events(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_success_status_is_delivered() {
        let destination = endpoint("200 OK").await;
        let sender = HttpResultSender::new(Duration::from_secs(5)).unwrap();

        assert!(sender.send(&destination, &response()).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status_is_a_delivery_failure() {
        let destination = endpoint("503 Service Unavailable").await;
        let sender = HttpResultSender::new(Duration::from_secs(5)).unwrap();

        let result = sender.send(&destination, &response()).await;
        assert!(matches!(result, Err(DeliveryError::Status(503))));
    }

    #[tokio::test]
    async fn test_unreachable_destination_is_a_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let sender = HttpResultSender::new(Duration::from_secs(2)).unwrap();
        let result = sender.send(&format!("http://{}/", address), &response()).await;
        assert!(matches!(result, Err(DeliveryError::Transport(_))));
    }
}
