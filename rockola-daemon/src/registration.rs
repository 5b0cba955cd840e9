use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registration rejected with {status}: {body}")]
    Rejected { status: reqwest::StatusCode, body: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SocketIdUpdate<'a> {
    socket_id: &'a str,
}

/// Tells the dispatch server which connection identity belongs to this station,
/// so requests for the station are routed to this display.
#[derive(Clone)]
pub struct Registrar {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl Registrar {
    pub fn new(
        base_url: &str,
        station_id: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RegistrationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!(
            "{}/stations/update-socket-id/{}",
            base_url.trim_end_matches('/'),
            station_id
        );
        Ok(Self {
            client,
            endpoint,
            access_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn register(&self, connection_id: &str) -> Result<(), RegistrationError> {
        info!("[SOCKET] Registering connection {}", connection_id);
        self.update(connection_id).await
    }

    /// Clear the routing entry on the server.
    pub async fn deregister(&self) -> Result<(), RegistrationError> {
        info!("[SOCKET] Clearing station registration");
        self.update("").await
    }

    async fn update(&self, socket_id: &str) -> Result<(), RegistrationError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&SocketIdUpdate { socket_id });
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistrationError::Rejected { status, body });
        }
        debug!("[SOCKET] Registration update accepted ({})", status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, hand back its raw text and answer with `status_line`.
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            if !k.eq_ignore_ascii_case("content-length") {
                                return None;
                            }
                            v.trim().parse::<usize>().ok()
                        })
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope", status_line);
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn register_posts_socket_id_with_token() {
        let (base, server) = serve_once("HTTP/1.1 200 OK").await;
        let registrar = Registrar::new(&base, "S1D50", Some("tok".into()), Duration::from_secs(5)).unwrap();

        registrar.register("abc123").await.unwrap();
        let request = server.await.unwrap();

        assert!(request.starts_with("POST /stations/update-socket-id/S1D50 HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
        assert!(request.ends_with(r#"{"socketId":"abc123"}"#));
    }

    #[tokio::test]
    async fn deregister_sends_empty_id() {
        let (base, server) = serve_once("HTTP/1.1 200 OK").await;
        let registrar = Registrar::new(&base, "S1D50", None, Duration::from_secs(5)).unwrap();

        registrar.deregister().await.unwrap();
        let request = server.await.unwrap();

        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        assert!(request.ends_with(r#"{"socketId":""}"#));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (base, server) = serve_once("HTTP/1.1 401 Unauthorized").await;
        let registrar = Registrar::new(&base, "S1D50", None, Duration::from_secs(5)).unwrap();

        let err = registrar.register("abc123").await.unwrap_err();
        server.await.unwrap();
        match err {
            RegistrationError::Rejected { status, body } => {
                assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let registrar = Registrar::new("https://api.example/", "42", None, Duration::from_secs(1)).unwrap();
        assert_eq!(registrar.endpoint(), "https://api.example/stations/update-socket-id/42");
    }
}
