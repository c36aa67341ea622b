use async_trait::async_trait;
use bytes::Bytes;
use jarvis_core::{Error, Result};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error as ThisError;

/// Outbound HTTP request, cloneable so it can be replayed on retry.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: &Value) -> Self {
        self.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(Bytes::from(body.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Map a non-success status to the error taxonomy.
    pub fn error_for_status(self, url: &str) -> Result<Self> {
        let status = self.status;
        if self.is_success() || (300..400).contains(&status) {
            return Ok(self);
        }
        let message = format!("{} returned HTTP {}", url, status);
        Err(match status {
            401 | 403 => Error::Authentication(message),
            429 => Error::ServiceUnavailable {
                message,
                retry_after: Some(60),
                status: Some(status),
                attempts: None,
            },
            s if s >= 500 => Error::ServiceUnavailable {
                message,
                retry_after: Some(10),
                status: Some(status),
                attempts: None,
            },
            _ => Error::InvalidParameter(message),
        })
    }
}

/// Failure below the HTTP layer.
#[derive(ThisError, Debug, Clone)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Other(String),
}

/// Something that can perform one HTTP exchange.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_for_status_mapping() {
        let url = "https://api.example.com";
        assert!(HttpResponse::new(200, "ok").error_for_status(url).is_ok());
        assert!(matches!(
            HttpResponse::new(401, "").error_for_status(url),
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            HttpResponse::new(404, "").error_for_status(url),
            Err(Error::InvalidParameter(_))
        ));
        match HttpResponse::new(429, "").error_for_status(url) {
            Err(Error::ServiceUnavailable { status, retry_after, .. }) => {
                assert_eq!(status, Some(429));
                assert_eq!(retry_after, Some(60));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            HttpResponse::new(502, "").error_for_status(url),
            Err(Error::ServiceUnavailable { status: Some(502), .. })
        ));
    }

    #[test]
    fn test_request_builder_json() {
        let req = HttpRequest::post("http://bridge.local/api/lights").json(&serde_json::json!({"on": true}));
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.headers[0].1, "application/json");
        assert_eq!(req.body.as_deref(), Some(br#"{"on":true}"#.as_slice()));
    }

    #[test]
    fn test_response_json() {
        let resp = HttpResponse::new(200, r#"{"temp": 21}"#);
        let v: Value = resp.json().unwrap();
        assert_eq!(v["temp"], 21);
    }
}
