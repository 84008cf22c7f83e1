//! HTTP client for the check-in backend

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::{
    BackendError, CheckinAnalysis, CheckinApi, CheckinStarted, CompleteRequest,
    CompleteResponse, ScreeningRequest,
};
use crate::audio::CameraClip;

/// Uploads run both analyzers server-side, so allow plenty of time
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// FastAPI error body
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    detail: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: String,
}

pub struct BackendClient {
    http: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl BackendClient {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ApiErrorResponse>(&error_text) {
            Ok(ApiErrorResponse {
                detail: serde_json::Value::String(s),
            }) => s,
            Ok(ApiErrorResponse { detail }) => detail.to_string(),
            Err(_) => error_text,
        };

        log::error!("Backend error ({}): {}", status.as_u16(), message);
        Err(BackendError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    /// `POST /checkins/start`
    pub async fn start_checkin(&self) -> Result<CheckinStarted, BackendError> {
        let response = self
            .send(
                self.http
                    .post(self.url("/checkins/start"))
                    .json(&serde_json::json!({})),
            )
            .await?;
        let started: CheckinStarted = Self::json(response).await?;
        log::info!("Check-in started: {}", started.checkin_id);
        Ok(started)
    }

    /// `GET /elevenlabs/signed-url`: short-lived agent WebSocket URL
    pub async fn agent_signed_url(&self) -> Result<String, BackendError> {
        let response = self
            .send(self.http.get(self.url("/elevenlabs/signed-url")))
            .await?;
        let body: SignedUrlResponse = Self::json(response).await?;
        Ok(body.signed_url)
    }
}

#[async_trait]
impl CheckinApi for BackendClient {
    async fn upload_clip(
        &self,
        checkin_id: &str,
        clip: &CameraClip,
    ) -> Result<CheckinAnalysis, BackendError> {
        log::info!(
            "Uploading camera clip for {} ({} bytes, {}ms)",
            checkin_id,
            clip.bytes.len(),
            clip.duration_ms
        );

        let video = Part::bytes(clip.bytes.clone())
            .file_name("checkin.webm")
            .mime_str("video/webm")
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        let metadata = serde_json::json!({ "duration_ms": clip.duration_ms }).to_string();
        let form = Form::new().part("video", video).text("metadata", metadata);

        let response = self
            .send(
                self.http
                    .post(self.url(&format!("/checkins/{}/upload", checkin_id)))
                    .multipart(form),
            )
            .await?;
        Self::json(response).await
    }

    async fn fetch_checkin(&self, checkin_id: &str) -> Result<CheckinAnalysis, BackendError> {
        let response = self
            .send(self.http.get(self.url(&format!("/checkins/{}", checkin_id))))
            .await?;
        Self::json(response).await
    }

    async fn submit_screening(&self, request: &ScreeningRequest) -> Result<(), BackendError> {
        self.send(self.http.post(self.url("/screenings")).json(request))
            .await?;
        log::info!("Screening recorded ({} responses)", request.responses.len());
        Ok(())
    }

    async fn complete_checkin(
        &self,
        checkin_id: &str,
        request: &CompleteRequest,
    ) -> Result<CompleteResponse, BackendError> {
        let response = self
            .send(
                self.http
                    .post(self.url(&format!("/checkins/{}/complete", checkin_id)))
                    .json(request),
            )
            .await?;
        let result: CompleteResponse = Self::json(response).await?;
        log::info!(
            "Check-in {} completed: {} ({:?})",
            checkin_id,
            result.triage_status,
            result.triage_reasons
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = BackendClient::new("http://localhost:8000/", None).unwrap();
        assert_eq!(client.url("/checkins/start"), "http://localhost:8000/checkins/start");
    }

    #[test]
    fn test_api_error_display() {
        let err = BackendError::Api {
            status: 404,
            message: "Check-in not found".to_string(),
        };
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("Check-in not found"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let client = BackendClient::new("http://127.0.0.1:9", None).unwrap();
        assert!(matches!(
            client.fetch_checkin("c1").await,
            Err(BackendError::Network(_))
        ));
    }

    #[tokio::test]
    #[ignore] // Requires a running backend
    async fn test_start_checkin_live() {
        let url = std::env::var("CHECKIN_BACKEND_URL").expect("CHECKIN_BACKEND_URL required");
        let client = BackendClient::new(&url, std::env::var("CHECKIN_AUTH_TOKEN").ok()).unwrap();
        let started = client.start_checkin().await.unwrap();
        assert!(!started.checkin_id.is_empty());
    }
}
