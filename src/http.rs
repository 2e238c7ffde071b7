use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Serialize;

use crate::error::UploadError;
use crate::jobs::JobDescriptor;

pub const DEFAULT_API_URL: &str = "https://www.strava.com/api/v3";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://www.strava.com/oauth/authorize";
const REDIRECT_URI: &str = "https://localhost/response";
const SCOPES: &str =
    "read,read_all,profile:read_all,profile:write,activity:read_all,activity:write";

/// Raw platform response, handed to the classifier as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// The three calls the pipeline makes against the platform. Transport
/// failures come back as `UploadError::Transient` with no status code;
/// every HTTP response, successful or not, comes back as `ApiResponse`.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<ApiResponse, UploadError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<ApiResponse, UploadError>;

    async fn upload(
        &self,
        job: &JobDescriptor,
        payload: &Path,
        authorization: &str,
    ) -> Result<ApiResponse, UploadError>;

    /// Where a user obtains a fresh authorization code.
    fn authorize_url(&self) -> String;
}

#[derive(Debug, Serialize)]
struct CodeExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    grant_type: &'static str,
}

#[derive(Debug, Serialize)]
struct RefreshTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct HttpPlatform {
    client: Client,
    api_url: String,
    authorize_base: String,
    client_id: String,
    client_secret: String,
}

impl HttpPlatform {
    pub fn new(api_url: &str, authorize_base: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            authorize_base: authorize_base.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn read_response(response: reqwest::Response) -> Result<ApiResponse, UploadError> {
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| UploadError::Transient {
            message: format!("failed to read response body: {err}"),
            code: Some(status),
        })?;
        Ok(ApiResponse { status, body })
    }
}

fn transport_error(action: &str, err: reqwest::Error) -> UploadError {
    UploadError::Transient {
        message: format!("{action}: {err}"),
        code: err.status().map(|s| s.as_u16()),
    }
}

#[async_trait]
impl PlatformApi for HttpPlatform {
    async fn exchange_code(&self, code: &str) -> Result<ApiResponse, UploadError> {
        let params = CodeExchangeRequest {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            code,
            grant_type: "authorization_code",
        };
        let response = self
            .client
            .post(self.url("/oauth/token"))
            .form(&params)
            .send()
            .await
            .map_err(|err| transport_error("failed to exchange authorization code", err))?;
        Self::read_response(response).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<ApiResponse, UploadError> {
        let params = RefreshTokenRequest {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            refresh_token,
            grant_type: "refresh_token",
        };
        let response = self
            .client
            .post(self.url("/oauth/token"))
            .form(&params)
            .send()
            .await
            .map_err(|err| transport_error("failed to refresh access token", err))?;
        Self::read_response(response).await
    }

    async fn upload(
        &self,
        job: &JobDescriptor,
        payload: &Path,
        authorization: &str,
    ) -> Result<ApiResponse, UploadError> {
        let bytes = tokio::fs::read(payload)
            .await
            .map_err(|err| UploadError::io(payload, err))?;
        let file_part = Part::bytes(bytes)
            .file_name(job.file_name.clone())
            .mime_str(payload_mime_type(&job.data_type))
            .map_err(|err| transport_error("invalid payload media type", err))?;

        let mut form = Form::new()
            .text("name", job.name.clone())
            .text("description", job.description.clone())
            .text("external_id", job.external_id.clone())
            .text("sport_type", job.sport_type.clone())
            .text("data_type", job.data_type.clone())
            .text("commute", job.commute.to_string())
            .text("trainer", job.trainer.to_string())
            .part("file", file_part);
        if let Some(gear_id) = &job.gear_id {
            form = form.text("gear_id", gear_id.clone());
        }

        let response = self
            .client
            .post(self.url("/uploads"))
            .header(reqwest::header::AUTHORIZATION, authorization)
            .multipart(form)
            .send()
            .await
            .map_err(|err| transport_error("upload request failed", err))?;
        Self::read_response(response).await
    }

    fn authorize_url(&self) -> String {
        authorization_url(&self.authorize_base, &self.client_id)
    }
}

/// Browser URL for the interactive consent step that yields a one-time code.
pub fn authorization_url(authorize_base: &str, client_id: &str) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}",
        authorize_base,
        urlencoding::encode(client_id),
        REDIRECT_URI,
        SCOPES
    )
}

fn payload_mime_type(data_type: &str) -> &'static str {
    if data_type.ends_with(".gz") {
        "application/gzip"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn job(file_name: &str) -> JobDescriptor {
        JobDescriptor {
            name: "Morning Run".to_string(),
            description: "Imported activity".to_string(),
            external_id: "1234".to_string(),
            sport_type: "Run".to_string(),
            data_type: "gpx.gz".to_string(),
            file_name: file_name.to_string(),
            gear_id: Some("g42".to_string()),
            ..JobDescriptor::default()
        }
    }

    #[test]
    fn authorization_url_contains_client_and_scopes() {
        let url = authorization_url(DEFAULT_AUTHORIZE_URL, "12345");
        assert!(url.starts_with("https://www.strava.com/oauth/authorize?client_id=12345&"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("activity:write"));
    }

    #[test]
    fn mime_type_follows_data_type() {
        assert_eq!(payload_mime_type("gpx.gz"), "application/gzip");
        assert_eq!(payload_mime_type("tcx"), "application/octet-stream");
    }

    #[tokio::test]
    async fn exchange_code_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("client_id".into(), "cid".into()),
                Matcher::UrlEncoded("client_secret".into(), "secret".into()),
                Matcher::UrlEncoded("code".into(), "abc".into()),
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at"}"#)
            .create_async()
            .await;

        let platform = HttpPlatform::new(&server.url(), DEFAULT_AUTHORIZE_URL, "cid", "secret");
        let response = platform.exchange_code("abc").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, r#"{"access_token":"at"}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_posts_refresh_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("refresh_token".into(), "rt".into()),
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            ]))
            .with_status(400)
            .with_body(r#"{"message":"Bad Request"}"#)
            .create_async()
            .await;

        let platform = HttpPlatform::new(&server.url(), DEFAULT_AUTHORIZE_URL, "cid", "secret");
        let response = platform.refresh_token("rt").await.unwrap();

        assert_eq!(response.status, 400);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn upload_sends_authorization_header_and_multipart_body() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("run.gpx.gz");
        std::fs::write(&payload, b"payload-bytes").unwrap();

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/uploads")
            .match_header("authorization", "Bearer at")
            .match_header(
                "content-type",
                Matcher::Regex("^multipart/form-data".to_string()),
            )
            .match_body(Matcher::Regex("name=\"external_id\"".to_string()))
            .with_status(201)
            .with_body(r#"{"id":1}"#)
            .create_async()
            .await;

        let platform = HttpPlatform::new(&server.url(), DEFAULT_AUTHORIZE_URL, "cid", "secret");
        let response = platform
            .upload(&job("run.gpx.gz"), &payload, "Bearer at")
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let platform = HttpPlatform::new("http://127.0.0.1:1", DEFAULT_AUTHORIZE_URL, "cid", "secret");
        let err = platform.exchange_code("abc").await.unwrap_err();
        assert!(matches!(err, UploadError::Transient { code: None, .. }));
    }
}
