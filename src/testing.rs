//! In-memory platform used by unit tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::Credential;
use crate::error::UploadError;
use crate::http::{ApiResponse, PlatformApi};
use crate::jobs::JobDescriptor;

pub fn token_body(access_token: &str, refresh_token: &str, expires_at: DateTime<Utc>) -> String {
    serde_json::json!({
        "token_type": "Bearer",
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_at": expires_at.timestamp(),
        "expires_in": (expires_at - Utc::now()).num_seconds(),
    })
    .to_string()
}

pub fn valid_credential(access_token: &str) -> Credential {
    Credential {
        token_type: "Bearer".to_string(),
        access_token: access_token.to_string(),
        refresh_token: format!("{access_token}-refresh"),
        expires_at: DateTime::from_timestamp(Utc::now().timestamp() + 6 * 3600, 0).unwrap(),
        expires_in: Some(6 * 3600),
    }
}

pub fn expired_credential(access_token: &str) -> Credential {
    Credential {
        expires_at: DateTime::from_timestamp(Utc::now().timestamp() - 60, 0).unwrap(),
        ..valid_credential(access_token)
    }
}

/// Scripted platform: queued responses are served first, then every call
/// succeeds. Successful uploads echo the external id.
#[derive(Default)]
pub struct FakePlatform {
    exchange_responses: Mutex<VecDeque<ApiResponse>>,
    refresh_responses: Mutex<VecDeque<ApiResponse>>,
    upload_responses: Mutex<VecDeque<Result<ApiResponse, UploadError>>>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    authorizations: Mutex<Vec<String>>,
    uploaded_ids: Mutex<Vec<String>>,
    refresh_delay: Duration,
    upload_delay: Duration,
}

impl FakePlatform {
    pub fn with_refresh_delay(mut self, millis: u64) -> Self {
        self.refresh_delay = Duration::from_millis(millis);
        self
    }

    pub fn with_upload_delay(mut self, millis: u64) -> Self {
        self.upload_delay = Duration::from_millis(millis);
        self
    }

    pub fn push_exchange(&self, status: u16, body: &str) {
        self.exchange_responses
            .lock()
            .unwrap()
            .push_back(response(status, body));
    }

    pub fn push_refresh(&self, status: u16, body: &str) {
        self.refresh_responses
            .lock()
            .unwrap()
            .push_back(response(status, body));
    }

    pub fn push_upload(&self, status: u16, body: &str) {
        self.upload_responses
            .lock()
            .unwrap()
            .push_back(Ok(response(status, body)));
    }

    pub fn push_upload_error(&self, err: UploadError) {
        self.upload_responses.lock().unwrap().push_back(Err(err));
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn authorizations(&self) -> Vec<String> {
        self.authorizations.lock().unwrap().clone()
    }

    pub fn uploaded_ids(&self) -> Vec<String> {
        let mut ids = self.uploaded_ids.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

fn response(status: u16, body: &str) -> ApiResponse {
    ApiResponse {
        status,
        body: body.to_string(),
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn exchange_code(&self, _code: &str) -> Result<ApiResponse, UploadError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.exchange_responses.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| {
            response(
                200,
                &token_body("exchanged", "rt", Utc::now() + chrono::Duration::hours(6)),
            )
        }))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<ApiResponse, UploadError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let queued = self.refresh_responses.lock().unwrap().pop_front();
        Ok(queued.unwrap_or_else(|| {
            response(
                200,
                &token_body("refreshed", "rt2", Utc::now() + chrono::Duration::hours(6)),
            )
        }))
    }

    async fn upload(
        &self,
        job: &JobDescriptor,
        _payload: &Path,
        authorization: &str,
    ) -> Result<ApiResponse, UploadError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.authorizations
            .lock()
            .unwrap()
            .push(authorization.to_string());
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        let queued = self.upload_responses.lock().unwrap().pop_front();
        let result = queued.unwrap_or_else(|| {
            Ok(response(
                201,
                &format!(r#"{{"external_id":"{}","status":"queued"}}"#, job.external_id),
            ))
        });
        if matches!(&result, Ok(r) if (200..300).contains(&r.status)) {
            self.uploaded_ids
                .lock()
                .unwrap()
                .push(job.external_id.clone());
        }
        result
    }

    fn authorize_url(&self) -> String {
        "https://auth.example.test/authorize?client_id=test".to_string()
    }
}
