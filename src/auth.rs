use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::args::BaseArgs;
use crate::classify::{classify, is_platform_failure, Classification};
use crate::config::Settings;
use crate::error::UploadError;
use crate::http::{authorization_url, ApiResponse, PlatformApi};
use crate::ui::{offer_to_open, print_command_status, CommandStatus};

pub const CREDENTIAL_FILE_NAME: &str = "access.token";

#[derive(Debug, Clone, Args)]
pub struct AuthorizeArgs {
    /// Platform API application client id
    #[arg(env = "FITMIGRATE_CLIENT_ID")]
    pub client_id: String,

    /// Only print the authorization URL
    #[arg(long)]
    pub no_browser: bool,
}

#[derive(Debug, Clone, Args)]
pub struct TokenArgs {
    /// Directory holding the saved credential (the pending directory)
    pub pending_dir: PathBuf,

    /// Show full token (default: masked)
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Clone, Args)]
pub struct LogoutArgs {
    /// Directory holding the saved credential (the pending directory)
    pub pending_dir: PathBuf,
}

/// Temporary platform authorization, persisted as `access.token` next to the
/// jobs it is used for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token_type: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token_type: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    fn parse(response: &ApiResponse, body: &str) -> Result<Self, UploadError> {
        serde_json::from_str(body).map_err(|err| UploadError::Transient {
            message: format!("failed to parse token response: {err}"),
            code: Some(response.status),
        })
    }

    /// A refresh response may omit the refresh token, in which case the one
    /// that was just used stays valid.
    fn into_credential(
        self,
        previous_refresh_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Credential, UploadError> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(epoch), _) => DateTime::from_timestamp(epoch, 0).ok_or_else(|| {
                UploadError::Transient {
                    message: format!("token response carried an invalid expiry {epoch}"),
                    code: None,
                }
            })?,
            (None, Some(secs)) => now + Duration::seconds(secs),
            (None, None) => {
                return Err(UploadError::Transient {
                    message: "token response carried no expiry".to_string(),
                    code: None,
                })
            }
        };
        let refresh_token = self
            .refresh_token
            .or_else(|| previous_refresh_token.map(str::to_string))
            .ok_or_else(|| {
                UploadError::Authentication("token response carried no refresh token".to_string())
            })?;

        Ok(Credential {
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            access_token: self.access_token,
            refresh_token,
            expires_at,
            expires_in: self.expires_in,
        })
    }
}

/// Durable home of the credential. Every write goes through a temporary file
/// and a rename so a crash never leaves a half-written token behind.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_pending_dir(pending_dir: &Path) -> Self {
        Self::new(pending_dir.join(CREDENTIAL_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Any failure to read, parse or write the file is fatal: retrying
    /// cannot repair it.
    pub fn load(&self) -> Result<Option<Credential>, UploadError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(UploadError::credential_file(&self.path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| UploadError::credential_file(&self.path, err))
    }

    pub fn save(&self, credential: &Credential) -> Result<(), UploadError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| UploadError::credential_file(parent, err))?;
        }
        let json = serde_json::to_vec_pretty(credential)
            .map_err(|err| UploadError::credential_file(&self.path, err))?;
        let temp_path = self.path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        };
        write().map_err(|err| UploadError::credential_file(&self.path, err))
    }

    pub fn delete(&self) -> Result<bool, UploadError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(UploadError::credential_file(&self.path, err)),
        }
    }
}

/// Hands out credentials that are valid right now. The whole check/refresh
/// sequence runs under one async mutex, so when several workers find the
/// token expired at once, the first one refreshes and the rest wait and
/// pick up its result.
pub struct CredentialManager {
    api: Arc<dyn PlatformApi>,
    store: CredentialStore,
    authorization_code: Option<String>,
    current: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        store: CredentialStore,
        authorization_code: Option<String>,
    ) -> Self {
        Self {
            api,
            store,
            authorization_code,
            current: Mutex::new(None),
        }
    }

    pub async fn obtain_or_refresh(&self) -> Result<Credential, UploadError> {
        let mut current = self.current.lock().await;
        let credential = match current.clone() {
            Some(credential) => credential,
            None => self.load_or_exchange(&mut current).await?,
        };

        if !credential.is_expired_at(Utc::now()) {
            return Ok(credential);
        }

        let refreshed = self.refresh(&credential).await?;
        // The old refresh token is spent; keep the new one even if the
        // write below fails.
        *current = Some(refreshed.clone());
        self.store.save(&refreshed)?;
        info!(expires_at = %refreshed.expires_at, "refreshed and saved access token");
        Ok(refreshed)
    }

    async fn load_or_exchange(
        &self,
        current: &mut Option<Credential>,
    ) -> Result<Credential, UploadError> {
        if let Some(credential) = self.store.load()? {
            info!(path = %self.store.path().display(), "using previously saved access token");
            *current = Some(credential.clone());
            return Ok(credential);
        }

        let code = self
            .authorization_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| UploadError::MissingAuthorizationCode(self.store.path().to_path_buf()))?;

        info!("exchanging authorization code for an access token");
        let response = self.api.exchange_code(code).await?;
        let body = classify(response.status, &response.body).into_result(&self.api.authorize_url())?;
        let credential = TokenResponse::parse(&response, &body)?.into_credential(None, Utc::now())?;
        *current = Some(credential.clone());
        self.store.save(&credential)?;
        info!(expires_at = %credential.expires_at, "obtained and saved access token");
        Ok(credential)
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential, UploadError> {
        info!(expired_at = %credential.expires_at, "access token expired, refreshing");
        let response = self.api.refresh_token(&credential.refresh_token).await?;

        let rejection = match classify(response.status, &response.body) {
            Classification::Success(body) => {
                return TokenResponse::parse(&response, &body)?
                    .into_credential(Some(&credential.refresh_token), Utc::now());
            }
            Classification::RateLimited => return Err(UploadError::RateLimited),
            Classification::TransientFailure { message, code }
                if is_refresh_rejection(code, &response.body) =>
            {
                format!("{message} ({code})")
            }
            Classification::TransientFailure { message, code } => {
                return Err(UploadError::Transient {
                    message,
                    code: Some(code),
                })
            }
            Classification::AuthenticationFailure(message) => message,
            Classification::InvalidAuthorizationCode => "authorization code rejected".to_string(),
        };

        warn!(
            path = %self.store.path().display(),
            reason = %rejection,
            "refresh token rejected, removing saved credential"
        );
        if let Err(err) = self.store.delete() {
            debug!(error = %err, "failed to remove saved credential");
        }
        Err(UploadError::Authentication(format!(
            "refresh token rejected: {rejection}; re-run with a fresh authorization code from {}",
            self.api.authorize_url()
        )))
    }
}

/// Only a structured client-error answer means the refresh token itself was
/// refused. Timeouts, throttling and bodies the platform did not write (a
/// proxy page, say) are retried with the saved credential intact.
fn is_refresh_rejection(status: u16, body: &str) -> bool {
    matches!(status, 400 | 401 | 403) && is_platform_failure(body)
}

pub async fn run_authorize(base: BaseArgs, args: AuthorizeArgs) -> Result<()> {
    let settings = Settings::resolve(&base)?;
    let url = authorization_url(&settings.authorize_url, &args.client_id);
    println!("{url}");
    if !args.no_browser {
        offer_to_open(&url);
    }
    Ok(())
}

pub fn run_token(base: BaseArgs, args: TokenArgs) -> Result<()> {
    let store = CredentialStore::for_pending_dir(&args.pending_dir);
    let credential = store.load()?.ok_or_else(|| {
        anyhow!(
            "no saved credential at {}; run `fitmigrate upload` with an authorization code",
            store.path().display()
        )
    })?;

    let token = if args.show {
        credential.access_token.clone()
    } else {
        mask_token(&credential.access_token)
    };
    let ttl_seconds = (credential.expires_at - Utc::now()).num_seconds();

    if base.json {
        let output = serde_json::json!({
            "token_type": credential.token_type,
            "token": token,
            "expires_at": credential.expires_at,
            "ttl_seconds": ttl_seconds,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Token: {} {}", credential.token_type, token);
        if ttl_seconds > 0 {
            println!(
                "Expires: {} (in {} seconds)",
                credential.expires_at, ttl_seconds
            );
        } else {
            println!(
                "Expires: {} (EXPIRED, refreshed on next upload)",
                credential.expires_at
            );
        }
    }
    Ok(())
}

pub fn run_logout(_base: BaseArgs, args: LogoutArgs) -> Result<()> {
    let store = CredentialStore::for_pending_dir(&args.pending_dir);
    if store.delete()? {
        print_command_status(
            CommandStatus::Success,
            &format!("Removed saved credential {}", store.path().display()),
        );
    } else {
        print_command_status(
            CommandStatus::Warning,
            &format!("No saved credential at {}", store.path().display()),
        );
    }
    Ok(())
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
