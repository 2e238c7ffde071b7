use serde::Deserialize;

use crate::error::UploadError;

const RATE_LIMIT_MESSAGE: &str = "Rate Limit Exceeded";
const BAD_REQUEST_MESSAGE: &str = "Bad Request";
const UNAUTHORIZED: u16 = 401;

/// What a platform response means for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success(String),
    RateLimited,
    InvalidAuthorizationCode,
    AuthenticationFailure(String),
    TransientFailure { message: String, code: u16 },
}

#[derive(Debug, Deserialize)]
struct FailureResponse {
    message: String,
    #[serde(default)]
    errors: Vec<FailureDetail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FailureDetail {
    resource: Option<String>,
    field: Option<String>,
    code: Option<String>,
}

/// Classify a platform response from its status and raw body. Pure: no I/O,
/// same input always yields the same answer.
pub fn classify(status: u16, body: &str) -> Classification {
    let body = body.trim();
    if (200..300).contains(&status) {
        return Classification::Success(body.to_string());
    }

    let failure = match serde_json::from_str::<FailureResponse>(body) {
        Ok(failure) => failure,
        Err(_) => {
            return Classification::TransientFailure {
                message: "HTTP failure".to_string(),
                code: status,
            }
        }
    };

    if failure.message.eq_ignore_ascii_case(RATE_LIMIT_MESSAGE) {
        return Classification::RateLimited;
    }

    if failure.message.eq_ignore_ascii_case(BAD_REQUEST_MESSAGE)
        && failure
            .errors
            .first()
            .is_some_and(FailureDetail::is_authorization_code)
    {
        return Classification::InvalidAuthorizationCode;
    }

    if status == UNAUTHORIZED {
        let detail = failure
            .errors
            .first()
            .and_then(|e| e.code.as_deref())
            .map(|code| format!("{} ({code})", failure.message))
            .unwrap_or(failure.message);
        return Classification::AuthenticationFailure(detail);
    }

    Classification::TransientFailure {
        message: failure.message,
        code: status,
    }
}

/// Whether `body` is an error document written by the platform itself.
pub fn is_platform_failure(body: &str) -> bool {
    serde_json::from_str::<FailureResponse>(body.trim()).is_ok()
}

impl FailureDetail {
    fn is_authorization_code(&self) -> bool {
        let resource_matches = self
            .resource
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("AuthorizationCode"));
        let field_matches = self
            .field
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("code"));
        resource_matches && field_matches
    }
}

impl Classification {
    /// Turn a classification into the success body or the matching error.
    /// `authorize_url` is attached to invalid-code errors so the user knows
    /// where to get a fresh one.
    pub fn into_result(self, authorize_url: &str) -> Result<String, UploadError> {
        match self {
            Classification::Success(body) => Ok(body),
            Classification::RateLimited => Err(UploadError::RateLimited),
            Classification::InvalidAuthorizationCode => {
                Err(UploadError::InvalidAuthorizationCode {
                    authorize_url: authorize_url.to_string(),
                })
            }
            Classification::AuthenticationFailure(message) => {
                Err(UploadError::Authentication(message))
            }
            Classification::TransientFailure { message, code } => Err(UploadError::Transient {
                message,
                code: Some(code),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_ignores_body_shape() {
        assert_eq!(
            classify(201, r#"{"id": 42, "status": "Your activity is still being processed."}"#),
            Classification::Success(
                r#"{"id": 42, "status": "Your activity is still being processed."}"#.to_string()
            )
        );
        assert_eq!(classify(200, "not json at all"), Classification::Success("not json at all".into()));
        assert_eq!(classify(204, ""), Classification::Success(String::new()));
    }

    #[test]
    fn rate_limit_message_is_case_insensitive() {
        assert_eq!(
            classify(429, r#"{"message":"Rate Limit Exceeded"}"#),
            Classification::RateLimited
        );
        assert_eq!(
            classify(403, r#"{"message":"rate limit exceeded","errors":[]}"#),
            Classification::RateLimited
        );
    }

    #[test]
    fn bad_authorization_code_is_detected() {
        let body = r#"{"message":"Bad Request","errors":[{"resource":"AuthorizationCode","field":"code"}]}"#;
        assert_eq!(classify(400, body), Classification::InvalidAuthorizationCode);

        let body = r#"{"message":"bad request","errors":[{"resource":"authorizationcode","field":"CODE","code":"invalid"}]}"#;
        assert_eq!(classify(400, body), Classification::InvalidAuthorizationCode);
    }

    #[test]
    fn bad_request_on_other_resource_is_transient() {
        let body = r#"{"message":"Bad Request","errors":[{"resource":"Upload","field":"file","code":"empty"}]}"#;
        assert_eq!(
            classify(400, body),
            Classification::TransientFailure {
                message: "Bad Request".into(),
                code: 400
            }
        );
    }

    #[test]
    fn only_first_sub_error_is_considered() {
        let body = r#"{"message":"Bad Request","errors":[{"resource":"Upload","field":"file"},{"resource":"AuthorizationCode","field":"code"}]}"#;
        assert!(matches!(
            classify(400, body),
            Classification::TransientFailure { .. }
        ));
    }

    #[test]
    fn unparseable_body_keeps_status_code() {
        assert_eq!(
            classify(502, "<html>Bad Gateway</html>"),
            Classification::TransientFailure {
                message: "HTTP failure".into(),
                code: 502
            }
        );
        assert_eq!(
            classify(500, "{}"),
            Classification::TransientFailure {
                message: "HTTP failure".into(),
                code: 500
            }
        );
    }

    #[test]
    fn unauthorized_structured_error_is_authentication_failure() {
        let body = r#"{"message":"Authorization Error","errors":[{"resource":"Athlete","field":"access_token","code":"invalid"}]}"#;
        assert_eq!(
            classify(401, body),
            Classification::AuthenticationFailure("Authorization Error (invalid)".into())
        );
    }

    #[test]
    fn classification_is_repeatable() {
        let body = r#"{"message":"Rate Limit Exceeded"}"#;
        assert_eq!(classify(429, body), classify(429, body));
    }

    #[test]
    fn into_result_maps_to_errors() {
        let err = classify(400, r#"{"message":"Bad Request","errors":[{"resource":"AuthorizationCode","field":"code"}]}"#)
            .into_result("https://auth.example.test/authorize")
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("https://auth.example.test/authorize"));

        let err = classify(429, r#"{"message":"Rate Limit Exceeded"}"#)
            .into_result("")
            .unwrap_err();
        assert!(matches!(err, UploadError::RateLimited));

        let body = classify(200, r#"{"ok":true}"#).into_result("").unwrap();
        assert_eq!(body, r#"{"ok":true}"#);
    }

    #[test]
    fn platform_failure_requires_error_document() {
        assert!(is_platform_failure(r#" {"message":"Bad Request","errors":[]} "#));
        assert!(!is_platform_failure("<html>Too Many Requests</html>"));
        assert!(!is_platform_failure(""));
    }
}
