use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    InvalidParams,
    DaemonUnavailable,
    ChallengeDetected,
    CoolingDown,
    ProfileUnavailable,
    SearchFailed,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::DaemonUnavailable => "daemon_unavailable",
            Self::ChallengeDetected => "challenge_detected",
            Self::CoolingDown => "cooling_down",
            Self::ProfileUnavailable => "profile_unavailable",
            Self::SearchFailed => "search_failed",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::DaemonUnavailable
            | Self::ChallengeDetected
            | Self::CoolingDown
            | Self::SearchFailed => true,
            // Needs the operator to change something first.
            Self::InvalidParams | Self::ProfileUnavailable | Self::UnexpectedError => false,
        }
    }

    /// Folds a daemon or client failure code into the envelope's coarser set.
    pub(crate) fn from_failure(code: &str) -> Self {
        match code {
            "empty_query" | "protocol_error" => Self::InvalidParams,
            "daemon_unavailable" | "daemon_start_failed" | "daemon_timeout" | "shutting_down" => {
                Self::DaemonUnavailable
            }
            "challenge_detected" | "challenge_unresolved" => Self::ChallengeDetected,
            "cooling_down" => Self::CoolingDown,
            "profile_locked" | "profile_unavailable" | "browser_launch_failed" => {
                Self::ProfileUnavailable
            }
            "internal_error" => Self::UnexpectedError,
            _ => Self::SearchFailed,
        }
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(super::SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}
