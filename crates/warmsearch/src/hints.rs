/// Operator-facing remediation for a failure code, shared by the daemon replies, the CLI,
/// and the MCP envelope.
pub fn remediation_hint(code: &str) -> Option<&'static str> {
    match code {
        "protocol_error" => Some(
            "Send one JSON object per connection, e.g. {\"query\":\"...\"}, followed by a newline.",
        ),
        "empty_query" => Some("Pass a non-empty search query."),
        "profile_locked" => Some(
            "Another browser is using the warmsearch profile. Close it (or the other warmsearch daemon), or point WARMSEARCH_PROFILE_DIR at a different directory.",
        ),
        "profile_unavailable" => Some(
            "The browser profile directory cannot be created or written. Check permissions or set WARMSEARCH_PROFILE_DIR.",
        ),
        "browser_launch_failed" => Some(
            "Chrome/Chromium could not be started. Install it or set WARMSEARCH_CHROME to the executable; WARMSEARCH_DEBUG=1 shows launch details in the daemon log.",
        ),
        "browser_error" => Some("The browser tab failed mid-search. Retrying usually succeeds."),
        "navigation_failed" => Some(
            "The search page could not be loaded. Check network connectivity and retry.",
        ),
        "challenge_detected" => Some(
            "The search engine showed an anti-bot challenge. Wait a little before retrying; repeated challenges trigger a browser restart and a cooldown.",
        ),
        "cooling_down" => Some(
            "Searching is paused after repeated anti-bot challenges. Retry after retryAfterMs, or set WARMSEARCH_ESCALATION=interactive and WARMSEARCH_HEADED=1 to clear challenges by hand.",
        ),
        "challenge_unresolved" => Some(
            "Nobody cleared the challenge in the visible browser in time. Retry and complete the challenge in the window that opens.",
        ),
        "extraction_failed" => Some(
            "The page loaded but no results could be read from it. The query may have no results, or the page layout changed.",
        ),
        "deadline_exceeded" => Some(
            "The search took longer than WARMSEARCH_DEADLINE_MS. The daemon may be busy; retry or raise the deadline.",
        ),
        "shutting_down" => Some("The daemon is stopping. Retry in a moment to start a fresh one."),
        "internal_error" => Some(
            "Unexpected daemon error. Retry; if it persists, run with WARMSEARCH_DEBUG=1 and check the daemon log.",
        ),
        "daemon_unavailable" => Some(
            "No daemon is listening. `warmsearch <query>` starts one automatically; check WARMSEARCH_SOCKET if you use a custom socket.",
        ),
        "daemon_start_failed" => Some(
            "The daemon did not come up. Run `warmsearch daemon` in a terminal to see why, or check the daemon log.",
        ),
        "daemon_timeout" => Some(
            "The daemon accepted the request but did not answer in time. Raise WARMSEARCH_REQUEST_TIMEOUT_MS or retry.",
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_hints() {
        for code in [
            "protocol_error",
            "profile_locked",
            "cooling_down",
            "extraction_failed",
            "daemon_unavailable",
        ] {
            assert!(remediation_hint(code).is_some(), "missing hint for {code}");
        }
        assert_eq!(remediation_hint("nope"), None);
    }
}
