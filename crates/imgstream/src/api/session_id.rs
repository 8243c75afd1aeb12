//! Session identity for route requests.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::header::COOKIE;
use axum::http::request::Parts;

use super::state::AppState;

/// Session id taken from the session cookie, or the fallback session when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    pub id: String,
}

fn value_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

/// Look up `cookie_name` across every `Cookie` header of a request.
pub fn session_cookie(parts: &Parts, cookie_name: &str) -> Option<String> {
    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|header| value_from_cookie_header(header, cookie_name))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl FromRequestParts<AppState> for SessionId {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let id = session_cookie(parts, &state.session.cookie_name)
            .unwrap_or_else(|| state.session.fallback_session_id.clone());
        Ok(SessionId { id })
    }
}
