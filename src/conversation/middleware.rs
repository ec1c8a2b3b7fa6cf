//! Request classification and conversation lifecycle driving.
//!
//! Every request is reduced to a normalized signature (path plus the first
//! value of each non-empty query parameter) and matched against the
//! configured initiator/terminator patterns. Initiators begin a
//! conversation, terminators end one after the response, everything else
//! continues whatever is active. Non-terminating requests release the
//! handle's transport afterwards so pooled connections are not starved
//! between requests of a still-open conversation.

use std::collections::HashSet;

use axum::{
    extract::{Request, State},
    http::{StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;
use crate::conversation::{Conversation, ConversationError};

/// The conversation attached to the current request, if any.
///
/// Inserted into request extensions by [`conversation_middleware`]; handlers
/// take it via `Extension<ActiveConversation>` instead of reaching for any
/// ambient state.
#[derive(Debug, Clone)]
pub struct ActiveConversation(pub Conversation);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Begin,
    End,
    Continue,
}

/// Initiator and terminator patterns compiled from the semicolon-delimited
/// configuration surface.
#[derive(Debug)]
pub struct ConversationPatterns {
    initiators: Vec<Regex>,
    terminators: Vec<Regex>,
}

impl ConversationPatterns {
    pub fn new(initiators: &str, terminators: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            initiators: compile_list(initiators)?,
            terminators: compile_list(terminators)?,
        })
    }

    /// Initiators are checked before terminators; the first match wins and
    /// no match means the request continues the current conversation.
    fn classify(&self, signature: &str) -> Action {
        if self.initiators.iter().any(|p| p.is_match(signature)) {
            Action::Begin
        } else if self.terminators.iter().any(|p| p.is_match(signature)) {
            Action::End
        } else {
            Action::Continue
        }
    }
}

/// Patterns match the whole signature, like the servlet-style configuration
/// they come from.
fn compile_list(list: &str) -> Result<Vec<Regex>, regex::Error> {
    list.split(';')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| Regex::new(&format!("^(?:{pattern})$")))
        .collect()
}

/// Normalized request signature: the path plus the first value of each
/// non-empty query parameter, in query order.
fn request_signature(uri: &Uri) -> String {
    let mut signature = uri.path().to_string();
    let Some(query) = uri.query() else {
        return signature;
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut first = true;
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if !seen.insert(name.to_string()) {
            continue;
        }
        if value.is_empty() {
            continue;
        }
        signature.push(if first { '?' } else { '&' });
        signature.push_str(&name);
        signature.push('=');
        signature.push_str(&value);
        first = false;
    }
    signature
}

/// Drives the conversation lifecycle around every request.
pub async fn conversation_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let signature = request_signature(request.uri());
    let cookie_name = state.config.conversation.session_cookie.clone();
    let session_id = jar.get(&cookie_name).map(|c| c.value().to_string());

    match state.patterns.classify(&signature) {
        Action::Begin => {
            debug!(%signature, "request starts a new conversation");
            let (session_id, jar) = match session_id {
                Some(id) => (id, None),
                None => {
                    let id = Uuid::new_v4().to_string();
                    let mut cookie = Cookie::new(cookie_name, id.clone());
                    cookie.set_path("/");
                    (id, Some(jar.add(cookie)))
                }
            };
            let conversation = match state.registry.begin(&session_id).await {
                Ok(conversation) => conversation,
                Err(error) => return error_response(&error),
            };
            request
                .extensions_mut()
                .insert(ActiveConversation(conversation));
            let response = next.run(request).await;
            if let Err(error) = state.registry.disconnect(&session_id).await {
                return error_response(&error);
            }
            match jar {
                Some(jar) => (jar, response).into_response(),
                None => response,
            }
        }
        Action::End => {
            debug!(%signature, "request ends the current conversation");
            let Some(session_id) = session_id else {
                return next.run(request).await;
            };
            // Keyed lookup, no refresh: the handler still needs the handle
            // to flush pending work before the conversation goes away.
            if let Some(conversation) = state.registry.get(&session_id) {
                request
                    .extensions_mut()
                    .insert(ActiveConversation(conversation));
            }
            let response = next.run(request).await;
            if let Err(error) = state.registry.end(&session_id).await {
                return error_response(&error);
            }
            response
        }
        Action::Continue => {
            debug!(%signature, "request continues the current conversation");
            let Some(session_id) = session_id else {
                return next.run(request).await;
            };
            match state.registry.continue_conversation(&session_id).await {
                Ok(Some(conversation)) => {
                    request
                        .extensions_mut()
                        .insert(ActiveConversation(conversation));
                }
                Ok(None) => {}
                Err(error) => return error_response(&error),
            }
            let response = next.run(request).await;
            if let Err(error) = state.registry.disconnect(&session_id).await {
                return error_response(&error);
            }
            response
        }
    }
}

fn error_response(error: &ConversationError) -> Response {
    match error {
        ConversationError::TimedOut => {
            (StatusCode::UNAUTHORIZED, "conversation timed out").into_response()
        }
        ConversationError::Provider(error) => {
            tracing::error!(%error, "conversation store failure");
            (StatusCode::INTERNAL_SERVER_ERROR, "persistence failure").into_response()
        }
    }
}
