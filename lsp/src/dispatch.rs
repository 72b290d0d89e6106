//! Method-name table for server-initiated requests and notifications.

use std::collections::HashMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::{ResponseError, error_codes};
use crate::session::Session;

pub(crate) type RequestHandler = fn(&mut Session, Option<Value>) -> Result<Value, ResponseError>;
pub(crate) type NotificationHandler = fn(&mut Session, Option<Value>);

pub(crate) struct DispatchTable {
    requests: HashMap<&'static str, RequestHandler>,
    notifications: HashMap<&'static str, NotificationHandler>,
}

impl DispatchTable {
    /// Handlers for every server message the engine understands.
    pub fn standard() -> Self {
        let requests: [(&'static str, RequestHandler); 7] = [
            ("client/registerCapability", Session::on_register_capability),
            ("client/unregisterCapability", Session::on_unregister_capability),
            ("window/workDoneProgress/create", Session::on_work_done_progress_create),
            ("workspace/configuration", Session::on_configuration),
            ("workspace/workspaceFolders", Session::on_workspace_folders),
            ("workspace/semanticTokens/refresh", Session::on_semantic_tokens_refresh),
            ("window/showMessageRequest", Session::on_show_message_request),
        ];
        let notifications: [(&'static str, NotificationHandler); 4] = [
            ("textDocument/publishDiagnostics", Session::on_publish_diagnostics),
            ("$/progress", Session::on_progress),
            ("window/logMessage", Session::on_log_message),
            ("window/showMessage", Session::on_show_message),
        ];
        Self {
            requests: requests.into_iter().collect(),
            notifications: notifications.into_iter().collect(),
        }
    }

    pub fn request(&self, method: &str) -> Option<RequestHandler> {
        self.requests.get(method).copied()
    }

    pub fn notification(&self, method: &str) -> Option<NotificationHandler> {
        self.notifications.get(method).copied()
    }
}

/// Deserialize request params, mapping failure to `InvalidParams`.
pub(crate) fn parse_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T, ResponseError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        tracing::debug!(method, "Malformed params: {e}");
        ResponseError::new(error_codes::INVALID_PARAMS, format!("invalid params for {method}: {e}"))
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Registration {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub register_options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegistrationParams {
    pub registrations: Vec<Registration>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Unregistration {
    pub id: String,
    pub method: String,
}

/// The field name misspelling is part of the protocol.
#[derive(Debug, Deserialize)]
pub(crate) struct UnregistrationParams {
    #[serde(alias = "unregistrations")]
    pub unregisterations: Vec<Unregistration>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigurationItem {
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfigurationParams {
    pub items: Vec<ConfigurationItem>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: u64,
    pub message: String,
}
