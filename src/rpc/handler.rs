//! Exported control-plane methods
//!
//! The allow-list is the static [`METHODS`] table; a name that is not in it is
//! rejected before any argument is looked at.

use std::net::IpAddr;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::protocol::{RemoteError, RemoteErrorKind};
use crate::forwarder::ProxyForwarder;
use crate::registry::InspectorConfig;
use crate::upstream::UpstreamParams;

/// Longest accepted username or password
pub const MAX_CREDENTIAL_LEN: usize = 64;

/// Signature shared by every exported method
pub type Handler = fn(&ProxyForwarder, CallArgs) -> Result<Value, RemoteError>;

/// Exported methods
pub static METHODS: &[(&str, Handler)] = &[
    ("create_entry_point", create_entry_point),
    ("delete_entry_point", delete_entry_point),
    ("exists_entry_point", exists_entry_point),
    ("terminate", terminate),
];

/// Find an exported method by name
#[must_use]
pub fn lookup(method_name: &str) -> Option<Handler> {
    METHODS
        .iter()
        .find(|(name, _)| *name == method_name)
        .map(|(_, handler)| *handler)
}

/// Arguments of one call, bound to parameters in declaration order
///
/// Positional arguments fill parameters first; keyword arguments fill the
/// rest. Supplying a parameter both ways, leaving a required one out or
/// passing anything unused is an `InvalidArguments` error.
#[derive(Debug)]
pub struct CallArgs {
    method: String,
    args: std::vec::IntoIter<Value>,
    kwargs: Map<String, Value>,
}

impl CallArgs {
    /// Wrap decoded request arguments
    pub fn new(method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            args: args.into_iter(),
            kwargs,
        }
    }

    /// Bind a required parameter
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the parameter is missing, given twice or
    /// of the wrong type.
    pub fn required<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, RemoteError> {
        match self.bind::<T>(name)? {
            Some(value) => Ok(value),
            None => Err(RemoteError::invalid_arguments(format!(
                "{}() missing required argument `{name}`",
                self.method
            ))),
        }
    }

    /// Bind an optional parameter; absent and `null` are both `None`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the parameter is given twice or of the
    /// wrong type.
    pub fn optional<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>, RemoteError> {
        Ok(self.bind::<Option<T>>(name)?.flatten())
    }

    /// Reject leftover arguments
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if positional or keyword arguments remain.
    pub fn finish(self) -> Result<(), RemoteError> {
        let extra = self.args.len();
        if extra > 0 {
            return Err(RemoteError::invalid_arguments(format!(
                "{}() got {extra} unexpected positional argument(s)",
                self.method
            )));
        }
        if let Some(name) = self.kwargs.keys().next() {
            return Err(RemoteError::invalid_arguments(format!(
                "{}() got an unexpected keyword argument `{name}`",
                self.method
            )));
        }
        Ok(())
    }

    fn bind<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<T>, RemoteError> {
        let value = match self.args.next() {
            Some(value) => {
                if self.kwargs.contains_key(name) {
                    return Err(RemoteError::invalid_arguments(format!(
                        "{}() got multiple values for argument `{name}`",
                        self.method
                    )));
                }
                value
            }
            None => match self.kwargs.remove(name) {
                Some(value) => value,
                None => return Ok(None),
            },
        };

        serde_json::from_value(value).map(Some).map_err(|e| {
            RemoteError::invalid_arguments(format!(
                "{}() argument `{name}`: {e}",
                self.method
            ))
        })
    }
}

fn check_credential(field: &str, value: &str) -> Result<(), RemoteError> {
    if value.is_empty() || value.chars().count() > MAX_CREDENTIAL_LEN {
        return Err(RemoteError::invalid_parameter(format!(
            "`{field}` must be 1 to {MAX_CREDENTIAL_LEN} characters"
        )));
    }
    Ok(())
}

/// `create_entry_point(username, password, proxy_kwargs, client_host=None, inspector=None)`
///
/// Returns the creation timestamp, or `null` if the username is taken.
fn create_entry_point(
    forwarder: &ProxyForwarder,
    mut call: CallArgs,
) -> Result<Value, RemoteError> {
    let username: String = call.required("username")?;
    let password: String = call.required("password")?;
    let params: Option<UpstreamParams> = call.optional("proxy_kwargs")?;
    let client_host: Option<String> = call.optional("client_host")?;
    let inspector: Option<InspectorConfig> = call.optional("inspector")?;
    call.finish()?;

    check_credential("username", &username)?;
    check_credential("password", &password)?;

    let client_host = client_host
        .map(|host| {
            host.parse::<IpAddr>().map_err(|_| {
                RemoteError::invalid_parameter(format!(
                    "`client_host` is not an IP address: {host}"
                ))
            })
        })
        .transpose()?;

    let created = forwarder
        .create_entry_point(
            &username,
            &password,
            params.unwrap_or_default(),
            client_host,
            inspector,
        )
        .map_err(|e| RemoteError::invalid_parameter(e.to_string()))?;

    Ok(created.map_or(Value::Null, Value::from))
}

/// `delete_entry_point(username)`
///
/// Returns the usage summary, or `null` if there is no such entry point.
fn delete_entry_point(
    forwarder: &ProxyForwarder,
    mut call: CallArgs,
) -> Result<Value, RemoteError> {
    let username: String = call.required("username")?;
    call.finish()?;

    match forwarder.delete_entry_point(&username) {
        Some(summary) => serde_json::to_value(summary)
            .map_err(|e| RemoteError::new(RemoteErrorKind::Internal, e.to_string())),
        None => Ok(Value::Null),
    }
}

/// `exists_entry_point(username)`
fn exists_entry_point(
    forwarder: &ProxyForwarder,
    mut call: CallArgs,
) -> Result<Value, RemoteError> {
    let username: String = call.required("username")?;
    call.finish()?;

    Ok(Value::Bool(forwarder.exists_entry_point(&username)))
}

/// `terminate()`
///
/// Replies immediately; teardown runs in the background.
fn terminate(forwarder: &ProxyForwarder, call: CallArgs) -> Result<Value, RemoteError> {
    call.finish()?;
    forwarder.terminate();
    Ok(Value::Null)
}
