// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the Ironplane control plane
//!
//! For HTTP-level error handling, see Dropshot.

use crate::api::external::ResourceType;
use dropshot::ClientErrorStatusCode;
use dropshot::HttpError;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use uuid::Uuid;

/// An error that can be generated within a control plane component
///
/// These are generated while handling a mutation request.  The outward
/// layer converts an `Error` into a transport-level error as one of the last
/// steps in processing the request, which keeps the core agnostic to the
/// transport it is reached through.
///
/// Where possible, reuse existing variants rather than inventing new ones to
/// distinguish cases that no programmatic consumer needs to distinguish.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum Error {
    /// An object needed as part of this operation was not found.
    #[error("Object (of type {lookup_type:?}) not found: {type_name}")]
    ObjectNotFound { type_name: ResourceType, lookup_type: LookupType },
    /// An object already exists with the specified name or identifier.
    #[error("Object (of type {type_name:?}) already exists: {object_name}")]
    ObjectAlreadyExists { type_name: ResourceType, object_name: String },
    /// The request conflicts with the current state of a resource that is
    /// still in use.
    #[error("Conflict: {message}")]
    Conflict { message: String },
    /// The request was well-formed, but the operation cannot be completed given
    /// the current state of the system.
    #[error("Invalid Request: {message}")]
    InvalidRequest { message: String },
    /// The specified input field is not valid.
    #[error("Invalid Value: {label}, {message}")]
    InvalidValue { label: String, message: String },
    /// There is not enough backing capacity (Machines or address space) to
    /// satisfy the request.
    ///
    /// `external_message` is safe to show to the requester; the internal
    /// message carries the numbers an operator needs.
    #[error(
        "Insufficient Capacity: {external_message} ({internal_message})"
    )]
    InsufficientCapacity { external_message: String, internal_message: String },

    /// The system encountered an unhandled operational error.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
    /// The system (or part of it) is unavailable.
    #[error("Service Unavailable: {internal_message}")]
    ServiceUnavailable { internal_message: String },
}

/// Indicates how an object was looked up (for an `ObjectNotFound` error)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum LookupType {
    /// a specific id was requested
    ById(Uuid),
}

impl LookupType {
    /// Returns an ObjectNotFound error appropriate for the case where this
    /// lookup failed
    pub fn into_not_found(self, type_name: ResourceType) -> Error {
        Error::ObjectNotFound { type_name, lookup_type: self }
    }
}

impl From<Uuid> for LookupType {
    fn from(uuid: Uuid) -> Self {
        LookupType::ById(uuid)
    }
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably be
    /// retried
    pub fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable { .. } => true,

            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::Conflict { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. }
            | Error::InsufficientCapacity { .. }
            | Error::InternalError { .. } => false,
        }
    }

    /// Generates an [`Error::ObjectNotFound`] error for a lookup by object id.
    pub fn not_found_by_id(type_name: ResourceType, id: &Uuid) -> Error {
        LookupType::ById(*id).into_not_found(type_name)
    }

    /// Generates an [`Error::InternalError`] error with the specific message
    ///
    /// InternalError should be used for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g., the
    /// ledger and the prefix allocator disagreeing about a reservation).
    pub fn internal_error(internal_message: &str) -> Error {
        Error::InternalError { internal_message: internal_message.to_owned() }
    }

    /// Generates an [`Error::InvalidRequest`] error with the specific message
    ///
    /// This should be used for failures due possibly to invalid client input
    /// or malformed requests.
    pub fn invalid_request(message: impl Into<String>) -> Error {
        Error::InvalidRequest { message: message.into() }
    }

    /// Generates an [`Error::InvalidValue`] error for the named input field
    pub fn invalid_value(
        label: impl Into<String>,
        message: impl Into<String>,
    ) -> Error {
        Error::InvalidValue { label: label.into(), message: message.into() }
    }

    /// Generates an [`Error::Conflict`] error with the specific message
    pub fn conflict(message: impl Into<String>) -> Error {
        Error::Conflict { message: message.into() }
    }

    /// Generates an [`Error::InsufficientCapacity`] error
    pub fn insufficient_capacity(
        external_message: impl Into<String>,
        internal_message: impl Into<String>,
    ) -> Error {
        Error::InsufficientCapacity {
            external_message: external_message.into(),
            internal_message: internal_message.into(),
        }
    }

    /// Generates an [`Error::ServiceUnavailable`] error with the specific
    /// message
    ///
    /// This should be used for transient failures where the caller might be
    /// expected to retry.  Logic errors or other problems indicating that a
    /// retry would not work should probably be an InternalError (if it's a
    /// server problem) or InvalidRequest (if it's a client problem) instead.
    pub fn unavail(message: &str) -> Error {
        Error::ServiceUnavailable { internal_message: message.to_owned() }
    }

    /// Given an [`Error`] with an internal message, return the same error with
    /// `context` prepended to it to provide more context
    ///
    /// If the error has no internal message, then it is returned unchanged.
    pub fn internal_context<C>(self, context: C) -> Error
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Error::ObjectNotFound { .. }
            | Error::ObjectAlreadyExists { .. }
            | Error::Conflict { .. }
            | Error::InvalidRequest { .. }
            | Error::InvalidValue { .. } => self,
            Error::InsufficientCapacity {
                external_message,
                internal_message,
            } => Error::InsufficientCapacity {
                external_message,
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::InternalError { internal_message } => Error::InternalError {
                internal_message: format!("{}: {}", context, internal_message),
            },
            Error::ServiceUnavailable { internal_message } => {
                Error::ServiceUnavailable {
                    internal_message: format!(
                        "{}: {}",
                        context, internal_message
                    ),
                }
            }
        }
    }
}

impl From<Error> for HttpError {
    /// Converts an `Error` error into an `HttpError`.  This defines how
    /// errors that are represented internally using `Error` are ultimately
    /// exposed to clients over HTTP.
    fn from(error: Error) -> HttpError {
        match error {
            Error::ObjectNotFound { type_name: t, lookup_type: lt } => {
                let LookupType::ById(id) = lt;
                let message = format!("not found: {} with id \"{}\"", t, id);
                HttpError::for_client_error(
                    Some(String::from("ObjectNotFound")),
                    ClientErrorStatusCode::NOT_FOUND,
                    message,
                )
            }

            Error::ObjectAlreadyExists { type_name: t, object_name: n } => {
                let message = format!("already exists: {} \"{}\"", t, n);
                HttpError::for_client_error(
                    Some(String::from("ObjectAlreadyExists")),
                    ClientErrorStatusCode::CONFLICT,
                    message,
                )
            }

            Error::Conflict { message } => HttpError::for_client_error(
                Some(String::from("Conflict")),
                ClientErrorStatusCode::CONFLICT,
                message,
            ),

            Error::InvalidRequest { message } => {
                HttpError::for_bad_request(
                    Some(String::from("InvalidRequest")),
                    message,
                )
            }

            Error::InvalidValue { label, message } => {
                let message =
                    format!("unsupported value for \"{}\": {}", label, message);
                HttpError::for_bad_request(
                    Some(String::from("InvalidValue")),
                    message,
                )
            }

            Error::InsufficientCapacity {
                external_message,
                internal_message,
            } => {
                let mut error = HttpError::for_client_error(
                    Some(String::from("InsufficientCapacity")),
                    ClientErrorStatusCode::BAD_REQUEST,
                    external_message,
                );
                error.internal_message = internal_message;
                error
            }

            Error::InternalError { internal_message } => {
                HttpError::for_internal_error(internal_message)
            }

            Error::ServiceUnavailable { internal_message } => {
                HttpError::for_unavail(
                    Some(String::from("ServiceNotAvailable")),
                    internal_message,
                )
            }
        }
    }
}

/// Like [`assert!`], except that instead of panicking, this function returns an
/// `Err(Error::InternalError)` with an appropriate message if the given
/// condition is not true.
#[macro_export]
macro_rules! bail_unless {
    ($cond:expr $(,)?) => {
        bail_unless!($cond, "failed runtime check: {:?}", stringify!($cond))
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            Err($crate::api::external::Error::internal_error(&format!(
                $($arg)*)))?;
        }
    };
}

/// Implements a pattern similar to `anyhow::Context` for providing extra
/// context for internal error messages
///
/// # Examples
///
/// ```
/// use ironplane_common::api::external::Error;
/// use ironplane_common::api::external::InternalContext;
///
/// let error: Result<(), Error> = Err(Error::internal_error("boom"));
/// assert_eq!(
///     error.internal_context("uh-oh").unwrap_err().to_string(),
///     "Internal Error: uh-oh: boom"
/// );
/// ```
pub trait InternalContext<T> {
    fn internal_context<C>(self, s: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    fn with_internal_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> InternalContext<T> for Result<T, Error> {
    fn internal_context<C>(self, context: C) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        self.map_err(|error| error.internal_context(context))
    }

    fn with_internal_context<C, F>(self, make_context: F) -> Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|error| error.internal_context(make_context()))
    }
}
