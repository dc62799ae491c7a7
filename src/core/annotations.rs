//! Per-route metadata carried by every matcher.
//!
//! Annotations on the declaring object are kept verbatim for plugins and are
//! also parsed up front into typed [`RouteSettings`], so a malformed value is
//! caught during reconciliation instead of on the request path.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use thiserror::Error;

use crate::ports::cluster::ObjectRef;

/// Annotation prefix understood by the basic-auth plugin.
pub const BASIC_AUTH_PREFIX: &str = "basicauth.kingress.io/";
pub const BASIC_AUTH_REQUIRE: &str = "basicauth.kingress.io/require-auth";
pub const BASIC_AUTH_EXPECTED_HEADER: &str = "basicauth.kingress.io/expected-auth-header";
pub const BASIC_AUTH_CREDENTIALS: &str = "basicauth.kingress.io/credentials";
pub const BASIC_AUTH_REALM: &str = "basicauth.kingress.io/realm";

const BASIC_AUTH_KEYS: [&str; 4] = [
    BASIC_AUTH_REQUIRE,
    BASIC_AUTH_EXPECTED_HEADER,
    BASIC_AUTH_CREDENTIALS,
    BASIC_AUTH_REALM,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AnnotationError {
    #[error("Unknown annotation '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for annotation '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Annotation '{key}' requires one of: {required}")]
    MissingValue { key: String, required: String },
}

/// Validated metadata of the object a route was declared on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMetadata {
    pub owner: ObjectRef,
    pub annotations: BTreeMap<String, String>,
    pub settings: RouteSettings,
}

impl RouteMetadata {
    pub fn from_annotations(
        owner: ObjectRef,
        annotations: BTreeMap<String, String>,
    ) -> Result<Self, AnnotationError> {
        let settings = RouteSettings::from_annotations(&annotations)?;
        Ok(Self {
            owner,
            annotations,
            settings,
        })
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSettings {
    /// Present when the route requires HTTP basic authentication
    pub basic_auth: Option<BasicAuthSettings>,
}

impl RouteSettings {
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Self, AnnotationError> {
        if let Some(unknown) = annotations
            .keys()
            .find(|key| key.starts_with(BASIC_AUTH_PREFIX) && !BASIC_AUTH_KEYS.contains(&key.as_str()))
        {
            return Err(AnnotationError::UnknownKey(unknown.clone()));
        }

        Ok(Self {
            basic_auth: BasicAuthSettings::from_annotations(annotations)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthSettings {
    /// Full `Authorization` header value a request must present
    pub expected_header: String,
    pub realm: String,
}

impl BasicAuthSettings {
    fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, AnnotationError> {
        let Some(required) = annotations.get(BASIC_AUTH_REQUIRE) else {
            return Ok(None);
        };
        if !parse_bool(BASIC_AUTH_REQUIRE, required)? {
            return Ok(None);
        }

        let expected_header = match (
            annotations.get(BASIC_AUTH_EXPECTED_HEADER),
            annotations.get(BASIC_AUTH_CREDENTIALS),
        ) {
            (Some(header), _) if !header.trim().is_empty() => header.trim().to_string(),
            (_, Some(credentials)) => encode_credentials(credentials)?,
            _ => {
                return Err(AnnotationError::MissingValue {
                    key: BASIC_AUTH_REQUIRE.to_string(),
                    required: format!("{BASIC_AUTH_EXPECTED_HEADER}, {BASIC_AUTH_CREDENTIALS}"),
                });
            }
        };

        Ok(Some(Self {
            expected_header,
            realm: annotations.get(BASIC_AUTH_REALM).cloned().unwrap_or_default(),
        }))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AnnotationError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(AnnotationError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected 'true' or 'false'".to_string(),
        }),
    }
}

fn encode_credentials(credentials: &str) -> Result<String, AnnotationError> {
    match credentials.split_once(':') {
        Some((user, _)) if !user.is_empty() => Ok(format!("Basic {}", STANDARD.encode(credentials))),
        _ => Err(AnnotationError::InvalidValue {
            key: BASIC_AUTH_CREDENTIALS.to_string(),
            value: "<redacted>".to_string(),
            reason: "expected 'user:password'".to_string(),
        }),
    }
}
