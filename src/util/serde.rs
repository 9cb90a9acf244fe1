//! Serializable identifiers shared across the coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::CoordinatorError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier (32 lowercase hex characters).
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// Parse and validate an identifier supplied by a caller.
            ///
            /// # Errors
            ///
            /// Returns [`CoordinatorError::BadInput`] unless the input is 32 hex characters.
            pub fn parse(s: &str) -> Result<Self, CoordinatorError> {
                validate_hex_id(s, $label).map(|()| Self(s.to_ascii_lowercase()))
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Opaque tenant identifier.
    TenantId,
    "tenant_id"
);
define_id!(
    /// Identifier of a recorded action.
    ActionId,
    "action_id"
);
define_id!(
    /// Identifier of an uploaded video.
    VideoId,
    "video_id"
);
define_id!(
    /// Identifier of a produced dataset.
    DatasetId,
    "dataset_id"
);
define_id!(
    /// Identifier of a dataset archive request.
    ZipId,
    "zip_id"
);
define_id!(
    /// Identifier of a trained (or training) model.
    ModelId,
    "model_id"
);
define_id!(
    /// Identifier of an interactive tracking session.
    SessionId,
    "session_id"
);

fn validate_hex_id(s: &str, label: &str) -> Result<(), CoordinatorError> {
    if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(CoordinatorError::BadInput(format!("'{s}' is not a valid {label}")))
    }
}

/// Parse a JSON array of identifiers, validating each element.
///
/// # Errors
///
/// Returns [`CoordinatorError::BadInput`] if the text is not a JSON string array
/// or any element is not a valid identifier.
pub fn parse_id_list<T, F>(json: &str, parse: F) -> Result<Vec<T>, CoordinatorError>
where
    F: Fn(&str) -> Result<T, CoordinatorError>,
{
    let raw: Vec<String> = serde_json::from_str(json)
        .map_err(|e| CoordinatorError::BadInput(format!("'{json}' is not a valid id list: {e}")))?;
    raw.iter().map(|s| parse(s)).collect()
}
