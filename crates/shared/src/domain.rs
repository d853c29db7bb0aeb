use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, InputError};

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(ContentAddress);
string_newtype!(Did);

/// Scalar value allowed in the launch `params` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Null,
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Number(value) => write!(f, "{value}"),
            ParamValue::String(value) => f.write_str(value),
            ParamValue::Null => f.write_str("null"),
        }
    }
}

pub type Parameters = BTreeMap<String, ParamValue>;

/// Validated launch input. All three fields are present and non-empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadInput {
    image_urls: Vec<String>,
    description: String,
    parameters: Parameters,
}

impl UploadInput {
    pub fn new(
        image_urls: Vec<String>,
        description: impl Into<String>,
        parameters: Parameters,
    ) -> Result<Self, InputError> {
        let image_urls: Vec<String> = image_urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if image_urls.is_empty() {
            return Err(InputError::Malformed("no image urls supplied".into()));
        }

        let description = description.into();
        if description.trim().is_empty() {
            return Err(InputError::Malformed("description is empty".into()));
        }

        if parameters.is_empty() {
            return Err(InputError::Malformed("parameters document is empty".into()));
        }

        Ok(Self {
            image_urls,
            description,
            parameters,
        })
    }

    pub fn image_urls(&self) -> &[String] {
        &self.image_urls
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub root_address: ContentAddress,
    pub asset_count: usize,
    /// One `AssetFetchFailed` entry per image left out of the bundle.
    #[serde(default)]
    pub omitted: Vec<FlowError>,
}
