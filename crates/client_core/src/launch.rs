//! Raw launch parameters and their validation into an [`UploadInput`].

use shared::{
    domain::{Parameters, UploadInput},
    error::InputError,
};
use url::form_urlencoded;

/// Launch parameters exactly as supplied by the host, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchParams {
    pub images: Option<String>,
    pub description: Option<String>,
    pub params: Option<String>,
}

impl LaunchParams {
    /// Parses a query string such as `images=a,b&description=x&params={"seed":1}`.
    /// A leading `?` is ignored. Empty values count as absent.
    pub fn from_query(query: &str) -> Self {
        let query = query.trim().trim_start_matches('?');
        let mut launch = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "images" => launch.images = Some(value),
                "description" => launch.description = Some(value),
                "params" => launch.params = Some(value),
                _ => {}
            }
        }
        launch
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_none() && self.description.is_none() && self.params.is_none()
    }

    pub fn image_urls(&self) -> Vec<String> {
        self.images
            .as_deref()
            .map(split_image_urls)
            .unwrap_or_default()
    }

    /// `Missing` only when nothing at all was supplied; any partial or
    /// unparsable input is `Malformed`.
    pub fn validate(&self) -> Result<UploadInput, InputError> {
        if self.is_empty() {
            return Err(InputError::Missing);
        }

        let image_urls = self.image_urls();
        if image_urls.is_empty() {
            return Err(InputError::Malformed("missing images parameter".into()));
        }

        let description = self
            .description
            .clone()
            .ok_or_else(|| InputError::Malformed("missing description parameter".into()))?;

        let raw_params = self
            .params
            .as_deref()
            .ok_or_else(|| InputError::Malformed("missing params parameter".into()))?;
        let parameters: Parameters = serde_json::from_str(raw_params)
            .map_err(|err| InputError::Malformed(format!("params is not a flat JSON object: {err}")))?;

        UploadInput::new(image_urls, description, parameters)
    }
}

fn split_image_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
