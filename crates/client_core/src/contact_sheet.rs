//! Metadata document and HTML contact sheet placed at the root of every bundle.

use serde::Serialize;
use shared::domain::{ContentAddress, Parameters, UploadInput};

use crate::FetchedAsset;

pub const INDEX_FILE_NAME: &str = "index.html";
pub const METADATA_FILE_NAME: &str = "metadata.json";

const STYLE: &str = r#"
    body {
      font-family: -apple-system, BlinkMacSystemFont, 'avenir next', avenir,
        'helvetica neue', helvetica, ubuntu, roboto, noto, 'segoe ui', arial,
        sans-serif;
      margin: 20px;
      background-color: #f4f4f4;
      color: #111111;
    }
    .images a { display: inline-block; }
    .images img { padding: 12px; }
"#;

#[derive(Debug, Clone, Serialize)]
pub struct MetadataDocument<'a> {
    pub description: &'a str,
    pub parameters: &'a Parameters,
}

impl<'a> MetadataDocument<'a> {
    pub fn new(input: &'a UploadInput) -> Self {
        Self {
            description: input.description(),
            parameters: input.parameters(),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Renders the bundle index. Every surviving asset is linked by file name and
/// tagged with its content address in a `data-image-address` attribute.
pub fn render_contact_sheet(
    input: &UploadInput,
    assets: &[FetchedAsset],
    metadata_address: &ContentAddress,
) -> String {
    let images: String = assets
        .iter()
        .map(|asset| {
            let name = escape_html(&asset.file.name);
            format!(
                r#"<a href="{name}" data-image-address="{address}"><img src="{name}" alt="Generated artwork {index}"/></a>"#,
                address = escape_html(asset.content_address.as_str()),
                index = asset.index,
            )
        })
        .collect();

    let parameters: String = input
        .parameters()
        .iter()
        .map(|(key, value)| {
            format!(
                "<dt>{}</dt><dd>{}</dd>",
                escape_html(key),
                escape_html(&value.to_string())
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8"/>
    <style>{STYLE}</style>
  </head>
  <body>
    <h1>Prompt</h1><p>{prompt}</p>
    <h1>Parameters</h1><dl>{parameters}</dl>
    <p><a class="metadata" href="{METADATA_FILE_NAME}" data-metadata-address="{metadata}">metadata</a></p>
    <div class="images">{images}</div>
  </body>
</html>"#,
        prompt = escape_html(input.description()),
        metadata = escape_html(metadata_address.as_str()),
    )
}
