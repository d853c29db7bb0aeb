use std::fmt::Write as _;

use client_core::PresentationState;

/// Terminal text for one presentation state.
pub fn render(state: &PresentationState) -> String {
    match state {
        PresentationState::EmptyInput => "Nothing to publish yet.\n\
             Launch with --query 'images=...&description=...&params=...' \
             or with --images, --description and --params."
            .to_string(),
        PresentationState::MalformedInput(error) => {
            format!("Cannot publish these launch parameters: {}", error.message)
        }
        PresentationState::SignIn { error } => {
            let mut out = String::from("Sign in with your email address to publish.");
            if let Some(error) = error {
                let _ = write!(out, "\nPrevious attempt did not complete: {}", error.message);
            }
            out
        }
        PresentationState::AwaitingVerification { email } => format!(
            "Check the inbox of {email} and follow the verification link.\n\
             Press Ctrl-C to cancel."
        ),
        PresentationState::Confirm {
            email,
            image_urls,
            registered,
        } => {
            let mut out = format!(
                "Signed in as {email}.\nReady to publish {} image(s):",
                image_urls.len()
            );
            for (index, url) in image_urls.iter().enumerate() {
                let _ = write!(out, "\n  {}. {url}", index + 1);
            }
            if !registered {
                out.push_str(
                    "\nWarning: this identity is not registered; the upload service may reject it.",
                );
            }
            out
        }
        PresentationState::Uploading { progress } => {
            format!("Uploading... {}%", progress.percent())
        }
        PresentationState::Published {
            share_url,
            asset_count,
        } => format!("Published {asset_count} image(s).\n{share_url}"),
        PresentationState::UploadFailed(error) => format!("Upload failed: {}", error.message),
        PresentationState::SignedOut => "Signed out. The stored identity was erased.".to_string(),
    }
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
