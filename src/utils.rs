use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use url::Url;

pub static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime")
});

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Push endpoint on the same host as the API: `ws(s)://host[:port]/ws`.
/// The credential is appended per connection, never stored in the endpoint.
pub fn push_endpoint(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(&normalize_url(base_url))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(Error::Config(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive push endpoint from {base_url}")))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
