//! Externally visible URLs of the gateway.
//!
//! The gateway runs behind a TLS-terminating front end, so every URL handed to a browser
//! is rebuilt as `https://{host}{path}` no matter how the request reached us.

use url::Url;

#[derive(Debug, Clone)]
pub struct ProxyUrl {
    base: Url,
}

impl ProxyUrl {
    /// `host` may carry a port (`proxy.example:8443`) but nothing else.
    pub fn new(host: &str) -> Result<Self, String> {
        if host.is_empty() {
            return Err("proxy host must not be empty".to_string());
        }
        let base = Url::parse(&format!("https://{}", host))
            .map_err(|e| format!("proxy host '{}' is invalid: {}", host, e))?;
        if base.path() != "/" || base.query().is_some() || !base.username().is_empty() {
            return Err(format!("proxy host '{}' must be a bare host[:port]", host));
        }
        Ok(ProxyUrl { base })
    }

    pub fn url_for_path(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }
}
