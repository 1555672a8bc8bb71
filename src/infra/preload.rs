use async_trait::async_trait;
use reqwest::{Client, Url, header::COOKIE};
use tracing::debug;

use crate::application::repos::{PreloadError, PreloadFetcher};
use crate::config::PreloadSettings;
use crate::domain::resources::GatedResource;

use super::{error::InfraError, upstream::under_base};

/// Warms entries by requesting each resource through the public listener.
///
/// A gated resource is only stored once the request carries an unlock
/// cookie, so deployments usually configure `preload.cookie`.
pub struct HttpPreloadFetcher {
    client: Client,
    base: Url,
    cookie: Option<String>,
}

impl HttpPreloadFetcher {
    pub fn new(settings: &PreloadSettings) -> Result<Self, InfraError> {
        let mut builder =
            Client::builder().user_agent(concat!("ppsc-preload/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base: settings.public_base_url.clone(),
            cookie: settings.cookie.clone(),
        })
    }

    fn url_for(&self, resource: &GatedResource) -> Url {
        under_base(&self.base, &resource.path)
    }
}

#[async_trait]
impl PreloadFetcher for HttpPreloadFetcher {
    async fn fetch(&self, resource: &GatedResource) -> Result<(), PreloadError> {
        let url = self.url_for(resource);
        let mut request = self.client.get(url.clone());
        if let Some(cookie) = self.cookie.as_deref() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await.map_err(|err| PreloadError {
            path: resource.path.clone(),
            message: err.to_string(),
        })?;
        debug!(
            target = "ppsc::infra::preload",
            url = %url,
            status = response.status().as_u16(),
            "preload request completed"
        );
        // Drain the body so the serving path finishes capturing it.
        let _ = response.bytes().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::types::ResourceId;

    #[test]
    fn resource_paths_nest_under_the_base_path() {
        let settings = PreloadSettings {
            public_base_url: Url::parse("https://example.org/blog/").unwrap(),
            cookie: None,
            timeout: Some(Duration::from_secs(3)),
        };
        let fetcher = HttpPreloadFetcher::new(&settings).expect("client");
        let resource = GatedResource {
            id: ResourceId::new(42).unwrap(),
            kind: "page".to_string(),
            status: "publish".to_string(),
            path: "/members/report".to_string(),
        };
        assert_eq!(
            fetcher.url_for(&resource).as_str(),
            "https://example.org/blog/members/report"
        );
    }
}
