use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use crate::error::Result;
use crate::models::Metadata;

/// Replaces media of a given MIME type with a URL serving a deliverable form.
///
/// The returned URL goes through the whole mediation pipeline again.
#[async_trait]
pub trait Converter: Send + Sync {
    /// `Ok(None)` when the converter does not apply to this media.
    async fn convert(&self, client: &Client, url: &Url, metadata: &Metadata) -> Result<Option<Url>>;
}

/// Points the media at a conversion service through a URL template.
pub struct TemplateConverter {
    template: String,
}

impl TemplateConverter {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

#[async_trait]
impl Converter for TemplateConverter {
    async fn convert(&self, _client: &Client, url: &Url, _metadata: &Metadata) -> Result<Option<Url>> {
        let prefix = self.template.split("{url}").next().unwrap_or_default();
        if !prefix.is_empty() && url.as_str().starts_with(prefix) {
            // already converted
            return Ok(None);
        }

        let encoded: String = url::form_urlencoded::byte_serialize(url.as_str().as_bytes()).collect();
        Ok(Some(Url::parse(&self.template.replace("{url}", &encoded))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        Metadata {
            mime_type: "image/webp".into(),
            size: 20000,
        }
    }

    #[tokio::test]
    async fn rewrites_through_template() {
        let converter = TemplateConverter::new("https://convert.example/jpg?src={url}");
        let source = Url::parse("https://cdn.example/a.webp?x=1").unwrap();

        let converted = converter
            .convert(&Client::new(), &source, &metadata())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            converted.as_str(),
            "https://convert.example/jpg?src=https%3A%2F%2Fcdn.example%2Fa.webp%3Fx%3D1"
        );
    }

    #[tokio::test]
    async fn converted_urls_are_left_alone() {
        let converter = TemplateConverter::new("https://convert.example/jpg?src={url}");
        let source = Url::parse("https://convert.example/jpg?src=abc").unwrap();
        assert!(converter
            .convert(&Client::new(), &source, &metadata())
            .await
            .unwrap()
            .is_none());
    }
}
