//! URL resolvers run before the metadata probe.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use url::Url;

use crate::error::{AppError, Result};

/// Turns a source link into the URL of the media itself.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn accepts(&self, url: &Url) -> bool;

    async fn resolve(&self, client: &Client, url: &Url) -> Result<Url>;
}

/// Unwraps redirector links, either from a query parameter carrying the target
/// or by following the redirect of a known shortener host.
pub struct RedirectResolver {
    params: Vec<String>,
    hosts: Vec<String>,
}

impl RedirectResolver {
    pub fn new(params: Vec<String>, hosts: Vec<String>) -> Self {
        Self { params, hosts }
    }

    fn target_param(&self, url: &Url) -> Option<Url> {
        url.query_pairs()
            .filter(|(key, _)| self.params.iter().any(|p| p == key))
            .filter_map(|(_, value)| Url::parse(&value).ok())
            .find(|target| matches!(target.scheme(), "http" | "https"))
    }
}

#[async_trait]
impl Resolver for RedirectResolver {
    fn accepts(&self, url: &Url) -> bool {
        host_matches(url, &self.hosts) || self.target_param(url).is_some()
    }

    async fn resolve(&self, client: &Client, url: &Url) -> Result<Url> {
        if let Some(target) = self.target_param(url) {
            return Ok(target);
        }

        let response = client.head(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AppError::status(response.status(), url.as_str()));
        }
        Ok(response.url().clone())
    }
}

/// Scrapes an HTML page for the media it wraps (`og:video`, then `og:image`).
pub struct PageResolver {
    hosts: Vec<String>,
}

impl PageResolver {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

#[async_trait]
impl Resolver for PageResolver {
    fn accepts(&self, url: &Url) -> bool {
        host_matches(url, &self.hosts)
    }

    async fn resolve(&self, client: &Client, url: &Url) -> Result<Url> {
        let response = client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AppError::status(response.status(), url.as_str()));
        }
        let base = response.url().clone();
        let html = response.text().await?;

        ["og:video", "og:image"]
            .iter()
            .find_map(|property| find_meta_content(&html, property))
            .map(|href| base.join(&href))
            .transpose()?
            .ok_or_else(|| AppError::Media(format!("no media found on page {url}")))
    }
}

fn host_matches(url: &Url, hosts: &[String]) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    hosts
        .iter()
        .any(|h| host == h || host.ends_with(&format!(".{h}")))
}

/// Content of `<meta property="..." content="...">`, in either attribute order.
pub fn find_meta_content(html: &str, property: &str) -> Option<String> {
    let property = regex::escape(property);
    let forward = Regex::new(&format!(
        r#"<meta[^>]*property=["']{property}(?::url|:secure_url)?["'][^>]*content=["']([^"']+)["']"#
    ))
    .ok()?;
    let reverse = Regex::new(&format!(
        r#"<meta[^>]*content=["']([^"']+)["'][^>]*property=["']{property}(?::url|:secure_url)?["']"#
    ))
    .ok()?;

    forward
        .captures(html)
        .or_else(|| reverse.captures(html))
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().replace("&amp;", "&"))
}
