//! Archive discovery from the Receita directory listing
//!
//! The dataset is published as an Apache-style index: one `YYYY-MM/`
//! directory per monthly period, each holding the period's ZIP archives.

use chrono::Utc;
use regex::Regex;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

use super::config::EtlConfig;
use super::{IngestError, Result};

const USER_AGENT: &str = "cnpj-etl/0.1";

/// Reads period and archive listings over HTTP
#[derive(Clone)]
pub struct ArchiveCatalog {
    base_url: String,
    client: Client,
}

impl ArchiveCatalog {
    pub fn new(config: &EtlConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn period_url(&self, period: &str) -> String {
        format!("{}/{}/", self.base_url, period)
    }

    /// Absolute URLs of every ZIP listed for `period`, sorted and de-duplicated.
    ///
    /// Transport and HTTP-status failures are logged and produce an empty list.
    pub async fn list_archives(&self, period: &str) -> Vec<String> {
        let url = self.period_url(period);
        info!(period, url = %url, "Listing archives");

        let html = match self.fetch_listing(&url).await {
            Ok(html) => html,
            Err(e) => {
                error!(period, url = %url, error = %e, "Failed to list archives");
                return Vec::new();
            },
        };

        match parse_archive_links(&html, &url) {
            Ok(archives) => {
                info!(period, count = archives.len(), "Archives discovered");
                archives
            },
            Err(e) => {
                error!(period, error = %e, "Failed to parse archive listing");
                Vec::new()
            },
        }
    }

    /// Periods (`YYYY-MM`) present in the base listing, oldest first
    pub async fn list_periods(&self) -> Result<Vec<String>> {
        let url = format!("{}/", self.base_url);
        let html = self.fetch_listing(&url).await?;
        let periods = parse_period_links(&html)?;
        debug!(count = periods.len(), "Periods discovered");
        Ok(periods)
    }

    /// Newest listed period, or the current UTC month when nothing is listed
    pub async fn latest_period(&self) -> String {
        match self.list_periods().await {
            Ok(periods) => {
                if let Some(latest) = periods.last() {
                    return latest.clone();
                }
            },
            Err(e) => error!(error = %e, "Failed to list periods"),
        }

        let fallback = current_period();
        info!(period = %fallback, "No period listed, using current month");
        fallback
    }

    async fn fetch_listing(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }
}

pub fn current_period() -> String {
    Utc::now().format("%Y-%m").to_string()
}

fn link_selector() -> Result<Selector> {
    Selector::parse("a[href]").map_err(|e| IngestError::Catalog(e.to_string()))
}

/// Extract `.zip` links from a listing page, resolved against `page_url`
pub fn parse_archive_links(html: &str, page_url: &str) -> Result<Vec<String>> {
    let base = Url::parse(page_url).map_err(|e| IngestError::Catalog(e.to_string()))?;
    let document = Html::parse_document(html);
    let selector = link_selector()?;

    let mut archives = BTreeSet::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !href.to_ascii_lowercase().ends_with(".zip") {
            continue;
        }
        match base.join(href) {
            Ok(url) => {
                archives.insert(url.to_string());
            },
            Err(e) => debug!(href, error = %e, "Skipping unresolvable link"),
        }
    }

    Ok(archives.into_iter().collect())
}

/// Extract `YYYY-MM/` directory links from the base listing
pub fn parse_period_links(html: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let selector = link_selector()?;
    let pattern = Regex::new(r"^(\d{4}-\d{2})/?$")?;

    let periods: BTreeSet<String> = document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| pattern.captures(href).map(|c| c[1].to_string()))
        .collect();

    Ok(periods.into_iter().collect())
}
