use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{ArgMatches, Command};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::core::model::Quality;
use crate::plugins::http::driver::HttpFetcher;
use crate::plugins::http::resolver::TemplateResolver;
use crate::plugins::http::retry::RetryingFetcher;

/// Maps an item to the location of its resource. Pure: no I/O.
pub trait ResourceResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, item_id: &str, quality: Quality) -> anyhow::Result<Url>;
}

/// Body of a (possibly resumed) transfer.
pub struct RangeResponse {
    /// Length of this body, when the server declared one.
    pub declared_len: Option<u64>,
    /// `false` when the server ignored the requested offset and sends the whole resource.
    pub resumed: bool,
    pub body: BoxStream<'static, anyhow::Result<Bytes>>,
}

#[async_trait]
pub trait RangeFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a transfer at `start`. Errors here happen before any byte was delivered.
    async fn fetch(&self, url: &Url, start: u64) -> anyhow::Result<RangeResponse>;
}

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub headers: HashMap<String, String>,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            user_agent: "RecitationDownloader/0.1".to_string(),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub reciter: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com/quran/audio".to_string(),
            reciter: "alafasy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadCliConfig {
    pub driver_ctx: DriverContext,
    pub source: SourceConfig,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_download_command(&self, cmd: Command) -> Command;
    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };
        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::SourceCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg
    }

    pub fn augment_download_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_download_command(c))
    }

    pub fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_download_matches(matches, cfg)
                .with_context(|| format!("{} options", p.name()))?;
        }
        Ok(())
    }

    pub fn resolver(&self, cfg: &DownloadCliConfig) -> anyhow::Result<Arc<dyn ResourceResolver>> {
        let r = TemplateResolver::new(&cfg.source.base_url, &cfg.source.reciter)?;
        Ok(Arc::new(r))
    }

    /// reqwest fetcher wrapped in the connect-phase retry policy.
    pub fn fetcher(&self, cfg: &DownloadCliConfig) -> anyhow::Result<Arc<dyn RangeFetcher>> {
        let http = HttpFetcher::new(cfg.driver_ctx.clone())?;
        Ok(Arc::new(RetryingFetcher::new(http, &cfg.driver_ctx)))
    }
}
