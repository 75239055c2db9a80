use crate::plugins::registry::{CliPlugin, DownloadCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra HTTP header (repeatable), e.g. --header 'Authorization: Bearer xxx'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .default_value("RecitationDownloader/0.1")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("Seconds allowed for connecting, for the response headers and between body chunks")
                .default_value("60")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("Connect retries for transient errors (a broken transfer is never retried)")
                .default_value("2")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Retry backoff base in milliseconds")
                .default_value("400")
                .num_args(1),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.driver_ctx.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
            cfg.driver_ctx.timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retries") {
            cfg.driver_ctx.retries = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retry_backoff_ms") {
            cfg.driver_ctx.retry_backoff_ms = s.parse()?;
        }

        if let Some(values) = matches.get_many::<String>("http_header") {
            for h in values {
                let (k, v) = h
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
                cfg.driver_ctx.headers.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        Ok(())
    }
}

/// Where recitations come from: `--base-url` and `--reciter`.
pub struct SourceCliPlugin;

impl SourceCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for SourceCliPlugin {
    fn name(&self) -> &'static str {
        "source"
    }

    fn augment_download_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("source_base_url")
                .long("base-url")
                .help_heading("Source")
                .help("Audio API base url")
                .default_value("https://api.example.com/quran/audio")
                .num_args(1),
        )
        .arg(
            Arg::new("source_reciter")
                .long("reciter")
                .help_heading("Source")
                .help("Reciter id")
                .default_value("alafasy")
                .num_args(1),
        )
    }

    fn apply_download_matches(&self, matches: &ArgMatches, cfg: &mut DownloadCliConfig) -> anyhow::Result<()> {
        if let Some(s) = matches.get_one::<String>("source_base_url") {
            cfg.source.base_url = s.clone();
        }
        if let Some(s) = matches.get_one::<String>("source_reciter") {
            cfg.source.reciter = s.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::PluginRegistry;

    #[test]
    fn registry_applies_plugin_flags() {
        let reg = PluginRegistry::with_defaults();
        let cmd = reg.augment_download_command(Command::new("download"));
        let m = cmd
            .try_get_matches_from([
                "download",
                "--header",
                "X-Token: abc",
                "--retries",
                "5",
                "--reciter",
                "husary",
            ])
            .unwrap();

        let mut cfg = DownloadCliConfig::default();
        reg.apply_download_matches(&m, &mut cfg).unwrap();

        assert_eq!(cfg.driver_ctx.retries, 5);
        assert_eq!(cfg.driver_ctx.headers.get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(cfg.source.reciter, "husary");
        assert_eq!(cfg.source.base_url, "https://api.example.com/quran/audio");
    }

    #[test]
    fn malformed_header_is_an_error() {
        let reg = PluginRegistry::with_defaults();
        let cmd = reg.augment_download_command(Command::new("download"));
        let m = cmd.try_get_matches_from(["download", "--header", "no-colon"]).unwrap();
        let mut cfg = DownloadCliConfig::default();
        assert!(reg.apply_download_matches(&m, &mut cfg).is_err());
    }
}
