use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ArchiveConfig, ConfigError};
use crate::url_utils::normalize_url_for_cli;

/// Command line for archiving a forum.
/// Exit codes: 0=success, 2=invalid arguments, 3=I/O or config error, 4=crawl error
#[derive(Parser, Debug)]
#[command(name = "forum_mirror")]
#[command(about = "Crawl a forum and mirror its threads as JSON and browsable HTML")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, default_value = "logs", help = "Directory for rotated log files")]
    pub log_dir: PathBuf,

    #[arg(long, global = true, help = "Log to stdout only")]
    pub quiet_files: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl a forum and write the archive.
    Crawl(CrawlArgs),

    /// Re-render the HTML mirror and index from the JSON exports of an archive.
    Rebuild {
        #[arg(short, long, default_value = "./archive", help = "Archive directory")]
        output_dir: PathBuf,

        #[arg(short, long, help = "Forum base URL, used to match links between threads")]
        base_url: Option<String>,

        #[arg(long, default_value = "xenforo", help = "Ruleset used for link matching")]
        ruleset: String,

        #[arg(long, help = "Inline mirrored media into thread pages as data URIs")]
        embed_media: bool,
    },

    /// Print a built-in ruleset as JSON, to be edited and passed back with --ruleset <file>.
    Ruleset { name: String },
}

/// Crawl options. Unset options fall back to the config file, then to defaults.
#[derive(Args, Debug, Default)]
pub struct CrawlArgs {
    #[arg(short, long, help = "Forum root to start from")]
    pub base_url: Option<String>,

    #[arg(short, long, help = "Archive directory")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "Maximum link depth from the base URL")]
    pub max_depth: Option<u32>,

    #[arg(short, long, help = "Concurrent page fetches")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "Concurrent media downloads")]
    pub media_concurrency: Option<usize>,

    #[arg(long, help = "Minimum milliseconds between requests to one host")]
    pub rate_limit_ms: Option<u64>,

    #[arg(long = "allow-param", help = "Query parameter that carries page identity (repeatable)")]
    pub allow_params: Vec<String>,

    #[arg(short, long, help = "Built-in ruleset name or path to a ruleset JSON file")]
    pub ruleset: Option<String>,

    #[arg(long, help = "Continue from the checkpoint in the output directory")]
    pub resume: bool,

    #[arg(long, help = "JSON config file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Cookie header value from a logged-in session")]
    pub cookie: Option<String>,

    #[arg(long = "header", help = "Extra request header as \"Name: value\" (repeatable)")]
    pub headers: Vec<String>,

    #[arg(long, help = "Skip media downloads; exports keep remote URLs")]
    pub no_media: bool,

    #[arg(long, help = "Inline mirrored media into thread pages as data URIs")]
    pub embed_media: bool,

    #[arg(short, long, help = "User agent string for requests")]
    pub user_agent: Option<String>,

    #[arg(long, help = "Seconds between checkpoints (0 disables)")]
    pub checkpoint_interval: Option<u64>,
}

impl CrawlArgs {
    /// Config file (if any), overridden by the flags given on the command line.
    pub fn to_config(&self) -> Result<ArchiveConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => ArchiveConfig::from_file(path)?,
            None => ArchiveConfig::default(),
        };

        if let Some(base_url) = &self.base_url {
            config.base_url = normalize_url_for_cli(base_url);
        }
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = output_dir.clone();
        }
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(media_concurrency) = self.media_concurrency {
            config.media_concurrency = media_concurrency;
        }
        if let Some(rate_limit_ms) = self.rate_limit_ms {
            config.rate_limit_per_host_ms = rate_limit_ms;
        }
        if !self.allow_params.is_empty() {
            config.allowed_query_params = self.allow_params.iter().cloned().collect();
        }
        if let Some(ruleset) = &self.ruleset {
            config.ruleset = ruleset.clone();
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        if let Some(interval) = self.checkpoint_interval {
            config.checkpoint_interval_secs = interval;
        }
        if let Some(cookie) = &self.cookie {
            config.session.cookie = Some(cookie.clone());
        }
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .filter(|(name, _)| !name.trim().is_empty())
                .ok_or_else(|| ConfigError::InvalidHeader(header.clone()))?;
            config
                .session
                .headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        config.resume |= self.resume;
        if self.no_media {
            config.download_media = false;
        }
        config.embed_media |= self.embed_media;

        Ok(config)
    }
}

impl Cli {
    /// Parse CLI arguments so the rest of the program can rely on structured options.
    /// On error, clap prints help and exits with code 2 (usage error).
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn crawl_args(cli: Cli) -> CrawlArgs {
        match cli.command {
            Commands::Crawl(args) => args,
            other => panic!("Expected Crawl command, got {:?}", other),
        }
    }

    #[test]
    fn test_crawl_command_minimal() {
        let cli = Cli::try_parse_from(["forum_mirror", "crawl", "--base-url", "forum.test"]).unwrap();
        assert_eq!(cli.log_dir, PathBuf::from("logs"));
        let config = crawl_args(cli).to_config().unwrap();
        assert_eq!(config.base_url, "https://forum.test");
        assert_eq!(config.concurrency, ArchiveConfig::default().concurrency);
        assert!(config.download_media);
        assert!(!config.embed_media);
        assert!(!config.resume);
    }

    #[test]
    fn test_crawl_command_with_options() {
        let cli = Cli::try_parse_from([
            "forum_mirror",
            "crawl",
            "--base-url",
            "https://forum.test/",
            "--output-dir",
            "/tmp/archive",
            "--max-depth",
            "3",
            "--concurrency",
            "16",
            "--media-concurrency",
            "2",
            "--rate-limit-ms",
            "250",
            "--allow-param",
            "t",
            "--allow-param",
            "page",
            "--ruleset",
            "vbulletin",
            "--resume",
            "--cookie",
            "sid=abc",
            "--header",
            "X-Token: secret",
            "--no-media",
            "--embed-media",
            "--quiet-files",
        ])
        .unwrap();
        assert!(cli.quiet_files);

        let config = crawl_args(cli).to_config().unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/archive"));
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.media_concurrency, 2);
        assert_eq!(config.rate_limit_per_host_ms, 250);
        assert_eq!(config.allowed_query_params.len(), 2);
        assert_eq!(config.ruleset, "vbulletin");
        assert!(config.resume);
        assert!(!config.download_media);
        assert!(config.embed_media);
        assert_eq!(config.session.cookie.as_deref(), Some("sid=abc"));
        assert_eq!(config.session.headers["X-Token"], "secret");
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"baseURL": "https://file.test/", "concurrency": 3, "maxDepth": 2}"#,
        )
        .unwrap();

        let args = CrawlArgs {
            config: Some(path),
            concurrency: Some(5),
            ..CrawlArgs::default()
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.base_url, "https://file.test/");
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.max_depth, 2);
    }

    #[test]
    fn test_bad_header_is_rejected() {
        let args = CrawlArgs {
            headers: vec!["no-colon".to_string()],
            ..CrawlArgs::default()
        };
        assert!(matches!(args.to_config(), Err(ConfigError::InvalidHeader(_))));
    }

    #[test]
    fn test_rebuild_and_ruleset_commands() {
        let cli = Cli::try_parse_from(["forum_mirror", "rebuild", "--output-dir", "./out"]).unwrap();
        match cli.command {
            Commands::Rebuild {
                output_dir,
                base_url,
                ruleset,
                embed_media,
            } => {
                assert_eq!(output_dir, PathBuf::from("./out"));
                assert!(base_url.is_none());
                assert_eq!(ruleset, "xenforo");
                assert!(!embed_media);
            }
            _ => panic!("Expected Rebuild command"),
        }

        let cli = Cli::try_parse_from(["forum_mirror", "ruleset", "phpbb"]).unwrap();
        assert!(matches!(cli.command, Commands::Ruleset { name } if name == "phpbb"));
    }

    #[test]
    fn test_invalid_number_is_usage_error() {
        let err = Cli::try_parse_from(["forum_mirror", "crawl", "--concurrency", "many"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_invalid_command() {
        let cli = Cli::try_parse_from(["forum_mirror", "invalid-command"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_help_does_not_panic() {
        let err = Cli::try_parse_from(["forum_mirror", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
