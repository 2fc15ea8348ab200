//! fOS Shields: request filter inspector
//!
//! Loads the shields engine the way the browser does and runs request
//! descriptions through every filtering phase, printing the verdicts.
//!
//! Usage:
//!   fos-shields [--config FILE] [--refresh] [--status] URL[@FIRST_PARTY][#TYPE]...

use anyhow::{Context, Result, bail};
use fos_shields::{
    AggregatedVerdict, HttpFetcher, JsonStateStore, MemorySettings, NetworkHooks, PartitionId, Phase,
    RequestDetails, ResourceType, ShieldsConfig, ShieldsEngine,
};
use hyper::header::HeaderMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    refresh: bool,
    status: bool,
    requests: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = argv.next().context("--config needs a file")?;
                args.config = Some(PathBuf::from(path));
            }
            "--refresh" => args.refresh = true,
            "--status" => args.status = true,
            flag if flag.starts_with('-') => bail!("unknown flag {}", flag),
            _ => args.requests.push(arg),
        }
    }
    Ok(args)
}

/// `URL[@FIRST_PARTY][#TYPE]`; the type defaults to a guess from the path
fn parse_request(id: u64, spec: &str) -> Result<RequestDetails> {
    let (rest, resource_type) = match spec.rsplit_once('#') {
        Some((rest, ty)) => (rest, Some(ty.parse::<ResourceType>().map_err(anyhow::Error::msg)?)),
        None => (spec, None),
    };
    let (url, first_party) = match rest.split_once('@') {
        Some((url, first_party)) => (url, Some(first_party)),
        None => (rest, None),
    };

    let resource_type = resource_type.unwrap_or_else(|| match first_party {
        None => ResourceType::MainFrame,
        Some(_) => ResourceType::from_accept_or_path(None, url),
    });
    let mut details = RequestDetails::new(id, url, resource_type);
    if let Some(first_party) = first_party {
        details = details.with_first_party(first_party);
    }
    Ok(details)
}

/// Stands in for the browser's session hooks
struct LoggingHooks;

impl NetworkHooks for LoggingHooks {
    fn install(&self, partition: &PartitionId, phase: Phase) {
        debug!("Hook installed for {} on {}", phase, partition.as_str());
    }
}

fn print_verdict(phase: Phase, verdict: &AggregatedVerdict) {
    if verdict.is_pass_through() {
        println!("  {:<18} pass", phase.to_string());
        return;
    }
    if let Some(stage) = &verdict.cancelled_by {
        println!("  {:<18} cancel ({})", phase.to_string(), stage);
    }
    if let (Some(url), Some(stage)) = (&verdict.redirect_url, &verdict.redirected_by) {
        println!("  {:<18} redirect to {} ({})", phase.to_string(), url, stage);
    }
    let headers = verdict.request_headers.iter().chain(verdict.response_headers.iter());
    for headers in headers {
        for (name, value) in headers {
            println!(
                "  {:<18} {}: {}",
                phase.to_string(),
                name,
                value.to_str().unwrap_or("<binary>")
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => ShieldsConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ShieldsConfig::default(),
    };
    info!("Shields data in {}", config.user_data_dir.display());

    let store = Arc::new(JsonStateStore::open(config.resource_state_path()));
    let fetcher = HttpFetcher::new(config.fetch.clone());
    let settings = Arc::new(MemorySettings::new());
    let engine = ShieldsEngine::with_hooks(config, settings, fetcher, store, Arc::new(LoggingHooks))?;

    let handles = if args.refresh {
        engine.refresh(true)
    } else {
        engine.start()
    };
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Data file not loaded: {}", e),
            Err(e) => warn!("Load task failed: {}", e),
        }
    }

    for (id, spec) in args.requests.iter().enumerate() {
        let details = parse_request(id as u64 + 1, spec)?;
        println!("{} [{}]", details.url, details.resource_type);

        let before = engine.on_before_request(&details);
        print_verdict(Phase::BeforeRequest, &before);
        if before.cancel || before.redirect_url.is_some() {
            continue;
        }
        print_verdict(Phase::BeforeSendHeaders, &engine.on_before_send_headers(&details));
        print_verdict(
            Phase::HeadersReceived,
            &engine.on_headers_received(&details, &HeaderMap::new()),
        );
    }

    if args.status {
        println!("{}", serde_json::to_string_pretty(&engine.status())?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let details = parse_request(1, "https://ads.com/a.js@https://news.com/").unwrap();
        assert_eq!(details.url, "https://ads.com/a.js");
        assert_eq!(details.first_party_url.as_deref(), Some("https://news.com/"));
        assert_eq!(details.resource_type, ResourceType::Script);

        let details = parse_request(2, "https://news.com/").unwrap();
        assert!(details.is_main_frame());

        let details = parse_request(3, "https://a.com/x@https://b.com/#subFrame").unwrap();
        assert_eq!(details.resource_type, ResourceType::SubFrame);
        assert!(parse_request(4, "https://a.com/#nonsense").is_err());
    }
}
