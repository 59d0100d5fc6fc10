//  _      _                        _
// | |  __| | _ __  ___   __ _   __| |  ___  _ __
// | | / _` || '__|/ _ \ / _` | / _` | / _ \| '__|
// | || (_| || |  |  __/| (_| || (_| ||  __/| |
// |_| \__,_||_|   \___| \__,_| \__,_| \___||_|

// Marks Discourse topics as read by replaying the timings API.
// Reads the forum for you!
// I neither care nor am responsible for any damages.

// Copyright 2025 Servus Altissimi (Pseudonym)

// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the "Software"), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

mod config;
mod discourse;
mod error;
mod history;
mod reader;

use std::fs;
use std::io::{stdin, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::{FileConfig, ReadConfig};
use crate::discourse::DiscourseClient;
use crate::error::ReaderError;
use crate::history::ReadHistory;
use crate::reader::{CancelToken, ReadSummary, TopicReader};

const HISTORY_FILE: &str = "read_topics.txt";

#[derive(Parser, Debug)]
#[command(author, version, about = "Discourse auto reader using the timings API", long_about = None)]
struct Args {
    /// Topic URL, e.g. https://linux.do/t/slug/123 (optional with --all-new)
    #[arg(long)]
    topic_url: Option<String>,

    /// Base URL of the Discourse site
    #[arg(long, default_value = "https://linux.do")]
    base_url: String,

    /// Full Cookie header value from a logged-in browser session
    #[arg(long, conflicts_with = "username")]
    cookie: Option<String>,

    /// Account username or email for login
    #[arg(long)]
    username: Option<String>,

    /// Account password for login
    #[arg(long)]
    password: Option<String>,

    /// Read the password from this environment variable instead
    #[arg(long, default_value = "")]
    password_env: String,

    /// Fetch /new topics and auto-read them
    #[arg(long)]
    all_new: bool,

    /// Max topics to read when using --all-new
    #[arg(long, default_value_t = 30)]
    max_topics: usize,

    /// How many /new pages to fetch (page=N)
    #[arg(long, default_value_t = 1)]
    new_pages: u32,

    /// Optional TOML file with pacing settings; CLI flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    base_delay: Option<u64>,

    #[arg(long)]
    random_delay_range: Option<u64>,

    #[arg(long)]
    min_req_size: Option<u32>,

    #[arg(long)]
    max_req_size: Option<u32>,

    #[arg(long)]
    min_read_time: Option<u32>,

    #[arg(long)]
    max_read_time: Option<u32>,

    /// Resume from the server-side read cursor instead of post 1
    #[arg(long)]
    start_from_current: bool,

    #[arg(long)]
    retry_count: Option<u32>,

    /// Delay between topics in milliseconds
    #[arg(long)]
    topic_delay: Option<u64>,

    #[arg(long)]
    user_agent: Option<String>,

    /// Print batches without sending requests
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<ReadConfig> {
    let mut config = ReadConfig::default();
    if let Some(path) = &args.config {
        FileConfig::load(path)?.apply(&mut config);
    }
    if let Some(v) = args.base_delay {
        config.base_delay = v;
    }
    if let Some(v) = args.random_delay_range {
        config.random_delay_range = v;
    }
    if let Some(v) = args.min_req_size {
        config.min_req_size = v;
    }
    if let Some(v) = args.max_req_size {
        config.max_req_size = v;
    }
    if let Some(v) = args.min_read_time {
        config.min_read_time = v;
    }
    if let Some(v) = args.max_read_time {
        config.max_read_time = v;
    }
    if args.start_from_current {
        config.start_from_current = true;
    }
    if let Some(v) = args.retry_count {
        config.retry_count = v;
    }
    if let Some(v) = args.topic_delay {
        config.topic_delay = v;
    }
    if let Some(v) = &args.user_agent {
        config.user_agent = v.clone();
    }
    config.validate()?;
    Ok(config)
}

fn check_first_run_acknowledgment() -> Result<()> {
    const ACK_FILE: &str = ".ldreader_ack";

    if fs::metadata(ACK_FILE).is_ok() {
        return Ok(());
    }

    println!("\n{}", "=".repeat(64));
    println!("TERMS ACKNOWLEDGMENT");
    println!("{}", "=".repeat(64));
    println!("\nAutomated reading may violate the site's rules and can get");
    println!("your account restricted. You alone are responsible for what");
    println!("this tool does with your account.\n");
    println!("{}", "=".repeat(64));
    println!("\nTo continue, type EXACTLY:\n");
    println!("I accept that automated reading may get my account restricted.");
    println!("\n{}", "=".repeat(64));
    print!("\nResponse: ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    stdin().read_line(&mut input)?;

    let expected = "I accept that automated reading may get my account restricted.";
    if input.trim() != expected {
        println!("\n[ERROR] Acknowledgment text does not match. Quitting.");
        std::process::exit(1);
    }

    fs::write(ACK_FILE, "acknowledged")?;
    println!("\n[SUCCESS] Acknowledgment saved. You will not be asked again.\n");

    Ok(())
}

/// Refreshes the CSRF token for the topic, fetches its read state and lets
/// the driver walk it to the end.
async fn read_topic(
    client: &DiscourseClient,
    config: &ReadConfig,
    cancel: &CancelToken,
    topic_url: &str,
    dry_run: bool,
) -> Result<ReadSummary, ReaderError> {
    let topic_id = discourse::parse_topic_id(topic_url)?;
    client.refresh_csrf(topic_url).await?;
    let state = client.fetch_topic_state(topic_url, topic_id).await?;
    let mut reader = TopicReader::new(
        client,
        config,
        StdRng::from_entropy(),
        cancel.clone(),
        dry_run,
    );
    reader.read_topic(topic_id, &state).await
}

async fn read_all_new(
    client: &DiscourseClient,
    config: &ReadConfig,
    cancel: &CancelToken,
    args: &Args,
) -> Result<()> {
    let mut history = ReadHistory::load(HISTORY_FILE)?;
    info!("Loaded {} previously read topics", history.len());

    let mut topics = client.fetch_new_topics(args.new_pages).await?;
    topics.truncate(args.max_topics);
    info!("Fetched {} new topics", topics.len());

    for topic in topics {
        if cancel.is_cancelled() {
            break;
        }
        if history.contains(topic.id) {
            continue;
        }
        let slug = topic.slug.as_deref().unwrap_or("topic");
        let topic_url = client.topic_url(slug, topic.id);

        println!("{}", "=".repeat(64));
        println!("Reading topic: {}", topic_url);

        match read_topic(client, config, cancel, &topic_url, args.dry_run).await {
            Ok(_) => {
                if !args.dry_run {
                    history.record(topic.id, slug)?;
                }
            }
            Err(ReaderError::Interrupted) => break,
            // one bad topic should not end the whole run
            Err(e) => {
                error!("Skipping topic {}: {}", topic.id, e);
                continue;
            }
        }

        sleep(Duration::from_millis(config.topic_delay)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "ldreader=debug"
    } else {
        "ldreader=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    check_first_run_acknowledgment()?;

    if args.topic_url.is_none() && !args.all_new {
        bail!("Provide --topic-url or use --all-new.");
    }
    if args.cookie.is_none() && args.username.is_none() {
        bail!("Provide --cookie or --username/--password for login.");
    }

    let config = build_config(&args)?;

    println!("\n{}", "=".repeat(64));
    println!("   Discourse Auto Reader");
    println!("{}", "=".repeat(64));
    println!("\nBase URL: {}", args.base_url);
    println!(
        "Mode: {}",
        if args.all_new {
            "all new topics"
        } else {
            "single topic"
        }
    );
    println!("Dry run: {}\n", if args.dry_run { "yes" } else { "no" });

    let base_url = args.base_url.trim_end_matches('/').to_string();
    let client = DiscourseClient::new(&base_url, args.cookie.as_deref(), &config.user_agent)?;

    if let Some(username) = &args.username {
        let password = match &args.password {
            Some(p) => p.clone(),
            None if !args.password_env.is_empty() => {
                std::env::var(&args.password_env).unwrap_or_default()
            }
            None => String::new(),
        };
        if password.is_empty() {
            bail!("Password required for login.");
        }
        client.login(username, &password).await?;
        info!("Logged in as {}", username);
    }

    let cancel = CancelToken::default();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping before the next batch");
            watcher.cancel();
        }
    });

    if let Some(topic_url) = &args.topic_url {
        let topic_url = discourse::normalize_topic_url(topic_url)?;
        match read_topic(&client, &config, &cancel, &topic_url, args.dry_run).await {
            Ok(_) => {}
            Err(ReaderError::Interrupted) => {
                println!("Interrupted, progress kept at the last acknowledged batch.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    if args.all_new {
        read_all_new(&client, &config, &cancel, &args).await?;
    }

    println!("Done.");
    Ok(())
}
