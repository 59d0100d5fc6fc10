use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, USER_AGENT};
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::error::{ReaderError, SubmitFailure};
use crate::reader::{TimingsPayload, TimingsSink, TopicState};

static CSRF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"name="csrf-token" content="([^"]+)""#).expect("valid csrf regex")
});

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Authenticated Discourse session. Headers are set once at construction;
/// only the CSRF token is refreshed between topics, never mid-loop.
pub struct DiscourseClient {
    client: Client,
    base_url: Url,
    csrf_token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TopicJson {
    highest_post_number: Option<u32>,
    posts_count: Option<u32>,
    last_read_post_number: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CsrfJson {
    csrf: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginJson {
    error: Option<String>,
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct NewTopicsJson {
    topic_list: Option<TopicListJson>,
}

#[derive(Debug, Deserialize)]
struct TopicListJson {
    #[serde(default)]
    topics: Vec<TopicSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicSummary {
    pub id: u64,
    pub slug: Option<String>,
}

/// Strips query/fragment and trailing slashes from a topic URL.
pub fn normalize_topic_url(topic_url: &str) -> Result<String, ReaderError> {
    let mut url = Url::parse(topic_url)
        .map_err(|_| ReaderError::BadTopicUrl(topic_url.to_string()))?;
    if url.host_str().is_none() {
        return Err(ReaderError::BadTopicUrl(topic_url.to_string()));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string().trim_end_matches('/').to_string())
}

/// Pulls the numeric topic id out of a `/t/slug/123` style URL.
pub fn parse_topic_id(topic_url: &str) -> Result<u64, ReaderError> {
    let url = Url::parse(topic_url)
        .map_err(|_| ReaderError::BadTopicUrl(topic_url.to_string()))?;
    let segments: Vec<&str> = url
        .path()
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    if segments.len() < 3 {
        return Err(ReaderError::BadTopicUrl(topic_url.to_string()));
    }
    segments
        .last()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReaderError::BadTopicUrl(topic_url.to_string()))
}

impl DiscourseClient {
    pub fn new(base_url: &str, cookie: Option<&str>, user_agent: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("Invalid base URL")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent).context("Invalid user agent")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        if let Some(cookie) = cookie {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(cookie).context("Invalid cookie header value")?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            csrf_token: Mutex::new(None),
        })
    }

    pub fn topic_url(&self, slug: &str, topic_id: u64) -> String {
        format!(
            "{}/t/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            slug,
            topic_id
        )
    }

    fn join(&self, path: &str) -> Result<Url, ReaderError> {
        self.base_url
            .join(path)
            .map_err(|_| ReaderError::BadTopicUrl(path.to_string()))
    }

    /// Scrapes the csrf-token meta tag from a rendered page.
    async fn scrape_csrf(&self, page_url: &str) -> Result<String, ReaderError> {
        let response = self.client.get(page_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReaderError::PageLoad {
                url: page_url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        CSRF_REGEX
            .captures(&body)
            .map(|c| c[1].to_string())
            .ok_or(ReaderError::CsrfNotFound)
    }

    /// The JSON endpoint is preferred; older deployments only expose the
    /// meta tag on /login.
    async fn fetch_csrf_for_login(&self) -> Result<String, ReaderError> {
        let url = self.join("/session/csrf.json")?;
        let response = self.client.get(url).send().await?;
        if response.status().is_success() {
            if let Ok(payload) = response.json::<CsrfJson>().await {
                if let Some(token) = payload.csrf {
                    return Ok(token);
                }
            }
        }
        let login_url = self.join("/login")?;
        self.scrape_csrf(login_url.as_str()).await
    }

    /// Refreshes the stored CSRF token from a topic page. Must be called
    /// before submitting timings for that topic.
    pub async fn refresh_csrf(&self, topic_url: &str) -> Result<(), ReaderError> {
        let token = self.scrape_csrf(topic_url).await?;
        *self.csrf_token.lock().expect("csrf lock") = Some(token);
        Ok(())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ReaderError> {
        let csrf_token = self.fetch_csrf_for_login().await?;
        let url = self.join("/session")?;
        let response = self
            .client
            .post(url)
            .form(&[("login", username), ("password", password)])
            .header("X-CSRF-Token", &csrf_token)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReaderError::Login(format!("HTTP {}", status.as_u16())));
        }
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);
        if is_json {
            let payload: LoginJson = response.json().await?;
            if let Some(error) = payload.error {
                return Err(ReaderError::Login(error));
            }
            if let Some(errors) = payload.errors {
                return Err(ReaderError::Login(errors.to_string()));
            }
        }
        Ok(())
    }

    /// Reads the server-side cursor and post count from `{topic_url}.json`.
    pub async fn fetch_topic_state(
        &self,
        topic_url: &str,
        topic_id: u64,
    ) -> Result<TopicState, ReaderError> {
        let json_url = format!("{}.json", topic_url);
        let response = self.client.get(&json_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReaderError::Fetch {
                topic_id,
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        let topic: TopicJson = response.json().await.map_err(|e| ReaderError::Fetch {
            topic_id,
            reason: e.to_string(),
        })?;
        let total_posts = topic
            .highest_post_number
            .filter(|n| *n > 0)
            .or(topic.posts_count.filter(|n| *n > 0))
            .ok_or_else(|| ReaderError::Fetch {
                topic_id,
                reason: "unable to determine total posts from topic JSON".to_string(),
            })?;
        Ok(TopicState {
            last_read: topic.last_read_post_number.filter(|n| *n > 0),
            total_posts,
        })
    }

    /// Flattens `/new.json?page=0..pages` into one topic list.
    pub async fn fetch_new_topics(&self, pages: u32) -> Result<Vec<TopicSummary>, ReaderError> {
        let mut topics = Vec::new();
        for page in 0..pages {
            let url = self.join(&format!("/new.json?page={}", page))?;
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ReaderError::PageLoad {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            let payload: NewTopicsJson = response.json().await?;
            if let Some(list) = payload.topic_list {
                topics.extend(list.topics);
            }
        }
        Ok(topics)
    }
}

#[async_trait]
impl TimingsSink for DiscourseClient {
    async fn submit(&self, payload: &TimingsPayload) -> Result<(), SubmitFailure> {
        let token = self
            .csrf_token
            .lock()
            .expect("csrf lock")
            .clone()
            .ok_or_else(|| SubmitFailure::Fatal("no CSRF token loaded".to_string()))?;
        let url = self
            .join("/topics/timings")
            .map_err(|e| SubmitFailure::Fatal(e.to_string()))?;

        let mut form: Vec<(String, String)> = payload
            .timings
            .iter()
            .map(|(post, dwell)| (format!("timings[{}]", post), dwell.to_string()))
            .collect();
        form.push(("topic_time".to_string(), payload.topic_time.to_string()));
        form.push(("topic_id".to_string(), payload.topic_id.to_string()));

        let response = self
            .client
            .post(url)
            .form(&form)
            .header("X-CSRF-Token", &token)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(|e| SubmitFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SubmitFailure::Transient(format!(
                "HTTP {}",
                status.as_u16()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_query_and_trailing_slash() {
        let url = normalize_topic_url("https://linux.do/t/some-slug/123/?u=me").unwrap();
        assert_eq!(url, "https://linux.do/t/some-slug/123");
    }

    #[test]
    fn normalize_rejects_relative_urls() {
        assert!(matches!(
            normalize_topic_url("/t/some-slug/123"),
            Err(ReaderError::BadTopicUrl(_))
        ));
    }

    #[test]
    fn topic_id_comes_from_the_last_path_segment() {
        assert_eq!(
            parse_topic_id("https://linux.do/t/some-slug/123").unwrap(),
            123
        );
        assert!(parse_topic_id("https://linux.do/t/123").is_err());
        assert!(parse_topic_id("https://linux.do/t/slug/abc").is_err());
    }
}
