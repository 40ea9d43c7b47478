use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::config::{DEFAULT_USER_AGENT, MirrorConfig, SiteTarget};
use crate::error::MirrorError;
use crate::record::{AttachmentRecord, FIELD_DOWNLOAD_URL, FieldValue, PageRecord};
use crate::xmlrpc::{RpcValue, decode_response, encode_call, rpc_struct};

/// Read operations the sync engine needs from a wiki service.
pub trait WikiRemote {
    fn list_all_page_names(&mut self, site: &str, order_by_updated_desc: bool)
    -> Result<Vec<String>>;
    fn fetch_page(&mut self, site: &str, raw_name: &str) -> Result<PageRecord>;
    /// Page fields without `content`/`html`; enough to decide freshness.
    fn fetch_page_meta(&mut self, site: &str, raw_name: &str) -> Result<PageRecord>;
    fn list_attachments(&mut self, site: &str, raw_name: &str) -> Result<Vec<String>>;
    fn fetch_attachment_meta(
        &mut self,
        site: &str,
        raw_name: &str,
        attachment: &str,
    ) -> Result<AttachmentRecord>;
    fn download_bytes(&mut self, url: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct WikidotClientConfig {
    pub endpoint: String,
    pub site: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl WikidotClientConfig {
    pub fn for_target(target: &SiteTarget, config: &MirrorConfig) -> Self {
        Self::for_target_with_lookup(target, config, |key| env::var(key).ok())
    }

    pub fn for_target_with_lookup<F>(target: &SiteTarget, config: &MirrorConfig, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = &config.wikidot;
        Self {
            endpoint: target.endpoint.clone(),
            site: target.site.clone(),
            api_key: target.api_key.clone(),
            user_agent: lookup_env("WIKIMIRROR_USER_AGENT")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| section.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: env_number(&lookup_env, "WIKIMIRROR_HTTP_TIMEOUT_MS")
                .or(section.timeout_ms)
                .unwrap_or(30_000),
            rate_limit_ms: env_number(&lookup_env, "WIKIMIRROR_RATE_LIMIT_MS")
                .or(section.rate_limit_ms)
                .unwrap_or(250),
            max_retries: env_number(&lookup_env, "WIKIMIRROR_HTTP_RETRIES")
                .or(section.max_retries)
                .unwrap_or(0),
            retry_delay_ms: env_number(&lookup_env, "WIKIMIRROR_HTTP_RETRY_DELAY_MS")
                .or(section.retry_delay_ms)
                .unwrap_or(500),
        }
    }
}

/// XML-RPC client for the Wikidot API, authenticated per site.
pub struct WikidotClient {
    client: Client,
    config: WikidotClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl WikidotClient {
    pub fn new(config: WikidotClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Wikidot HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn call(&mut self, method: &str, params: &[RpcValue]) -> Result<RpcValue> {
        let body = encode_call(method, params)?;

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            debug!(method, attempt, "xml-rpc call");
            let response = self
                .client
                .post(&self.config.endpoint)
                .basic_auth(&self.config.site, Some(&self.config.api_key))
                .header(CONTENT_TYPE, "text/xml")
                .body(body.clone())
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        return Err(MirrorError::Transport(format!(
                            "{method} failed with HTTP {status}"
                        ))
                        .into());
                    }
                    let text = response.text().map_err(|error| {
                        MirrorError::Transport(format!("failed to read {method} response: {error}"))
                    })?;
                    return decode_response(&text)
                        .with_context(|| format!("{method} call failed"));
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(MirrorError::Transport(format!(
                        "failed to call {method}: {error}"
                    ))
                    .into());
                }
            }
        }

        bail!(MirrorError::Transport(format!(
            "{method} exhausted retry budget"
        )))
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        warn!(attempt, "retrying Wikidot request");
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl WikiRemote for WikidotClient {
    fn list_all_page_names(
        &mut self,
        site: &str,
        order_by_updated_desc: bool,
    ) -> Result<Vec<String>> {
        let mut query = vec![("site", RpcValue::string(site))];
        if order_by_updated_desc {
            query.push(("order", RpcValue::string("updated_at desc")));
        }
        let response = self.call("pages.select", &[rpc_struct(query)])?;
        Ok(string_list(&response, "pages.select")?)
    }

    fn fetch_page(&mut self, site: &str, raw_name: &str) -> Result<PageRecord> {
        let response = self.call(
            "pages.get_one",
            &[rpc_struct([
                ("site", RpcValue::string(site)),
                ("page", RpcValue::string(raw_name)),
            ])],
        )?;
        Ok(record_from_struct(&response, "pages.get_one")?)
    }

    fn fetch_page_meta(&mut self, site: &str, raw_name: &str) -> Result<PageRecord> {
        let response = self.call(
            "pages.get_meta",
            &[rpc_struct([
                ("site", RpcValue::string(site)),
                ("pages", RpcValue::strings([raw_name])),
            ])],
        )?;
        let only_entry = match &response {
            RpcValue::Struct(entries) if entries.len() == 1 => Some(&entries[0].1),
            _ => None,
        };
        let meta = response.member(raw_name).or(only_entry).ok_or_else(|| {
            MirrorError::Protocol(format!("pages.get_meta returned nothing for {raw_name}"))
        })?;
        Ok(record_from_struct(meta, "pages.get_meta")?)
    }

    fn list_attachments(&mut self, site: &str, raw_name: &str) -> Result<Vec<String>> {
        let response = self.call(
            "files.select",
            &[rpc_struct([
                ("site", RpcValue::string(site)),
                ("page", RpcValue::string(raw_name)),
            ])],
        )?;
        Ok(string_list(&response, "files.select")?)
    }

    fn fetch_attachment_meta(
        &mut self,
        site: &str,
        raw_name: &str,
        attachment: &str,
    ) -> Result<AttachmentRecord> {
        let response = self.call(
            "files.get_meta",
            &[rpc_struct([
                ("site", RpcValue::string(site)),
                ("page", RpcValue::string(raw_name)),
                ("files", RpcValue::strings([attachment])),
            ])],
        )?;
        Ok(attachment_from_response(&response, attachment)?)
    }

    fn download_bytes(&mut self, url: &str) -> Result<Vec<u8>> {
        self.apply_rate_limit();
        debug!(url, "downloading attachment");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|error| MirrorError::Transport(format!("failed to download {url}: {error}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(
                MirrorError::Transport(format!("download of {url} failed with HTTP {status}")).into(),
            );
        }
        let bytes = response
            .bytes()
            .map_err(|error| MirrorError::Transport(format!("failed to read {url}: {error}")))?;
        Ok(bytes.to_vec())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn string_list(value: &RpcValue, method: &str) -> Result<Vec<String>, MirrorError> {
    let RpcValue::Array(items) = value else {
        return Err(MirrorError::Protocol(format!(
            "{method} returned {} instead of an array",
            value.type_name()
        )));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                MirrorError::Protocol(format!(
                    "{method} returned a {} entry instead of a string",
                    item.type_name()
                ))
            })
        })
        .collect()
}

/// Flatten an XML-RPC struct into an ordered record.
fn record_from_struct(value: &RpcValue, method: &str) -> Result<PageRecord, MirrorError> {
    let RpcValue::Struct(members) = value else {
        return Err(MirrorError::Protocol(format!(
            "{method} returned {} instead of a struct",
            value.type_name()
        )));
    };
    let mut record = PageRecord::new();
    for (name, member) in members {
        match field_value(member) {
            Some(field) => record.insert(name.clone(), field),
            None => debug!(method, field = %name, "skipping nested struct field"),
        }
    }
    Ok(record)
}

fn field_value(value: &RpcValue) -> Option<FieldValue> {
    match value {
        RpcValue::Nil => Some(FieldValue::Null),
        RpcValue::Array(items) => Some(FieldValue::List(
            items.iter().filter_map(scalar_text).collect(),
        )),
        RpcValue::Struct(_) => None,
        scalar => scalar_text(scalar).map(FieldValue::Text),
    }
}

fn scalar_text(value: &RpcValue) -> Option<String> {
    match value {
        RpcValue::Bool(flag) => Some(flag.to_string()),
        RpcValue::Int(number) => Some(number.to_string()),
        RpcValue::Double(number) => Some(number.to_string()),
        RpcValue::String(text) | RpcValue::DateTime(text) | RpcValue::Base64(text) => {
            Some(text.clone())
        }
        RpcValue::Nil | RpcValue::Array(_) | RpcValue::Struct(_) => None,
    }
}

/// `files.get_meta` answers with a struct keyed by file name; exactly one entry is expected.
fn attachment_from_response(
    response: &RpcValue,
    attachment: &str,
) -> Result<AttachmentRecord, MirrorError> {
    let RpcValue::Struct(entries) = response else {
        return Err(MirrorError::Protocol(format!(
            "files.get_meta returned {} instead of a struct",
            response.type_name()
        )));
    };
    let [(_, meta)] = entries.as_slice() else {
        return Err(MirrorError::Protocol(format!(
            "files.get_meta returned {} entries for {attachment}",
            entries.len()
        )));
    };
    let metadata = record_from_struct(meta, "files.get_meta")?;
    let download_url = metadata
        .text(FIELD_DOWNLOAD_URL)
        .ok_or_else(|| {
            MirrorError::Protocol(format!("files.get_meta has no download_url for {attachment}"))
        })?
        .to_string();
    Ok(AttachmentRecord {
        name: attachment.to_string(),
        download_url,
        metadata,
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

fn env_number<F, T>(lookup_env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup_env(key).and_then(|value| value.trim().parse::<T>().ok())
}
